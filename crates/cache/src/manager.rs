//! Cache manager: key-to-record maps, identity operations, and bounded
//! eviction.
//!
//! The manager owns the active and zombie partitions (a key lives in at
//! most one of them), the ordered list of owners holding live cache, and
//! the soft entry budget. Eviction runs on every insertion; it prefers
//! reclaiming a zombie and otherwise unloads the least valuable
//! unprotected owner.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use futures::{future, FutureExt};
use tracing::{debug, error, warn};

use crate::config::CacheConfig;
use crate::convert::ConversionRegistry;
use crate::data::{DataKind, PayloadSource};
use crate::error::{CacheError, CacheResult};
use crate::owner::{CacheEvents, CacheKey, OwnerRef};
use crate::record::CacheRecord;
use crate::services::CacheServices;

/// Snapshot of cache usage counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Records currently answering to a key
    pub active_records: usize,
    /// Zero-owner records retained for reuse
    pub zombie_records: usize,
    /// Soft ceiling on resident records
    pub max_entries: usize,
    /// Records created since startup
    pub insertions: u64,
    /// Zombies promoted back to active
    pub zombie_revivals: u64,
    /// Records or footprints reclaimed by the eviction routine
    pub evictions: u64,
}

struct ManagerState {
    active: HashMap<CacheKey, CacheRecord>,
    zombies: HashMap<CacheKey, CacheRecord>,
    /// One slot per owner currently holding live cache; order approximates
    /// insertion recency for the eviction scan.
    live_owners: Vec<OwnerRef>,
    insertions: u64,
    zombie_revivals: u64,
    evictions: u64,
}

/// The cache manager. Clones share the same state.
#[derive(Clone)]
pub struct CacheManager {
    state: Rc<RefCell<ManagerState>>,
    services: Rc<CacheServices>,
    config: CacheConfig,
}

impl CacheManager {
    /// Create a manager wired to its collaborators.
    pub fn new(
        config: CacheConfig,
        registry: Rc<dyn ConversionRegistry>,
        events: Rc<dyn CacheEvents>,
        spawner: LocalSpawner,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(ManagerState {
                active: HashMap::new(),
                zombies: HashMap::new(),
                live_owners: Vec::new(),
                insertions: 0,
                zombie_revivals: 0,
                evictions: 0,
            })),
            services: Rc::new(CacheServices::new(registry, events, spawner)),
            config,
        }
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of active records.
    pub fn num_records(&self) -> usize {
        self.state.borrow().active.len()
    }

    /// Number of zombie records.
    pub fn num_zombies(&self) -> usize {
        self.state.borrow().zombies.len()
    }

    /// The active record under `key`, if any.
    pub fn record(&self, key: &str) -> Option<CacheRecord> {
        self.state.borrow().active.get(key).cloned()
    }

    pub(crate) fn zombie(&self, key: &str) -> Option<CacheRecord> {
        self.state.borrow().zombies.get(key).cloned()
    }

    /// Current usage counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.borrow();
        CacheStats {
            active_records: state.active.len(),
            zombie_records: state.zombies.len(),
            max_entries: self.config.max_entries,
            insertions: state.insertions,
            zombie_revivals: state.zombie_revivals,
            evictions: state.evictions,
        }
    }

    /// Attach `owner`'s data under `key`, creating, reusing, or reviving a
    /// record as needed, then run eviction.
    ///
    /// A zombie found under `key` is promoted back to active with its data
    /// preserved; the caller's payload is released and discarded. Fails an
    /// assertion when `key` is empty or when a brand-new record is created
    /// without payload data.
    pub fn cache_tile(
        &self,
        owner: &OwnerRef,
        key: &str,
        source: Option<PayloadSource>,
        kind: Option<DataKind>,
        level_cutoff: u32,
    ) -> CacheRecord {
        assert!(!key.is_empty(), "cache_tile requires a key");
        let tracked_before = self.is_tracked(owner);

        let active = self.state.borrow().active.get(key).cloned();
        let revivable = if active.is_none() {
            self.state.borrow_mut().zombies.remove(key)
        } else {
            None
        };
        let record = if let Some(record) = active {
            record.attach(owner, source, kind);
            record
        } else if let Some(zombie) = revivable {
            debug!(key, "reviving zombie cache record");
            self.state.borrow_mut().zombie_revivals += 1;
            if zombie.is_destroyed() {
                zombie.revive();
                assert!(
                    source.is_some(),
                    "cache_tile requires payload data for a revived record"
                );
                zombie.attach(owner, source, kind);
            } else {
                // the zombie's data wins; the caller's payload is discarded
                self.discard_source(source, kind);
                zombie.attach(owner, None, None);
            }
            self.state
                .borrow_mut()
                .active
                .insert(key.to_string(), zombie.clone());
            zombie
        } else {
            assert!(
                source.is_some(),
                "cache_tile requires payload data for a new record"
            );
            let record = CacheRecord::new(Rc::clone(&self.services));
            record.attach(owner, source, kind);
            let mut state = self.state.borrow_mut();
            state.active.insert(key.to_string(), record.clone());
            state.insertions += 1;
            record
        };

        self.run_eviction(owner, level_cutoff, tracked_before);
        record
    }

    /// Move a record from `old` to `new` within the partition it occupies.
    ///
    /// Fails with [`CacheError::KeyOccupied`] and mutates nothing when the
    /// destination already holds a record in either partition (a key lives
    /// in at most one of them); every owner of the moved record is notified
    /// of the new key. Does not run eviction.
    pub fn rename_key(&self, old: &str, new: &str) -> CacheResult<()> {
        if self.key_occupied(new) {
            return Err(CacheError::KeyOccupied(new.to_string()));
        }
        let record = {
            let mut state = self.state.borrow_mut();
            if state.active.contains_key(old) {
                Self::rename_in(&mut state.active, old, new)?
            } else {
                Self::rename_in(&mut state.zombies, old, new)?
            }
        };
        debug!(old, new, "cache record renamed");
        for owner in record.owners() {
            owner.notify_key_renamed(old, new);
        }
        Ok(())
    }

    /// Seed a brand-new record under `new_key` with a copy of
    /// `source_key`'s data, optionally coerced toward `desired_kind`.
    ///
    /// Fails an assertion when the source does not exist; resolves with
    /// [`CacheError::KeyOccupied`] when the destination is taken (checked
    /// again after the copy settles).
    pub fn clone_cache(
        &self,
        owner: &OwnerRef,
        source_key: &str,
        new_key: &str,
        desired_kind: Option<DataKind>,
        level_cutoff: u32,
    ) -> LocalBoxFuture<'static, CacheResult<CacheRecord>> {
        let source = self.state.borrow().active.get(source_key).cloned();
        let Some(source) = source else {
            panic!("clone_cache source key {source_key:?} does not exist");
        };
        if self.key_occupied(new_key) {
            return future::ready(Err(CacheError::KeyOccupied(new_key.to_string()))).boxed_local();
        }

        let this = self.clone();
        let owner = Rc::clone(owner);
        let new_key = new_key.to_string();
        async move {
            let payload = source.read(desired_kind, true).await?;
            let Some(payload) = payload else {
                return Err(CacheError::RecordDestroyed);
            };
            let Some(kind) = source.kind() else {
                return Err(CacheError::RecordDestroyed);
            };
            if this.key_occupied(&new_key) {
                // a concurrent insert claimed the key during the copy
                this.services.registry().release(payload, kind);
                return Err(CacheError::KeyOccupied(new_key));
            }
            let record = CacheRecord::new(Rc::clone(&this.services));
            record.attach(&owner, Some(PayloadSource::Ready(payload)), Some(kind));
            let tracked_before = this.is_tracked(&owner);
            {
                let mut state = this.state.borrow_mut();
                state.active.insert(new_key.clone(), record.clone());
                state.insertions += 1;
            }
            this.run_eviction(&owner, level_cutoff, tracked_before);
            Ok(record)
        }
        .boxed_local()
    }

    /// Replace the record at `consumer_key` with the record at
    /// `victim_key`, transferring the consumer's prior owners onto the
    /// victim's identity.
    ///
    /// This is how two tiles that independently produced equivalent data
    /// converge onto one physical record. The triggering `owner` must be
    /// loaded or loading unless `allow_unsettled` is set.
    pub fn consume_cache(
        &self,
        owner: &OwnerRef,
        victim_key: &str,
        consumer_key: &str,
        allow_unsettled: bool,
    ) {
        assert_ne!(victim_key, consumer_key, "consume_cache keys must differ");
        assert!(
            self.state.borrow().active.contains_key(victim_key),
            "consume_cache victim key {victim_key:?} does not exist"
        );
        assert!(
            allow_unsettled || owner.is_loaded() || owner.is_loading(),
            "consume_cache requires a settled owner"
        );

        let consumer = self.state.borrow().active.get(consumer_key).cloned();
        let prior_owners = consumer.map(|c| c.owners()).unwrap_or_default();
        for prior in &prior_owners {
            // destroying here keeps the consumer key free of zombies so the
            // rename below cannot collide
            self.unload_cache_for_key(prior, consumer_key, true, false);
        }

        if let Err(error) = self.rename_key(victim_key, consumer_key) {
            error!(%error, "consume_cache could not rename the victim record");
            return;
        }

        let renamed = self.state.borrow().active.get(consumer_key).cloned();
        if let Some(record) = renamed {
            for prior in prior_owners.iter().filter(|o| o.id() != owner.id()) {
                record.attach(prior, None, None);
            }
        }
    }

    /// Remove every cache footprint belonging to `owner`.
    ///
    /// Records are kept as zombies when the owner opts into retention and
    /// the budget is not already exceeded; otherwise they are destroyed
    /// outright to make room.
    pub fn clear_for(&self, owner: &OwnerRef) {
        let over_budget = self.resident_count() > self.config.max_entries;
        let keep_zombies = owner.retain_as_zombie() && !over_budget;
        if owner.retain_as_zombie() && over_budget {
            debug!(owner = owner.id(), "budget exceeded; zombie retention skipped");
        }
        self.unload(owner, !keep_zombies);
    }

    /// Detach `owner` from the record at `key`. When the reference count
    /// drops to zero the record is destroyed or moved to the zombie
    /// partition; either way the key leaves the active map.
    ///
    /// Fails an assertion (unless `tolerate_missing`) when the key has no
    /// record or the owner was never a dependent of it.
    pub fn unload_cache_for_key(
        &self,
        owner: &OwnerRef,
        key: &str,
        destroy: bool,
        tolerate_missing: bool,
    ) -> bool {
        let record = self.state.borrow().active.get(key).cloned();
        let Some(record) = record else {
            assert!(tolerate_missing, "no cache record under key {key:?}");
            return false;
        };
        let found = record.detach(owner);
        if !found {
            assert!(
                tolerate_missing,
                "owner {} was never attached to the record under key {key:?}",
                owner.id()
            );
            warn!(key, owner = owner.id(), "unload for an owner that was not attached");
            return false;
        }
        if record.owner_count() == 0 {
            {
                let mut state = self.state.borrow_mut();
                state.active.remove(key);
                if !destroy {
                    state.zombies.insert(key.to_string(), record.clone());
                }
            }
            if destroy {
                record.destroy();
                debug!(key, "cache record destroyed");
            } else {
                debug!(key, "cache record moved to the zombie pool");
            }
        }
        true
    }

    /// Unload every cache key associated with `owner`, drop its slot, mark
    /// it unloaded, and emit the unloaded notification.
    pub fn unload(&self, owner: &OwnerRef, destroy: bool) {
        self.drop_owner_footprint(owner, destroy);
        self.state
            .borrow_mut()
            .live_owners
            .retain(|o| o.id() != owner.id());
    }

    /// Destroy every record, active and zombie, and empty the owner list.
    pub fn clear(&self) {
        let (active, zombies) = {
            let mut state = self.state.borrow_mut();
            state.live_owners.clear();
            (
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.zombies),
            )
        };
        for (_, record) in active.into_iter().chain(zombies) {
            record.destroy();
        }
    }

    fn resident_count(&self) -> usize {
        let state = self.state.borrow();
        state.active.len() + state.zombies.len()
    }

    fn key_occupied(&self, key: &str) -> bool {
        let state = self.state.borrow();
        state.active.contains_key(key) || state.zombies.contains_key(key)
    }

    fn is_tracked(&self, owner: &OwnerRef) -> bool {
        self.state
            .borrow()
            .live_owners
            .iter()
            .any(|o| o.id() == owner.id())
    }

    fn rename_in(
        map: &mut HashMap<CacheKey, CacheRecord>,
        old: &str,
        new: &str,
    ) -> CacheResult<CacheRecord> {
        if map.contains_key(new) {
            return Err(CacheError::KeyOccupied(new.to_string()));
        }
        match map.remove(old) {
            Some(record) => {
                map.insert(new.to_string(), record.clone());
                Ok(record)
            }
            None => Err(CacheError::UnknownKey(old.to_string())),
        }
    }

    fn discard_source(&self, source: Option<PayloadSource>, kind: Option<DataKind>) {
        match source {
            Some(PayloadSource::Ready(payload)) => {
                let kind = kind.or_else(|| self.services.registry().guess_kind(&payload));
                if let Some(kind) = kind {
                    self.services.registry().release(payload, kind);
                }
            }
            // neither was ever started; there is nothing to release
            Some(PayloadSource::Deferred(_)) | Some(PayloadSource::Lazy(_)) | None => {}
        }
    }

    /// Unload `owner`'s whole footprint without touching its slot.
    fn drop_owner_footprint(&self, owner: &OwnerRef, destroy: bool) {
        for key in owner.cached_keys() {
            self.unload_cache_for_key(owner, &key, destroy, true);
        }
        owner.reset_to_unloaded();
        self.services.events().owner_unloaded(owner, destroy);
    }

    /// Run the bounded eviction routine, then record `trigger` in the
    /// live-owner list.
    ///
    /// The entry ceiling is soft: when every candidate is protected or
    /// busy nothing is evicted and the routine retries on the next
    /// insertion.
    fn run_eviction(&self, trigger: &OwnerRef, level_cutoff: u32, tracked_before: bool) {
        let mut freed_slot = None;

        if self.resident_count() > self.config.max_entries {
            let zombie = {
                let mut state = self.state.borrow_mut();
                let key = state.zombies.keys().next().cloned();
                key.and_then(|k| state.zombies.remove(&k).map(|record| (k, record)))
            };
            if let Some((key, record)) = zombie {
                // cheapest reclaim: no owner-list work
                debug!(key = %key, "evicting zombie cache record");
                record.destroy();
                self.state.borrow_mut().evictions += 1;
            } else {
                let candidates: Vec<OwnerRef> = self.state.borrow().live_owners.clone();
                let mut worst: Option<(usize, &OwnerRef)> = None;
                for (index, candidate) in candidates.iter().enumerate().rev() {
                    if candidate.id() == trigger.id()
                        || candidate.level() <= level_cutoff
                        || candidate.is_being_drawn()
                        || candidate.is_loading()
                        || candidate.is_processing()
                    {
                        continue;
                    }
                    match worst {
                        None => worst = Some((index, candidate)),
                        Some((_, current)) => {
                            // earlier recency loses; on a tie the deeper
                            // (more detailed) level loses
                            if candidate.last_touched_at() < current.last_touched_at()
                                || (candidate.last_touched_at() == current.last_touched_at()
                                    && candidate.level() > current.level())
                            {
                                worst = Some((index, candidate));
                            }
                        }
                    }
                }
                if let Some((index, victim)) = worst.map(|(i, o)| (i, Rc::clone(o))) {
                    debug!(owner = victim.id(), "evicting owner cache footprint");
                    self.drop_owner_footprint(&victim, true);
                    self.state.borrow_mut().evictions += 1;
                    freed_slot = Some(index);
                }
            }
        }

        let mut state = self.state.borrow_mut();
        match freed_slot {
            // reuse the vacated slot instead of growing the list
            Some(index) if !tracked_before => state.live_owners[index] = Rc::clone(trigger),
            Some(index) => {
                state.live_owners.remove(index);
            }
            None if !tracked_before => state.live_owners.push(Rc::clone(trigger)),
            None => {}
        }
    }
}
