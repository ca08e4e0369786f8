//! Shared cache record with reference counting and a serialized
//! conversion pipeline.
//!
//! A [`CacheRecord`] holds one payload shared by any number of owners.
//! Exactly one settle operation (initial load or conversion) is in flight
//! per record at any time; requests arriving in the meantime are queued and
//! re-checked when they are dequeued. Rendering reads never suspend: they
//! either see committed data or report absence and request a redraw.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{LocalBoxFuture, Shared};
use futures::{future, FutureExt};
use tracing::{debug, error, warn};

use crate::data::{DataKind, DeferredPayload, Payload, PayloadSource};
use crate::error::{CacheError, CacheResult};
use crate::owner::{OwnerId, OwnerRef, RenderBackend, RendererId};
use crate::services::CacheServices;
use crate::simple::SimpleRecord;

/// Result delivered to transform and read waiters: the settled payload, or
/// `None` when the record was destroyed mid-flight.
pub type SettledPayload = CacheResult<Option<Payload>>;

/// The in-flight settle operation. Waiters clone the shared signal; the
/// completing task fires the sender.
struct PendingSettle {
    tx: oneshot::Sender<()>,
    signal: Shared<oneshot::Receiver<()>>,
}

impl PendingSettle {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx,
            signal: rx.shared(),
        }
    }
}

/// A conversion request parked behind the in-flight settle.
struct QueuedJob {
    targets: Vec<DataKind>,
    waiter: oneshot::Sender<SettledPayload>,
}

struct RecordState {
    payload: Option<Payload>,
    kind: Option<DataKind>,
    loaded: bool,
    destroyed: bool,
    pending: Option<PendingSettle>,
    /// Conversion requests waiting for the in-flight settle; drained one
    /// per turn, re-checking compatibility at dequeue time.
    queue: VecDeque<QueuedJob>,
    /// Overwrite parked until the in-flight settle completes. Last writer
    /// wins; a superseded parked overwrite is released.
    parked_overwrite: Option<(Payload, DataKind)>,
    /// Insertion-ordered dependents; length is the reference count.
    owners: Vec<OwnerRef>,
    /// Most recently active owner, resolved against `owners` on use.
    last_owner: Option<OwnerId>,
    /// Per-renderer format copies, created lazily.
    shadows: HashMap<RendererId, SimpleRecord>,
}

/// Cache record shared by any number of owners under one key.
///
/// The handle is cheap to clone; all clones see the same record.
#[derive(Clone)]
pub struct CacheRecord {
    state: Rc<RefCell<RecordState>>,
    services: Rc<CacheServices>,
}

impl std::fmt::Debug for CacheRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRecord").finish_non_exhaustive()
    }
}

impl CacheRecord {
    /// Create an empty record bound to the given services.
    pub fn new(services: Rc<CacheServices>) -> Self {
        Self {
            state: Rc::new(RefCell::new(RecordState {
                payload: None,
                kind: None,
                loaded: false,
                destroyed: false,
                pending: None,
                queue: VecDeque::new(),
                parked_overwrite: None,
                owners: Vec::new(),
                last_owner: None,
                shadows: HashMap::new(),
            })),
            services,
        }
    }

    /// Whether the record holds settled data.
    pub fn is_loaded(&self) -> bool {
        self.state.borrow().loaded
    }

    /// Whether the record has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Current representation, when settled.
    pub fn kind(&self) -> Option<DataKind> {
        self.state.borrow().kind
    }

    /// Current reference count.
    pub fn owner_count(&self) -> usize {
        self.state.borrow().owners.len()
    }

    pub(crate) fn owners(&self) -> Vec<OwnerRef> {
        self.state.borrow().owners.clone()
    }

    pub(crate) fn payload(&self) -> Option<Payload> {
        self.state.borrow().payload.clone()
    }

    /// Future resolving once the in-flight settle completes; already
    /// resolved when nothing is pending.
    pub fn await_settled(&self) -> LocalBoxFuture<'static, ()> {
        let signal = self
            .state
            .borrow()
            .pending
            .as_ref()
            .map(|pending| pending.signal.clone());
        match signal {
            Some(signal) => async move {
                let _ = signal.await;
            }
            .boxed_local(),
            None => future::ready(()).boxed_local(),
        }
    }

    /// Add `owner` as a dependent, optionally supplying data.
    ///
    /// The first attach that brings data establishes the record's content;
    /// a deferred source leaves the record unloaded until it settles. Later
    /// attaches that also supply data are treated as authoritative
    /// overwrites. Attaching without data to a record that was never
    /// initialized logs an error and does nothing. No-op on a destroyed
    /// record.
    pub fn attach(&self, owner: &OwnerRef, source: Option<PayloadSource>, kind: Option<DataKind>) {
        {
            let state = self.state.borrow();
            if state.destroyed {
                warn!(owner = owner.id(), "attach on a destroyed record ignored");
                return;
            }
            if source.is_none() && state.payload.is_none() && state.pending.is_none() {
                error!(
                    owner = owner.id(),
                    "attach without data on an uninitialized record"
                );
                return;
            }
        }

        let has_content = {
            let mut state = self.state.borrow_mut();
            state.owners.push(Rc::clone(owner));
            state.last_owner = Some(owner.id());
            state.payload.is_some() || state.pending.is_some()
        };

        let Some(source) = source else {
            return;
        };

        match source.resolve() {
            PayloadSource::Ready(payload) => {
                let Some(kind) = self.kind_or_guess(&payload, kind) else {
                    error!("cannot determine the kind of an attached payload");
                    return;
                };
                if has_content {
                    self.overwrite(payload, kind);
                } else {
                    let mut state = self.state.borrow_mut();
                    state.payload = Some(payload);
                    state.kind = Some(kind);
                    state.loaded = true;
                }
            }
            PayloadSource::Deferred(deferred) => {
                if has_content {
                    // resupply settling later lands as an overwrite
                    let this = self.clone();
                    self.services.spawn(async move {
                        match deferred.await {
                            Ok(payload) => match this.kind_or_guess(&payload, kind) {
                                Some(kind) => this.overwrite(payload, kind),
                                None => {
                                    error!("cannot determine the kind of a resupplied payload")
                                }
                            },
                            Err(error) => warn!(%error, "deferred resupply failed"),
                        }
                    });
                } else {
                    self.begin_initial_load(deferred, kind);
                }
            }
            PayloadSource::Lazy(_) => unreachable!("lazy sources resolve before dispatch"),
        }
    }

    /// Remove one occurrence of `owner`. Returns whether it was found.
    /// No-op returning `false` on a destroyed record.
    pub fn detach(&self, owner: &OwnerRef) -> bool {
        let mut state = self.state.borrow_mut();
        if state.destroyed {
            return false;
        }
        let Some(position) = state.owners.iter().position(|o| o.id() == owner.id()) else {
            return false;
        };
        state.owners.remove(position);
        if state.last_owner == Some(owner.id())
            && !state.owners.iter().any(|o| o.id() == owner.id())
        {
            state.last_owner = state.owners.last().map(|o| o.id());
        }
        true
    }

    /// Read the payload, converting toward `as_kind` first when necessary.
    ///
    /// With `copy` set the caller receives an independent deep copy;
    /// otherwise it receives the live payload and accepts the aliasing
    /// risk. Resolves to `Ok(None)` when the record is destroyed before
    /// the read settles.
    pub fn read(
        &self,
        as_kind: Option<DataKind>,
        copy: bool,
    ) -> LocalBoxFuture<'static, SettledPayload> {
        let this = self.clone();
        async move {
            let targets: Vec<DataKind> = as_kind.into_iter().collect();
            let settled = this.transform(&targets).await?;
            let Some(payload) = settled else {
                return Ok(None);
            };
            if !copy {
                return Ok(Some(payload));
            }
            let Some(kind) = this.kind() else {
                return Ok(None);
            };
            let context = this.context_owner();
            let copied = this.services.registry().copy(context, &payload, kind).await?;
            Ok(Some(copied))
        }
        .boxed_local()
    }

    /// Convert the record's data toward `targets` (any match satisfies;
    /// an empty list means the current representation).
    ///
    /// Resolves to the final payload. Requests issued while a settle is in
    /// flight are queued, never run concurrently, and re-check
    /// compatibility when dequeued.
    pub fn transform(&self, targets: &[DataKind]) -> LocalBoxFuture<'static, SettledPayload> {
        {
            let state = self.state.borrow();
            if state.destroyed {
                warn!("transform on a destroyed record");
                return future::ready(Ok(None)).boxed_local();
            }
            if state.loaded && Self::kind_matches(state.kind, targets) {
                return future::ready(Ok(state.payload.clone())).boxed_local();
            }
        }

        let (tx, rx) = oneshot::channel();
        let (has_pending, has_payload) = {
            let state = self.state.borrow();
            (state.pending.is_some(), state.payload.is_some())
        };
        if has_pending {
            self.state.borrow_mut().queue.push_back(QueuedJob {
                targets: targets.to_vec(),
                waiter: tx,
            });
        } else if !has_payload {
            warn!("transform on a record with no data");
            return future::ready(Ok(None)).boxed_local();
        } else {
            self.start_conversion(targets.to_vec(), tx);
        }

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Ok(None),
            }
        }
        .boxed_local()
    }

    /// Replace the record's data.
    ///
    /// Destroyed records release the new payload immediately. An identical
    /// payload and kind is a no-op. While a settle is pending the overwrite
    /// is parked and applied the moment the settle completes; it does not
    /// queue behind conversions it did not request. Shadow copies receive
    /// an independent copy of the new payload so renderer views stay
    /// consistent with the canonical source.
    pub fn overwrite(&self, payload: Payload, kind: DataKind) {
        {
            let state = self.state.borrow();
            if state.destroyed {
                drop(state);
                self.services.registry().release(payload, kind);
                return;
            }
            if state.pending.is_some() {
                drop(state);
                let superseded = self
                    .state
                    .borrow_mut()
                    .parked_overwrite
                    .replace((payload, kind));
                if let Some((payload, kind)) = superseded {
                    self.services.registry().release(payload, kind);
                }
                return;
            }
            if let (Some(current), Some(current_kind)) = (&state.payload, state.kind) {
                if current.ptr_eq(&payload) && current_kind == kind {
                    return;
                }
            }
        }
        self.apply_overwrite(payload, kind);
    }

    /// Non-suspending render read. Returns committed data in a
    /// representation the backend accepts, or absent after arranging for
    /// the data to become ready (conversion, shadow fill) and a redraw.
    pub fn read_for_render(
        &self,
        owner: &OwnerRef,
        backend: &dyn RenderBackend,
        keep_shadow: bool,
    ) -> Option<Payload> {
        let accepted = backend.accepted_kinds();
        // shadows exist for backends that keep a private copy
        let keep_shadow = keep_shadow && backend.retains_private_copy();

        {
            let state = self.state.borrow();
            if state.loaded {
                if let (Some(kind), Some(payload)) = (state.kind, &state.payload) {
                    if accepted.contains(&kind) {
                        return Some(payload.clone());
                    }
                }
            }
            if state.destroyed {
                drop(state);
                // force a re-fetch of the owning tile
                owner.reset_to_unloaded();
                return None;
            }
        }

        // a renderer-private shadow wins over converting the shared payload
        let shadow = self.state.borrow().shadows.get(&backend.id()).cloned();
        if let Some(shadow) = shadow {
            shadow.set_context(Rc::clone(owner));
            if !shadow.is_loaded() {
                self.services.events().request_redraw();
                return None;
            }
            if let Some(kind) = shadow.kind() {
                if accepted.contains(&kind) {
                    return shadow.payload();
                }
            }
            if !shadow.is_busy() {
                let conversion = shadow.transform(&accepted);
                let services = Rc::clone(&self.services);
                self.services.spawn(async move {
                    if let Err(error) = conversion.await {
                        warn!(%error, "shadow re-transform failed");
                    }
                    services.events().request_redraw();
                });
            }
            return None;
        }

        if self.state.borrow().pending.is_some() {
            // a settle is already on its way; do not queue more work
            self.services.events().request_redraw();
            return None;
        }

        if self.state.borrow().loaded {
            let prepared = self.prepare_for_render(owner, backend, keep_shadow);
            let services = Rc::clone(&self.services);
            self.services.spawn(async move {
                let _ = prepared.await;
                services.events().request_redraw();
            });
            return None;
        }

        // never initialized; nothing to draw yet
        self.services.events().request_redraw();
        None
    }

    /// Make the record renderable by `backend`. Idempotent.
    ///
    /// Without `keep_shadow` this converts the shared payload in place.
    /// With it, a per-renderer shadow record is materialized once from a
    /// fresh copy of the base payload. When the registry has no path to
    /// any accepted kind this logs and resolves with the record unchanged.
    pub fn prepare_for_render(
        &self,
        owner: &OwnerRef,
        backend: &dyn RenderBackend,
        keep_shadow: bool,
    ) -> LocalBoxFuture<'static, CacheResult<()>> {
        let accepted = backend.accepted_kinds();
        {
            let state = self.state.borrow();
            if state.loaded && Self::kind_matches(state.kind, &accepted) {
                return future::ready(Ok(())).boxed_local();
            }
        }

        if !keep_shadow {
            let this = self.clone();
            return async move { this.transform(&accepted).await.map(|_| ()) }.boxed_local();
        }

        let renderer = backend.id();
        if self.state.borrow().shadows.contains_key(&renderer) {
            // already materialized or being filled
            return future::ready(Ok(())).boxed_local();
        }

        // reserve the slot synchronously so repeated frames do not
        // double-fill the same shadow
        let shadow = SimpleRecord::with_preferred_kinds(Rc::clone(&self.services), accepted.clone());
        self.state
            .borrow_mut()
            .shadows
            .insert(renderer, shadow.clone());

        let this = self.clone();
        let owner = Rc::clone(owner);
        async move {
            let copied = match this.read(None, true).await {
                Ok(copied) => copied,
                Err(error) => {
                    this.state.borrow_mut().shadows.remove(&renderer);
                    return Err(error);
                }
            };
            let Some(copied) = copied else {
                this.state.borrow_mut().shadows.remove(&renderer);
                return Ok(());
            };
            let Some(base_kind) = this.kind() else {
                this.state.borrow_mut().shadows.remove(&renderer);
                return Ok(());
            };
            let reachable = accepted.contains(&base_kind)
                || this
                    .services
                    .registry()
                    .path_between(base_kind, &accepted)
                    .is_some();
            if !reachable {
                error!(from = %base_kind, "no conversion path for renderer shadow");
                this.state.borrow_mut().shadows.remove(&renderer);
                this.services.registry().release(copied, base_kind);
                return Ok(());
            }
            shadow.set_data(copied, base_kind);
            shadow.set_context(owner);
            if let Err(error) = shadow.transform(&accepted).await {
                warn!(%error, "shadow conversion failed");
            }
            Ok(())
        }
        .boxed_local()
    }

    /// Mark the record destroyed and release its resources.
    ///
    /// Idempotent. When a settle is in flight the release is deferred to
    /// settle time, where the destroyed flag is checked again. Queued
    /// conversion waiters resolve with empty results.
    pub fn destroy(&self) {
        if self.state.borrow().destroyed {
            return;
        }
        let (queue, parked, pending) = {
            let mut state = self.state.borrow_mut();
            state.destroyed = true;
            state.owners.clear();
            state.last_owner = None;
            (
                std::mem::take(&mut state.queue),
                state.parked_overwrite.take(),
                state.pending.is_some(),
            )
        };
        for job in queue {
            let _ = job.waiter.send(Ok(None));
        }
        if let Some((payload, kind)) = parked {
            self.services.registry().release(payload, kind);
        }
        if pending {
            debug!("destroy deferred until the in-flight settle completes");
            return;
        }
        self.release_all_data();
    }

    /// Reset a destroyed, fully released record to the empty state for
    /// reuse. Fails an assertion on a record that is still loaded or whose
    /// release has not settled yet.
    pub fn revive(&self) {
        let mut state = self.state.borrow_mut();
        assert!(state.destroyed, "revive on a record that was never destroyed");
        assert!(
            state.pending.is_none() && state.payload.is_none(),
            "revive before the pending release settled"
        );
        state.destroyed = false;
        state.loaded = false;
        state.kind = None;
        debug_assert!(state.owners.is_empty());
        debug_assert!(state.shadows.is_empty());
    }

    fn kind_matches(kind: Option<DataKind>, targets: &[DataKind]) -> bool {
        targets.is_empty() || kind.map_or(false, |k| targets.contains(&k))
    }

    fn kind_or_guess(&self, payload: &Payload, kind: Option<DataKind>) -> Option<DataKind> {
        kind.or_else(|| self.services.registry().guess_kind(payload))
    }

    /// The current reference owner, re-resolved against the owner list.
    fn context_owner(&self) -> Option<OwnerRef> {
        let state = self.state.borrow();
        state
            .last_owner
            .and_then(|id| state.owners.iter().find(|o| o.id() == id).cloned())
            .or_else(|| state.owners.last().cloned())
    }

    fn begin_initial_load(&self, deferred: DeferredPayload, kind_hint: Option<DataKind>) {
        {
            let mut state = self.state.borrow_mut();
            state.loaded = false;
            state.pending = Some(PendingSettle::new());
        }
        let this = self.clone();
        self.services.spawn(async move {
            let result = deferred.await;
            this.complete_initial_load(result, kind_hint);
        });
    }

    fn complete_initial_load(&self, result: CacheResult<Payload>, kind_hint: Option<DataKind>) {
        let destroyed = self.state.borrow().destroyed;
        match result {
            Ok(payload) => {
                let kind = self.kind_or_guess(&payload, kind_hint);
                if destroyed {
                    // the settle still ran; its result is discarded
                    if let Some(kind) = kind {
                        self.services.registry().release(payload, kind);
                    }
                } else {
                    match kind {
                        Some(kind) => {
                            let mut state = self.state.borrow_mut();
                            state.payload = Some(payload);
                            state.kind = Some(kind);
                            state.loaded = true;
                        }
                        None => error!("cannot determine the kind of a settled payload"),
                    }
                }
            }
            Err(error) => warn!(%error, "initial payload load failed"),
        }
        self.finish_settle();
    }

    /// Install the pending flag and run one conversion to completion.
    fn start_conversion(&self, targets: Vec<DataKind>, waiter: oneshot::Sender<SettledPayload>) {
        {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.pending.is_none(), "conversions never overlap");
            state.loaded = false;
            state.pending = Some(PendingSettle::new());
        }
        let this = self.clone();
        self.services
            .spawn(async move { this.run_conversion(targets, waiter).await });
    }

    async fn run_conversion(self, targets: Vec<DataKind>, waiter: oneshot::Sender<SettledPayload>) {
        let source = {
            let state = self.state.borrow();
            state.kind.zip(state.payload.clone())
        };
        let Some((from, payload)) = source else {
            let _ = waiter.send(Ok(None));
            self.finish_settle();
            return;
        };
        let context = self.context_owner();

        let Some(path) = self.services.registry().path_between(from, &targets) else {
            // unreachable target; resolve with the value unchanged
            error!(%from, ?targets, "no conversion path to requested kinds");
            {
                let mut state = self.state.borrow_mut();
                state.loaded = !state.destroyed;
            }
            let _ = waiter.send(Ok(Some(payload)));
            self.finish_settle();
            return;
        };

        let mut working = payload;
        for (index, step) in path.steps().iter().enumerate() {
            let result = step.apply(context.clone(), working.clone()).await;
            match result {
                Ok(next) => {
                    if index > 0 {
                        // the intermediate from the previous step is done
                        self.services.registry().release(working, step.origin());
                    }
                    working = next;
                }
                Err(_) => {
                    if index > 0 {
                        self.services.registry().release(working, step.origin());
                    }
                    error!(
                        origin = %step.origin(),
                        target = %step.target(),
                        "conversion step produced no data"
                    );
                    self.state.borrow_mut().loaded = false;
                    let _ = waiter.send(Err(CacheError::ConversionStepFailed {
                        origin: step.origin(),
                        target: step.target(),
                    }));
                    self.finish_settle();
                    return;
                }
            }
        }

        let final_kind = path.final_kind().unwrap_or(from);
        if self.state.borrow().destroyed {
            // destruction raced the conversion; discard the result
            self.services.registry().release(working, final_kind);
            self.release_all_data();
            let _ = waiter.send(Ok(None));
        } else {
            let old = {
                let mut state = self.state.borrow_mut();
                let old = state.payload.take().zip(state.kind.take());
                state.payload = Some(working.clone());
                state.kind = Some(final_kind);
                state.loaded = true;
                old
            };
            if let Some((payload, kind)) = old {
                if !payload.ptr_eq(&working) {
                    self.services.registry().release(payload, kind);
                }
            }
            let _ = waiter.send(Ok(Some(working)));
        }
        self.finish_settle();
    }

    /// Settle epilogue: wake waiters, land a parked overwrite, release
    /// everything when a destroy raced the settle, and schedule one queued
    /// job for a later turn.
    fn finish_settle(&self) {
        let (pending, parked, destroyed) = {
            let mut state = self.state.borrow_mut();
            (
                state.pending.take(),
                state.parked_overwrite.take(),
                state.destroyed,
            )
        };
        if let Some(pending) = pending {
            let _ = pending.tx.send(());
        }
        if let Some((payload, kind)) = parked {
            if destroyed {
                self.services.registry().release(payload, kind);
            } else {
                self.apply_overwrite(payload, kind);
            }
        }
        if destroyed {
            self.release_all_data();
        }
        self.schedule_queue_drain();
    }

    fn apply_overwrite(&self, payload: Payload, kind: DataKind) {
        if self.state.borrow().destroyed {
            self.services.registry().release(payload, kind);
            return;
        }
        let old = {
            let mut state = self.state.borrow_mut();
            let old = state.payload.take().zip(state.kind.take());
            state.payload = Some(payload.clone());
            state.kind = Some(kind);
            state.loaded = true;
            old
        };
        if let Some((previous, previous_kind)) = old {
            if !previous.ptr_eq(&payload) {
                self.services.registry().release(previous, previous_kind);
            }
        }

        // renderer views follow the canonical source
        let shadows: Vec<SimpleRecord> = self.state.borrow().shadows.values().cloned().collect();
        if !shadows.is_empty() {
            let context = self.context_owner();
            for shadow in shadows {
                let copied = self
                    .services
                    .registry()
                    .copy(context.clone(), &payload, kind);
                self.services.spawn(async move {
                    match copied.await {
                        Ok(copy) => shadow.set_data(copy, kind),
                        Err(error) => warn!(%error, "shadow overwrite copy failed"),
                    }
                });
            }
        }
        self.services.events().request_redraw();
    }

    fn release_all_data(&self) {
        let (data, shadows) = {
            let mut state = self.state.borrow_mut();
            state.loaded = false;
            (
                state.payload.take().zip(state.kind.take()),
                std::mem::take(&mut state.shadows),
            )
        };
        if let Some((payload, kind)) = data {
            self.services.registry().release(payload, kind);
        }
        for (_, shadow) in shadows {
            shadow.destroy();
        }
    }

    fn schedule_queue_drain(&self) {
        if self.state.borrow().queue.is_empty() {
            return;
        }
        let this = self.clone();
        self.services.spawn(async move { this.drain_one() });
    }

    /// Pop one queued job and act on it. The dequeue-time check is
    /// authoritative: an intervening overwrite may already satisfy the
    /// request, in which case no conversion runs.
    fn drain_one(&self) {
        let job = self.state.borrow_mut().queue.pop_front();
        let Some(job) = job else {
            return;
        };

        let (destroyed, satisfied, has_pending, has_payload) = {
            let state = self.state.borrow();
            let satisfied = if state.loaded && Self::kind_matches(state.kind, &job.targets) {
                state.payload.clone()
            } else {
                None
            };
            (
                state.destroyed,
                satisfied,
                state.pending.is_some(),
                state.payload.is_some(),
            )
        };

        if destroyed {
            let _ = job.waiter.send(Ok(None));
            self.schedule_queue_drain();
            return;
        }
        if has_pending {
            // another settle began in the meantime; park the job again
            self.state.borrow_mut().queue.push_front(job);
            return;
        }
        if let Some(payload) = satisfied {
            let _ = job.waiter.send(Ok(Some(payload)));
            self.schedule_queue_drain();
            return;
        }
        if !has_payload {
            let _ = job.waiter.send(Ok(None));
            self.schedule_queue_drain();
            return;
        }
        self.start_conversion(job.targets, job.waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        content_of, test_services_with_events, CountingEvents, TestBackend, TestRegistry,
        TestTile, RAW, RGBA, TEXTURE,
    };
    use futures::executor::LocalPool;

    fn setup() -> (LocalPool, Rc<TestRegistry>, Rc<CountingEvents>, CacheRecord) {
        let pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let events = Rc::new(CountingEvents::default());
        let record = CacheRecord::new(test_services_with_events(&registry, &events, &pool));
        (pool, registry, events, record)
    }

    fn ready(content: &str) -> Option<PayloadSource> {
        Some(PayloadSource::Ready(Payload::new(content.to_string())))
    }

    /// A payload source the test settles by hand.
    fn deferred() -> (oneshot::Sender<CacheResult<Payload>>, Option<PayloadSource>) {
        let (tx, rx) = oneshot::channel();
        let fut = async move {
            match rx.await {
                Ok(settled) => settled,
                Err(_) => Err(CacheError::LoadFailed("sender dropped".to_string())),
            }
        }
        .boxed_local();
        (tx, Some(PayloadSource::Deferred(fut)))
    }

    #[test]
    fn test_attach_detach_reference_counting() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let t2 = TestTile::new(2);

        record.attach(&t1.as_owner(), ready("p"), Some(RAW));
        record.attach(&t2.as_owner(), None, None);
        assert_eq!(record.owner_count(), 2);

        assert!(record.detach(&t1.as_owner()));
        assert!(!record.detach(&t1.as_owner()));
        assert_eq!(record.owner_count(), 1);

        assert!(record.detach(&t2.as_owner()));
        assert_eq!(record.owner_count(), 0);

        // reaching zero owners does not destroy the record
        assert!(!record.is_destroyed());
        assert!(record.is_loaded());
    }

    #[test]
    fn test_attach_without_data_on_uninitialized_record() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);

        record.attach(&t1.as_owner(), None, None);

        assert_eq!(record.owner_count(), 0);
        assert!(!record.is_loaded());
    }

    #[test]
    fn test_attach_deferred_settles_later() {
        let (mut pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let (tx, source) = deferred();

        record.attach(&t1.as_owner(), source, Some(RAW));
        assert!(!record.is_loaded());

        pool.run_until_stalled();
        assert!(!record.is_loaded());

        tx.send(Ok(Payload::new("p".to_string()))).unwrap();
        pool.run_until_stalled();

        assert!(record.is_loaded());
        assert_eq!(record.kind(), Some(RAW));
        assert_eq!(content_of(&record.payload().unwrap()), "p");
    }

    #[test]
    fn test_later_attach_with_data_overwrites() {
        let (_pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let t2 = TestTile::new(2);

        record.attach(&t1.as_owner(), ready("first"), Some(RAW));
        record.attach(&t2.as_owner(), ready("second"), Some(RGBA));

        assert_eq!(record.owner_count(), 2);
        assert_eq!(record.kind(), Some(RGBA));
        assert_eq!(content_of(&record.payload().unwrap()), "second");
        assert_eq!(registry.release_count(RAW), 1);
    }

    #[test]
    fn test_attach_lazy_source_is_invoked_on_first_attach() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);

        let source = PayloadSource::Lazy(Box::new(|| {
            PayloadSource::Ready(Payload::new("produced".to_string()))
        }));
        record.attach(&t1.as_owner(), Some(source), Some(RAW));

        assert!(record.is_loaded());
        assert_eq!(content_of(&record.payload().unwrap()), "produced");
    }

    #[test]
    fn test_attach_on_destroyed_record_skips_lazy_producer() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));
        record.destroy();

        let source = PayloadSource::Lazy(Box::new(|| panic!("producer must not run")));
        record.attach(&t1.as_owner(), Some(source), Some(RAW));
        assert_eq!(record.owner_count(), 0);
    }

    #[test]
    fn test_read_without_copy_aliases_payload() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let fut = record.read(None, false);
        let live = pool.run_until(fut).unwrap().unwrap();
        assert!(live.ptr_eq(&record.payload().unwrap()));
        assert_eq!(registry.copies(), 0);

        let fut = record.read(None, true);
        let copied = pool.run_until(fut).unwrap().unwrap();
        assert!(!copied.ptr_eq(&record.payload().unwrap()));
        assert_eq!(registry.copies(), 1);
    }

    #[test]
    fn test_read_converts_to_requested_kind() {
        let (mut pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let fut = record.read(Some(TEXTURE), false);
        let payload = pool.run_until(fut).unwrap().unwrap();

        assert_eq!(content_of(&payload), "p:rgba:texture");
        assert_eq!(record.kind(), Some(TEXTURE));
        assert!(record.is_loaded());
    }

    #[test]
    fn test_round_trip_conversion_restores_kind() {
        let (mut pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let fut = record.transform(&[RGBA]);
        pool.run_until(fut).unwrap();
        let fut = record.transform(&[RAW]);
        pool.run_until(fut).unwrap();

        assert!(record.is_loaded());
        assert_eq!(record.kind(), Some(RAW));
    }

    #[test]
    fn test_transform_noop_when_already_compatible() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let fut = record.transform(&[RAW, RGBA]);
        let payload = pool.run_until(fut).unwrap().unwrap();

        assert_eq!(content_of(&payload), "p");
        assert_eq!(registry.conversions(), 0);
    }

    #[test]
    fn test_overlapping_transforms_serialize() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        // both issued before the first settles
        let first = record.transform(&[RGBA]);
        let second = record.transform(&[TEXTURE]);

        let (first, second) = pool.run_until(future::join(first, second));
        assert_eq!(content_of(&first.unwrap().unwrap()), "p:rgba");
        assert_eq!(content_of(&second.unwrap().unwrap()), "p:rgba:texture");

        // the record ends at the later request's kind
        assert_eq!(record.kind(), Some(TEXTURE));
        assert_eq!(registry.conversions(), 2);
    }

    #[test]
    fn test_queued_transform_satisfied_by_intervening_overwrite() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let (tx, source) = deferred();
        record.attach(&t1.as_owner(), source, Some(RAW));

        let queued = record.transform(&[RGBA]);
        record.overwrite(Payload::new("x".to_string()), RGBA);

        tx.send(Ok(Payload::new("p".to_string()))).unwrap();
        let payload = pool.run_until(queued).unwrap().unwrap();

        // the overwrite landed first and already satisfies the request
        assert_eq!(content_of(&payload), "x");
        assert_eq!(record.kind(), Some(RGBA));
        assert_eq!(registry.conversions(), 0);
    }

    #[test]
    fn test_overwrite_identical_payload_is_noop() {
        let (_pool, registry, events, record) = setup();
        let t1 = TestTile::new(1);
        let payload = Payload::new("p".to_string());
        record.attach(
            &t1.as_owner(),
            Some(PayloadSource::Ready(payload.clone())),
            Some(RAW),
        );

        record.overwrite(payload, RAW);

        assert!(registry.released().is_empty());
        assert_eq!(events.redraws(), 0);
    }

    #[test]
    fn test_overwrite_while_pending_lands_after_settle() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let (tx, source) = deferred();
        record.attach(&t1.as_owner(), source, Some(RAW));

        record.overwrite(Payload::new("a".to_string()), RAW);
        record.overwrite(Payload::new("b".to_string()), RGBA);
        // the superseded parked overwrite is released right away
        assert_eq!(registry.release_count(RAW), 1);

        tx.send(Ok(Payload::new("p".to_string()))).unwrap();
        pool.run_until_stalled();

        assert_eq!(record.kind(), Some(RGBA));
        assert_eq!(content_of(&record.payload().unwrap()), "b");
        // the settled payload was replaced by the parked overwrite
        assert_eq!(registry.release_count(RAW), 2);
    }

    #[test]
    fn test_overwrite_on_zero_owner_record_is_legal() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));
        record.detach(&t1.as_owner());
        assert_eq!(record.owner_count(), 0);

        record.overwrite(Payload::new("x".to_string()), RGBA);

        assert_eq!(record.kind(), Some(RGBA));
        assert_eq!(content_of(&record.payload().unwrap()), "x");
    }

    #[test]
    fn test_overwrite_propagates_copies_to_shadows() {
        let (mut pool, _registry, events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let backend = TestBackend::new(7, vec![TEXTURE], true);
        let prepared = record.prepare_for_render(&t1.as_owner(), &backend, true);
        pool.run_until(prepared).unwrap();

        let new_payload = Payload::new("new".to_string());
        record.overwrite(new_payload.clone(), RAW);
        pool.run_until_stalled();

        let shadow = record.state.borrow().shadows.get(&7).cloned().unwrap();
        assert_eq!(shadow.kind(), Some(RAW));
        let shadow_payload = shadow.payload().unwrap();
        assert_eq!(content_of(&shadow_payload), "new");
        // the shadow holds an independent copy, never the same buffer
        assert!(!shadow_payload.ptr_eq(&new_payload));
        assert!(events.redraws() > 0);
    }

    #[test]
    fn test_conversion_failure_marks_record_not_loaded() {
        let (mut pool, registry, _events, record) = setup();
        registry.fail_edge(RAW, RGBA);
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let fut = record.transform(&[RGBA]);
        let err = pool.run_until(fut).unwrap_err();

        assert!(matches!(err, CacheError::ConversionStepFailed { .. }));
        assert!(!record.is_loaded());
    }

    #[test]
    fn test_unreachable_conversion_resolves_unchanged() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(TEXTURE));

        // nothing leaves "texture" in the default graph
        let fut = record.transform(&[RAW]);
        let payload = pool.run_until(fut).unwrap().unwrap();

        assert_eq!(content_of(&payload), "p");
        assert_eq!(record.kind(), Some(TEXTURE));
        assert!(record.is_loaded());
        assert_eq!(registry.conversions(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (_pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        record.destroy();
        record.destroy();

        assert!(record.is_destroyed());
        assert_eq!(record.owner_count(), 0);
        assert_eq!(registry.release_count(RAW), 1);
    }

    #[test]
    fn test_destroy_mid_flight_discards_settled_value() {
        let (mut pool, registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let (tx, source) = deferred();
        record.attach(&t1.as_owner(), source, Some(RAW));

        record.destroy();
        assert!(record.is_destroyed());

        tx.send(Ok(Payload::new("p".to_string()))).unwrap();
        pool.run_until_stalled();

        // the settle ran; its result was released, not stored
        assert_eq!(registry.release_count(RAW), 1);
        assert!(!record.is_loaded());
        assert!(record.payload().is_none());

        let read = record.read(None, false);
        assert!(pool.run_until(read).unwrap().is_none());
    }

    #[test]
    fn test_revive_after_destroy_resets_record() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));
        record.destroy();

        record.revive();

        assert!(!record.is_destroyed());
        assert!(!record.is_loaded());
        assert_eq!(record.kind(), None);
        assert_eq!(record.owner_count(), 0);

        record.attach(&t1.as_owner(), ready("again"), Some(RGBA));
        assert_eq!(record.kind(), Some(RGBA));
    }

    #[test]
    #[should_panic(expected = "pending release")]
    fn test_revive_before_release_settles_panics() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        let (_tx, source) = deferred();
        record.attach(&t1.as_owner(), source, Some(RAW));

        record.destroy();
        record.revive();
    }

    #[test]
    #[should_panic(expected = "never destroyed")]
    fn test_revive_on_live_record_panics() {
        let (_pool, _registry, _events, record) = setup();
        record.revive();
    }

    #[test]
    fn test_read_for_render_returns_compatible_payload() {
        let (_pool, _registry, events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let backend = TestBackend::new(1, vec![RAW, RGBA], false);
        let payload = record.read_for_render(&t1.as_owner(), &backend, false);

        assert_eq!(content_of(&payload.unwrap()), "p");
        assert_eq!(events.redraws(), 0);
    }

    #[test]
    fn test_read_for_render_converts_base_record() {
        let (mut pool, _registry, events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let backend = TestBackend::new(1, vec![TEXTURE], false);
        assert!(record.read_for_render(&t1.as_owner(), &backend, false).is_none());

        pool.run_until_stalled();
        // the conversion settled and asked for another frame
        assert!(events.redraws() > 0);

        let payload = record.read_for_render(&t1.as_owner(), &backend, false);
        assert_eq!(content_of(&payload.unwrap()), "p:rgba:texture");
        assert_eq!(record.kind(), Some(TEXTURE));
    }

    #[test]
    fn test_read_for_render_on_destroyed_record_resets_owner() {
        let (_pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));
        record.destroy();

        let backend = TestBackend::new(1, vec![RAW], false);
        assert!(record.read_for_render(&t1.as_owner(), &backend, false).is_none());
        assert_eq!(t1.resets(), 1);
    }

    #[test]
    fn test_read_for_render_materializes_private_shadow() {
        let (mut pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let backend = TestBackend::new(3, vec![TEXTURE], true);
        assert!(record.read_for_render(&t1.as_owner(), &backend, true).is_none());

        pool.run_until_stalled();

        // the base record keeps its canonical representation
        assert_eq!(record.kind(), Some(RAW));
        assert_eq!(content_of(&record.payload().unwrap()), "p");

        let payload = record.read_for_render(&t1.as_owner(), &backend, true);
        assert_eq!(content_of(&payload.unwrap()), "p:rgba:texture");
    }

    #[test]
    fn test_read_for_render_does_not_overlap_shadow_transforms() {
        let (mut pool, _registry, _events, record) = setup();
        let t1 = TestTile::new(1);
        record.attach(&t1.as_owner(), ready("p"), Some(RAW));

        let backend = TestBackend::new(7, vec![TEXTURE], true);
        let prepared = record.prepare_for_render(&t1.as_owner(), &backend, true);
        pool.run_until(prepared).unwrap();

        // the overwrite lands a raw copy in the shadow, leaving it
        // incompatible with the backend again
        record.overwrite(Payload::new("new".to_string()), RAW);
        pool.run_until_stalled();
        let shadow = record.state.borrow().shadows.get(&7).cloned().unwrap();
        assert_eq!(shadow.kind(), Some(RAW));

        // two frames arrive before the executor runs; only the first may
        // kick off a shadow conversion
        assert!(record.read_for_render(&t1.as_owner(), &backend, true).is_none());
        assert!(shadow.is_busy());
        assert!(record.read_for_render(&t1.as_owner(), &backend, true).is_none());

        pool.run_until_stalled();
        let payload = record.read_for_render(&t1.as_owner(), &backend, true);
        assert_eq!(content_of(&payload.unwrap()), "new:rgba:texture");
    }

    #[test]
    fn test_read_for_render_while_pending_never_queues_work() {
        let (_pool, _registry, events, record) = setup();
        let t1 = TestTile::new(1);
        let (_tx, source) = deferred();
        record.attach(&t1.as_owner(), source, Some(RAW));

        let backend = TestBackend::new(1, vec![RAW], false);
        for _ in 0..3 {
            assert!(record.read_for_render(&t1.as_owner(), &backend, false).is_none());
        }

        assert_eq!(events.redraws(), 3);
        assert!(record.state.borrow().queue.is_empty());
    }

    #[test]
    fn test_await_settled_resolves_when_idle() {
        let (mut pool, _registry, _events, record) = setup();
        pool.run_until(record.await_settled());
    }
}
