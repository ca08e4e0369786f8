//! Collaborator contracts: tile owners, render backends, event sinks.
//!
//! The cache core never owns tiles or renderers. Owners hold their own
//! key-to-record associations and expose the metadata the eviction scan
//! needs; render backends declare which representations they accept.

use std::rc::Rc;

use crate::data::DataKind;

/// Opaque cache key. Owners derive it from tile identity (source URL,
/// level, coordinates); the cache only compares keys for equality.
pub type CacheKey = String;

/// Stable identifier of a tile owner.
pub type OwnerId = u64;

/// Stable identifier of a render backend.
pub type RendererId = u32;

/// A tile entity depending on cached data.
///
/// Implementations carry interior mutability; the cache holds shared
/// handles and only calls through this trait.
pub trait TileOwner {
    /// Stable identity, used for reference counting and slot bookkeeping.
    fn id(&self) -> OwnerId;

    /// Pyramid level. Deeper levels are more detailed and cheaper to
    /// re-fetch, which makes them preferred eviction victims on recency
    /// ties.
    fn level(&self) -> u32;

    /// Monotonic recency stamp; larger is more recent.
    fn last_touched_at(&self) -> u64;

    /// Whether this owner's data has fully settled.
    fn is_loaded(&self) -> bool;

    /// Whether this owner is fetching data right now.
    fn is_loading(&self) -> bool;

    /// Whether this owner is part of the frame currently being drawn.
    fn is_being_drawn(&self) -> bool;

    /// Whether this owner has post-processing in flight.
    fn is_processing(&self) -> bool;

    /// Keys this owner currently associates with cache records. This is
    /// owner-side bookkeeping; the cache reads it when unloading a whole
    /// footprint.
    fn cached_keys(&self) -> Vec<CacheKey>;

    /// Number of cache records this owner holds.
    fn cache_footprint_size(&self) -> usize {
        self.cached_keys().len()
    }

    /// Whether this owner's records may be kept as zombies when it clears
    /// out, so an identical re-request is served without a re-fetch.
    fn retain_as_zombie(&self) -> bool {
        false
    }

    /// Force the owner back to an unloaded state so the surrounding system
    /// re-fetches its data.
    fn reset_to_unloaded(&self);

    /// A record this owner depends on now answers to `new` instead of
    /// `old`; the owner must update its own key associations.
    fn notify_key_renamed(&self, old: &str, new: &str);
}

/// Shared handle to a tile owner.
pub type OwnerRef = Rc<dyn TileOwner>;

/// A rendering backend consuming cache data once per frame.
pub trait RenderBackend {
    /// Stable identity, used to key per-renderer shadow copies.
    fn id(&self) -> RendererId;

    /// Representations this backend can draw, best match first.
    fn accepted_kinds(&self) -> Vec<DataKind>;

    /// Backends that keep a private copy of tile data get a per-renderer
    /// shadow record instead of converting the shared payload in place.
    fn retains_private_copy(&self) -> bool;
}

/// Notifications the cache emits toward the surrounding system.
pub trait CacheEvents {
    /// Ask for another frame. Fire-and-forget, invoked at most once per
    /// readiness event.
    fn request_redraw(&self);

    /// An owner's whole cache footprint was just unloaded. `destroyed`
    /// tells whether the data was released or retained as zombies.
    fn owner_unloaded(&self, owner: &OwnerRef, destroyed: bool);
}

/// Event sink that ignores everything.
#[derive(Debug, Default)]
pub struct NullEvents;

impl CacheEvents for NullEvents {
    fn request_redraw(&self) {}

    fn owner_unloaded(&self, _owner: &OwnerRef, _destroyed: bool) {}
}
