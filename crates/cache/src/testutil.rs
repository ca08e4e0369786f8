//! Shared test fixtures: a direct-edge conversion registry, scripted tile
//! owners, render backends, and counting event sinks.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use futures::executor::LocalPool;
use futures::{future, FutureExt};

use crate::config::CacheConfig;
use crate::convert::{ConversionPath, ConversionRegistry, ConversionStep};
use crate::data::{DataKind, DeferredPayload, Payload, PayloadSource};
use crate::error::CacheError;
use crate::manager::CacheManager;
use crate::owner::{
    CacheEvents, CacheKey, NullEvents, OwnerId, OwnerRef, RenderBackend, RendererId, TileOwner,
};
use crate::record::CacheRecord;
use crate::services::CacheServices;

pub const RAW: DataKind = DataKind::new("raw");
pub const RGBA: DataKind = DataKind::new("rgba");
pub const TEXTURE: DataKind = DataKind::new("texture");

/// Conversion registry over a hand-registered edge list.
///
/// Paths are found with a breadth-first walk. Each applied edge appends
/// `":{target}"` to the payload string so tests can follow what happened.
pub struct TestRegistry {
    edges: RefCell<Vec<(DataKind, DataKind)>>,
    failing: RefCell<HashSet<(DataKind, DataKind)>>,
    conversions: Rc<Cell<usize>>,
    copies: Cell<usize>,
    released: RefCell<Vec<DataKind>>,
    guess: Cell<Option<DataKind>>,
}

impl TestRegistry {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            edges: RefCell::new(Vec::new()),
            failing: RefCell::new(HashSet::new()),
            conversions: Rc::new(Cell::new(0)),
            copies: Cell::new(0),
            released: RefCell::new(Vec::new()),
            guess: Cell::new(Some(RAW)),
        })
    }

    /// Registry with the edges raw -> rgba, rgba -> texture, rgba -> raw.
    /// Nothing leaves "texture".
    pub fn with_default_edges() -> Rc<Self> {
        let registry = Self::new();
        registry.add_edge(RAW, RGBA);
        registry.add_edge(RGBA, TEXTURE);
        registry.add_edge(RGBA, RAW);
        registry
    }

    pub fn add_edge(&self, from: DataKind, to: DataKind) {
        self.edges.borrow_mut().push((from, to));
    }

    /// Make one edge produce an error instead of a payload.
    pub fn fail_edge(&self, from: DataKind, to: DataKind) {
        self.failing.borrow_mut().insert((from, to));
    }

    pub fn set_guess(&self, guess: Option<DataKind>) {
        self.guess.set(guess);
    }

    pub fn conversions(&self) -> usize {
        self.conversions.get()
    }

    pub fn copies(&self) -> usize {
        self.copies.get()
    }

    pub fn released(&self) -> Vec<DataKind> {
        self.released.borrow().clone()
    }

    pub fn release_count(&self, kind: DataKind) -> usize {
        self.released.borrow().iter().filter(|k| **k == kind).count()
    }

    fn shortest_route(
        &self,
        from: DataKind,
        targets: &[DataKind],
    ) -> Option<Vec<(DataKind, DataKind)>> {
        if targets.contains(&from) {
            return Some(Vec::new());
        }
        let edges = self.edges.borrow();
        let mut previous: HashMap<DataKind, DataKind> = HashMap::new();
        let mut seen: HashSet<DataKind> = HashSet::from([from]);
        let mut queue: VecDeque<DataKind> = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            for (a, b) in edges.iter() {
                if *a != node || seen.contains(b) {
                    continue;
                }
                seen.insert(*b);
                previous.insert(*b, node);
                if targets.contains(b) {
                    let mut route = Vec::new();
                    let mut current = *b;
                    while current != from {
                        let parent = previous[&current];
                        route.push((parent, current));
                        current = parent;
                    }
                    route.reverse();
                    return Some(route);
                }
                queue.push_back(*b);
            }
        }
        None
    }

    fn make_step(&self, from: DataKind, to: DataKind) -> ConversionStep {
        let conversions = Rc::clone(&self.conversions);
        let failing = self.failing.borrow().contains(&(from, to));
        ConversionStep::new(from, to, move |_context, payload| {
            if failing {
                return future::ready(Err(CacheError::LoadFailed(format!("{from}->{to}"))))
                    .boxed_local();
            }
            conversions.set(conversions.get() + 1);
            let content = payload.downcast_ref::<String>().cloned().unwrap_or_default();
            future::ready(Ok(Payload::new(format!("{content}:{to}")))).boxed_local()
        })
    }
}

impl ConversionRegistry for TestRegistry {
    fn path_between(&self, from: DataKind, targets: &[DataKind]) -> Option<ConversionPath> {
        let route = self.shortest_route(from, targets)?;
        Some(ConversionPath::new(
            route
                .into_iter()
                .map(|(a, b)| self.make_step(a, b))
                .collect(),
        ))
    }

    fn copy(
        &self,
        _context: Option<OwnerRef>,
        payload: &Payload,
        _kind: DataKind,
    ) -> DeferredPayload {
        self.copies.set(self.copies.get() + 1);
        let copied = match payload.downcast_ref::<String>() {
            Some(content) => Payload::new(content.clone()),
            None => payload.clone(),
        };
        future::ready(Ok(copied)).boxed_local()
    }

    fn release(&self, _payload: Payload, kind: DataKind) {
        self.released.borrow_mut().push(kind);
    }

    fn guess_kind(&self, _payload: &Payload) -> Option<DataKind> {
        self.guess.get()
    }
}

/// Scripted tile owner with settable busy flags and recency.
pub struct TestTile {
    id: OwnerId,
    level: Cell<u32>,
    touched: Cell<u64>,
    loaded: Cell<bool>,
    loading: Cell<bool>,
    drawn: Cell<bool>,
    processing: Cell<bool>,
    zombie_retention: Cell<bool>,
    keys: RefCell<Vec<CacheKey>>,
    resets: Cell<usize>,
    renames: RefCell<Vec<(CacheKey, CacheKey)>>,
}

impl TestTile {
    pub fn new(id: OwnerId) -> Rc<Self> {
        Rc::new(Self {
            id,
            level: Cell::new(1),
            touched: Cell::new(0),
            loaded: Cell::new(true),
            loading: Cell::new(false),
            drawn: Cell::new(false),
            processing: Cell::new(false),
            zombie_retention: Cell::new(false),
            keys: RefCell::new(Vec::new()),
            resets: Cell::new(0),
            renames: RefCell::new(Vec::new()),
        })
    }

    pub fn as_owner(self: &Rc<Self>) -> OwnerRef {
        Rc::clone(self) as OwnerRef
    }

    pub fn set_level(&self, level: u32) {
        self.level.set(level);
    }

    pub fn set_touched(&self, stamp: u64) {
        self.touched.set(stamp);
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.set(loaded);
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.set(loading);
    }

    pub fn set_drawn(&self, drawn: bool) {
        self.drawn.set(drawn);
    }

    pub fn set_processing(&self, processing: bool) {
        self.processing.set(processing);
    }

    pub fn set_retain_as_zombie(&self, retain: bool) {
        self.zombie_retention.set(retain);
    }

    pub fn note_key(&self, key: &str) {
        let mut keys = self.keys.borrow_mut();
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.keys.borrow().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.get()
    }

    pub fn renames(&self) -> Vec<(CacheKey, CacheKey)> {
        self.renames.borrow().clone()
    }
}

impl TileOwner for TestTile {
    fn id(&self) -> OwnerId {
        self.id
    }

    fn level(&self) -> u32 {
        self.level.get()
    }

    fn last_touched_at(&self) -> u64 {
        self.touched.get()
    }

    fn is_loaded(&self) -> bool {
        self.loaded.get()
    }

    fn is_loading(&self) -> bool {
        self.loading.get()
    }

    fn is_being_drawn(&self) -> bool {
        self.drawn.get()
    }

    fn is_processing(&self) -> bool {
        self.processing.get()
    }

    fn cached_keys(&self) -> Vec<CacheKey> {
        self.keys.borrow().clone()
    }

    fn retain_as_zombie(&self) -> bool {
        self.zombie_retention.get()
    }

    fn reset_to_unloaded(&self) {
        self.loaded.set(false);
        self.keys.borrow_mut().clear();
        self.resets.set(self.resets.get() + 1);
    }

    fn notify_key_renamed(&self, old: &str, new: &str) {
        let mut keys = self.keys.borrow_mut();
        if let Some(slot) = keys.iter_mut().find(|k| k.as_str() == old) {
            *slot = new.to_string();
        }
        self.renames
            .borrow_mut()
            .push((old.to_string(), new.to_string()));
    }
}

/// Render backend with a fixed capability list.
pub struct TestBackend {
    id: RendererId,
    accepted: Vec<DataKind>,
    private_copy: bool,
}

impl TestBackend {
    pub fn new(id: RendererId, accepted: Vec<DataKind>, private_copy: bool) -> Self {
        Self {
            id,
            accepted,
            private_copy,
        }
    }
}

impl RenderBackend for TestBackend {
    fn id(&self) -> RendererId {
        self.id
    }

    fn accepted_kinds(&self) -> Vec<DataKind> {
        self.accepted.clone()
    }

    fn retains_private_copy(&self) -> bool {
        self.private_copy
    }
}

/// Event sink that counts redraw requests and unload notifications.
#[derive(Default)]
pub struct CountingEvents {
    redraws: Cell<usize>,
    unloads: RefCell<Vec<(OwnerId, bool)>>,
}

impl CountingEvents {
    pub fn redraws(&self) -> usize {
        self.redraws.get()
    }

    pub fn unloads(&self) -> Vec<(OwnerId, bool)> {
        self.unloads.borrow().clone()
    }
}

impl CacheEvents for CountingEvents {
    fn request_redraw(&self) {
        self.redraws.set(self.redraws.get() + 1);
    }

    fn owner_unloaded(&self, owner: &OwnerRef, destroyed: bool) {
        self.unloads.borrow_mut().push((owner.id(), destroyed));
    }
}

pub fn test_services(registry: &Rc<TestRegistry>, pool: &LocalPool) -> Rc<CacheServices> {
    Rc::new(CacheServices::new(
        Rc::clone(registry) as Rc<dyn ConversionRegistry>,
        Rc::new(NullEvents) as Rc<dyn CacheEvents>,
        pool.spawner(),
    ))
}

pub fn test_services_with_events(
    registry: &Rc<TestRegistry>,
    events: &Rc<CountingEvents>,
    pool: &LocalPool,
) -> Rc<CacheServices> {
    Rc::new(CacheServices::new(
        Rc::clone(registry) as Rc<dyn ConversionRegistry>,
        Rc::clone(events) as Rc<dyn CacheEvents>,
        pool.spawner(),
    ))
}

pub fn manager_with(
    max_entries: usize,
    pool: &LocalPool,
) -> (CacheManager, Rc<TestRegistry>, Rc<CountingEvents>) {
    let registry = TestRegistry::with_default_edges();
    let events = Rc::new(CountingEvents::default());
    let manager = CacheManager::new(
        CacheConfig::new(max_entries),
        Rc::clone(&registry) as Rc<dyn ConversionRegistry>,
        Rc::clone(&events) as Rc<dyn CacheEvents>,
        pool.spawner(),
    );
    (manager, registry, events)
}

/// Cache a string payload for `tile` under `key`, noting the key on the
/// tile's own bookkeeping as the owning entity would.
pub fn cache_into(
    manager: &CacheManager,
    tile: &Rc<TestTile>,
    key: &str,
    content: &str,
    kind: DataKind,
    cutoff: u32,
) -> CacheRecord {
    tile.note_key(key);
    manager.cache_tile(
        &tile.as_owner(),
        key,
        Some(PayloadSource::Ready(Payload::new(content.to_string()))),
        Some(kind),
        cutoff,
    )
}

pub fn content_of(payload: &Payload) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default()
}
