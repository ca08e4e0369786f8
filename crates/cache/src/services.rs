//! Shared service handles threaded through the manager and its records.

use std::future::Future;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use tracing::warn;

use crate::convert::ConversionRegistry;
use crate::owner::CacheEvents;

/// Bundle of collaborator handles shared by every record of one manager:
/// the conversion registry, the event sink, and the single-threaded
/// executor handle used to schedule work for a later turn.
pub struct CacheServices {
    registry: Rc<dyn ConversionRegistry>,
    events: Rc<dyn CacheEvents>,
    spawner: LocalSpawner,
}

impl CacheServices {
    /// Bundle the given collaborators.
    pub fn new(
        registry: Rc<dyn ConversionRegistry>,
        events: Rc<dyn CacheEvents>,
        spawner: LocalSpawner,
    ) -> Self {
        Self {
            registry,
            events,
            spawner,
        }
    }

    /// The conversion registry.
    pub fn registry(&self) -> &dyn ConversionRegistry {
        &*self.registry
    }

    /// The event sink.
    pub fn events(&self) -> &dyn CacheEvents {
        &*self.events
    }

    /// Queue a task for a later turn on the single-threaded executor.
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        if let Err(error) = self.spawner.spawn_local(task) {
            warn!(%error, "executor is gone; dropping queued cache task");
        }
    }
}
