//! Synchronous-snapshot record used for per-renderer format copies.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::{future, FutureExt};
use tracing::{error, warn};

use crate::data::{DataKind, Payload};
use crate::error::{CacheError, CacheResult};
use crate::owner::OwnerRef;
use crate::services::CacheServices;

struct SimpleState {
    payload: Option<Payload>,
    kind: Option<DataKind>,
    loaded: bool,
    /// Fallback targets for a transform issued without explicit ones.
    preferred: Vec<DataKind>,
    /// Reference owner consumed by the next transform call.
    context: Option<OwnerRef>,
    /// Overlap guard; operations on this record must not be concurrent.
    busy: bool,
}

/// Single-payload record with no ownership tracking and no job queue.
///
/// Used for renderer-private format copies of a shared record. The caller
/// is responsible for never overlapping operations: a transform issued
/// while another is still running is a contract violation and fails an
/// assertion.
#[derive(Clone)]
pub struct SimpleRecord {
    state: Rc<RefCell<SimpleState>>,
    services: Rc<CacheServices>,
}

impl SimpleRecord {
    /// Create an empty record.
    pub fn new(services: Rc<CacheServices>) -> Self {
        Self::with_preferred_kinds(services, Vec::new())
    }

    /// Create an empty record carrying preferred-kind hints.
    pub fn with_preferred_kinds(services: Rc<CacheServices>, preferred: Vec<DataKind>) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimpleState {
                payload: None,
                kind: None,
                loaded: false,
                preferred,
                context: None,
                busy: false,
            })),
            services,
        }
    }

    /// Whether the record holds settled data.
    pub fn is_loaded(&self) -> bool {
        self.state.borrow().loaded
    }

    /// Current representation, when loaded.
    pub fn kind(&self) -> Option<DataKind> {
        self.state.borrow().kind
    }

    /// The held payload, when loaded.
    pub fn payload(&self) -> Option<Payload> {
        self.state.borrow().payload.clone()
    }

    /// Whether a transform is currently running.
    pub fn is_busy(&self) -> bool {
        self.state.borrow().busy
    }

    /// Set the reference owner consumed by the next transform call. The
    /// slot is transient; each transform takes it.
    pub fn set_context(&self, owner: OwnerRef) {
        self.state.borrow_mut().context = Some(owner);
    }

    /// Unconditional overwrite. The previous payload is released through
    /// the registry hook.
    pub fn set_data(&self, payload: Payload, kind: DataKind) {
        let old = {
            let mut state = self.state.borrow_mut();
            let old = state.payload.take().zip(state.kind.take());
            state.payload = Some(payload);
            state.kind = Some(kind);
            state.loaded = true;
            old
        };
        if let Some((payload, kind)) = old {
            self.services.registry().release(payload, kind);
        }
    }

    /// Convert the held payload toward `targets` in place. An empty target
    /// list falls back to the preferred-kind hints.
    ///
    /// Requires a reference owner to have been set beforehand; fails an
    /// assertion otherwise. The busy flag is raised before this returns, so
    /// callers polling [`is_busy`](Self::is_busy) between frames never kick
    /// off a second, overlapping conversion.
    pub fn transform(&self, targets: &[DataKind]) -> LocalBoxFuture<'static, CacheResult<()>> {
        let targets: Vec<DataKind> = if targets.is_empty() {
            self.state.borrow().preferred.clone()
        } else {
            targets.to_vec()
        };
        let (context, payload, from) = {
            let mut state = self.state.borrow_mut();
            assert!(!state.busy, "overlapping transform on a simple record");
            let context = state.context.take();
            assert!(
                context.is_some(),
                "transform requires a reference owner to be set first"
            );
            let (payload, from) = match (state.payload.clone(), state.kind) {
                (Some(payload), Some(kind)) => (payload, kind),
                _ => {
                    warn!("transform on a simple record with no data");
                    return future::ready(Ok(())).boxed_local();
                }
            };
            if state.loaded && targets.contains(&from) {
                return future::ready(Ok(())).boxed_local();
            }
            state.busy = true;
            (context, payload, from)
        };
        let this = self.clone();
        async move { this.run_transform(targets, context, payload, from).await }.boxed_local()
    }

    async fn run_transform(
        self,
        targets: Vec<DataKind>,
        context: Option<OwnerRef>,
        payload: Payload,
        from: DataKind,
    ) -> CacheResult<()> {
        let path = self.services.registry().path_between(from, &targets);
        let Some(path) = path else {
            // unreachable target; leave the record unchanged
            error!(%from, ?targets, "no conversion path for simple record");
            self.state.borrow_mut().busy = false;
            return Ok(());
        };

        let mut working = payload;
        for (index, step) in path.steps().iter().enumerate() {
            let result = step.apply(context.clone(), working.clone()).await;
            match result {
                Ok(next) => {
                    if index > 0 {
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
                    let mut state = self.state.borrow_mut();
                    state.loaded = false;
                    state.busy = false;
                    return Err(CacheError::ConversionStepFailed {
                        origin: step.origin(),
                        target: step.target(),
                    });
                }
            }
        }

        let final_kind = path.final_kind().unwrap_or(from);
        let old = {
            let mut state = self.state.borrow_mut();
            let old = state.payload.take().zip(state.kind.take());
            state.payload = Some(working.clone());
            state.kind = Some(final_kind);
            state.loaded = true;
            state.busy = false;
            old
        };
        if let Some((payload, kind)) = old {
            if !payload.ptr_eq(&working) {
                self.services.registry().release(payload, kind);
            }
        }
        Ok(())
    }

    /// Release the payload and clear all state. Harmless on an
    /// already-empty record.
    pub fn destroy(&self) {
        let old = {
            let mut state = self.state.borrow_mut();
            state.loaded = false;
            state.context = None;
            state.payload.take().zip(state.kind.take())
        };
        if let Some((payload, kind)) = old {
            self.services.registry().release(payload, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_services, TestRegistry, TestTile, RAW, RGBA, TEXTURE};
    use futures::executor::LocalPool;

    fn record_with(
        pool: &LocalPool,
        registry: &Rc<TestRegistry>,
        content: &str,
        kind: DataKind,
    ) -> SimpleRecord {
        let record = SimpleRecord::new(test_services(registry, pool));
        record.set_data(Payload::new(content.to_string()), kind);
        record
    }

    #[test]
    fn test_set_data_releases_previous() {
        let pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "first", RAW);

        record.set_data(Payload::new("second".to_string()), RGBA);

        assert_eq!(record.kind(), Some(RGBA));
        assert_eq!(registry.released(), vec![RAW]);
    }

    #[test]
    fn test_transform_converts_in_place() {
        let mut pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "pixels", RAW);
        record.set_context(TestTile::new(1).as_owner());

        let fut = record.transform(&[TEXTURE]);
        pool.run_until(async move { fut.await.unwrap() });

        assert!(record.is_loaded());
        assert_eq!(record.kind(), Some(TEXTURE));
        // raw -> rgba -> texture
        assert_eq!(registry.conversions(), 2);
    }

    #[test]
    fn test_transform_noop_when_compatible() {
        let mut pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "pixels", RGBA);
        record.set_context(TestTile::new(1).as_owner());

        let fut = record.transform(&[RAW, RGBA]);
        pool.run_until(async move { fut.await.unwrap() });

        assert_eq!(record.kind(), Some(RGBA));
        assert_eq!(registry.conversions(), 0);
    }

    #[test]
    fn test_transform_falls_back_to_preferred_kinds() {
        let mut pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record =
            SimpleRecord::with_preferred_kinds(test_services(&registry, &pool), vec![RGBA]);
        record.set_data(Payload::new("pixels".to_string()), RAW);
        record.set_context(TestTile::new(1).as_owner());

        let fut = record.transform(&[]);
        pool.run_until(async move { fut.await.unwrap() });

        assert_eq!(record.kind(), Some(RGBA));
    }

    #[test]
    fn test_busy_is_raised_before_the_transform_is_polled() {
        let pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "pixels", RAW);
        record.set_context(TestTile::new(1).as_owner());

        let _conversion = record.transform(&[TEXTURE]);

        // callers checking the flag between frames must see it immediately
        assert!(record.is_busy());
    }

    #[test]
    #[should_panic(expected = "reference owner")]
    fn test_transform_without_context_panics() {
        let mut pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "pixels", RAW);

        let fut = record.transform(&[RGBA]);
        pool.run_until(async move {
            let _ = fut.await;
        });
    }

    #[test]
    fn test_transform_unreachable_target_leaves_record_unchanged() {
        let mut pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "pixels", TEXTURE);
        record.set_context(TestTile::new(1).as_owner());

        // no edge leaves "texture" toward "raw" in the default graph
        let fut = record.transform(&[RAW]);
        pool.run_until(async move { fut.await.unwrap() });

        assert!(record.is_loaded());
        assert_eq!(record.kind(), Some(TEXTURE));
        assert!(!record.is_busy());
    }

    #[test]
    fn test_failed_step_marks_not_loaded() {
        let mut pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        registry.fail_edge(RAW, RGBA);
        let record = record_with(&pool, &registry, "pixels", RAW);
        record.set_context(TestTile::new(1).as_owner());

        let fut = record.transform(&[RGBA]);
        let err = pool.run_until(async move { fut.await.unwrap_err() });

        assert!(matches!(err, CacheError::ConversionStepFailed { .. }));
        assert!(!record.is_loaded());
        assert!(!record.is_busy());
    }

    #[test]
    fn test_destroy_releases_payload() {
        let pool = LocalPool::new();
        let registry = TestRegistry::with_default_edges();
        let record = record_with(&pool, &registry, "pixels", RAW);

        record.destroy();
        assert!(!record.is_loaded());
        assert!(record.payload().is_none());
        assert_eq!(registry.released(), vec![RAW]);

        // destroying again releases nothing further
        record.destroy();
        assert_eq!(registry.released(), vec![RAW]);
    }
}
