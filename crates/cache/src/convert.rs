//! Conversion-registry boundary.
//!
//! The cache consumes conversion paths produced by an external registry;
//! it never searches the conversion graph itself. A path is an ordered
//! sequence of transform steps applied strictly in order, each of which may
//! resolve synchronously or later.

use std::fmt;
use std::rc::Rc;

use crate::data::{DataKind, DeferredPayload, Payload};
use crate::owner::OwnerRef;

/// Context handed to each transform step: the record's current reference
/// owner, when one is still alive. Transforms use it to reach owner
/// metadata such as tile geometry.
pub type TransformContext = Option<OwnerRef>;

/// One edge of a conversion path.
pub struct ConversionStep {
    origin: DataKind,
    target: DataKind,
    transform: Rc<dyn Fn(TransformContext, Payload) -> DeferredPayload>,
}

impl ConversionStep {
    /// Create a step converting `origin` data into `target` data.
    pub fn new(
        origin: DataKind,
        target: DataKind,
        transform: impl Fn(TransformContext, Payload) -> DeferredPayload + 'static,
    ) -> Self {
        Self {
            origin,
            target,
            transform: Rc::new(transform),
        }
    }

    /// Representation this step starts from.
    pub fn origin(&self) -> DataKind {
        self.origin
    }

    /// Representation this step produces.
    pub fn target(&self) -> DataKind {
        self.target
    }

    /// Run the transform against one payload.
    pub fn apply(&self, context: TransformContext, payload: Payload) -> DeferredPayload {
        (self.transform)(context, payload)
    }
}

impl fmt::Debug for ConversionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversionStep({} -> {})", self.origin, self.target)
    }
}

/// Ordered sequence of transform steps.
///
/// An empty path means the source representation is already acceptable.
#[derive(Debug)]
pub struct ConversionPath {
    steps: Vec<ConversionStep>,
}

impl ConversionPath {
    /// Build a path from its steps.
    pub fn new(steps: Vec<ConversionStep>) -> Self {
        Self { steps }
    }

    /// The steps, in application order.
    pub fn steps(&self) -> &[ConversionStep] {
        &self.steps
    }

    /// Representation the full path produces, if it has any steps.
    pub fn final_kind(&self) -> Option<DataKind> {
        self.steps.last().map(|step| step.target())
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the path has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// The conversion system the cache depends on.
///
/// Implementations own the conversion graph and the per-kind resource
/// lifecycle. The cache calls `release` for every payload it retires, so
/// kinds backed by pooled resources (GPU textures and the like) get their
/// buffers back even though `Payload` is reference counted.
pub trait ConversionRegistry {
    /// Ordered steps from `from` to the best match among `targets`, or
    /// `None` when no sequence of registered transforms reaches any of
    /// them.
    fn path_between(&self, from: DataKind, targets: &[DataKind]) -> Option<ConversionPath>;

    /// Deep copy of a payload, in the same representation.
    fn copy(&self, context: TransformContext, payload: &Payload, kind: DataKind)
        -> DeferredPayload;

    /// Destructor hook for a retired payload. May be a no-op for plain
    /// memory kinds.
    fn release(&self, payload: Payload, kind: DataKind);

    /// Best-effort representation guess for untagged data.
    fn guess_kind(&self, payload: &Payload) -> Option<DataKind>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future;
    use futures::FutureExt;

    const A: DataKind = DataKind::new("a");
    const B: DataKind = DataKind::new("b");

    #[test]
    fn test_step_apply() {
        let step = ConversionStep::new(A, B, |_context, payload| {
            let doubled = payload.downcast_ref::<u32>().copied().unwrap_or(0) * 2;
            future::ready(Ok(Payload::new(doubled))).boxed_local()
        });

        assert_eq!(step.origin(), A);
        assert_eq!(step.target(), B);

        let out = block_on(step.apply(None, Payload::new(21u32))).unwrap();
        assert_eq!(out.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_path_final_kind() {
        let path = ConversionPath::new(vec![
            ConversionStep::new(A, B, |_c, p| future::ready(Ok(p)).boxed_local()),
        ]);
        assert_eq!(path.len(), 1);
        assert_eq!(path.final_kind(), Some(B));

        let empty = ConversionPath::new(vec![]);
        assert!(empty.is_empty());
        assert_eq!(empty.final_kind(), None);
    }
}
