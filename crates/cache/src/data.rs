//! Payload and type-tag model shared by all cache records.
//!
//! A [`Payload`] is an opaque, shared handle to one decoded tile buffer;
//! the [`DataKind`] tag names its representation. Conversions between
//! representations go through the conversion registry, never through the
//! payload itself.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::error::CacheResult;

/// Tag naming a data representation (for example `"rgba"`, `"png"`,
/// `"texture"`).
///
/// Kinds are interned static names; comparing them is cheap and two kinds
/// are equal exactly when their names are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataKind(&'static str);

impl DataKind {
    /// Create a kind from its interned name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The interned name of this kind.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Shared handle to one decoded tile payload.
///
/// Cloning the handle aliases the same underlying buffer; deep copies go
/// through the conversion registry's `copy`. The cache releases retired
/// payloads through the registry's `release` hook, so payload contents
/// should not assume `Drop` is their only teardown path.
#[derive(Clone)]
pub struct Payload(Rc<dyn Any>);

impl Payload {
    /// Wrap a concrete value as a payload.
    pub fn new<T: 'static>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Borrow the contained value if it is of type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether two handles point at the same buffer.
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({:p})", Rc::as_ptr(&self.0))
    }
}

/// A payload that settles later on the single-threaded executor.
pub type DeferredPayload = LocalBoxFuture<'static, CacheResult<Payload>>;

/// What an owner supplies when attaching data to a record.
pub enum PayloadSource {
    /// Concrete value, installed immediately.
    Ready(Payload),
    /// Settles later; the record stays unloaded until it does.
    Deferred(DeferredPayload),
    /// Producer invoked only if the record actually absorbs the data.
    Lazy(Box<dyn FnOnce() -> PayloadSource>),
}

impl PayloadSource {
    /// Collapse `Lazy` wrappers into a concrete source.
    pub(crate) fn resolve(self) -> PayloadSource {
        let mut source = self;
        loop {
            match source {
                PayloadSource::Lazy(producer) => source = producer(),
                other => return other,
            }
        }
    }
}

impl From<Payload> for PayloadSource {
    fn from(payload: Payload) -> Self {
        PayloadSource::Ready(payload)
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Ready(p) => f.debug_tuple("Ready").field(p).finish(),
            PayloadSource::Deferred(_) => f.write_str("Deferred(..)"),
            PayloadSource::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}
