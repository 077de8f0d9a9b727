//! Contract every poolable block view satisfies.

use std::any::{Any, TypeId};

/// A block view that can be parked in an [`AttachmentPool`](super::AttachmentPool).
///
/// Pooled views are heterogeneous; the pool stores them as trait objects and checks the concrete
/// type with [`TypeId`] when handing one back.
pub trait PooledView: Any + Send {
    /// Reset transient state before the view is reused for different content. Must be idempotent.
    fn prepare_for_reuse(&mut self);

    /// Detach the view from whatever visual parent currently hosts it.
    fn detach(&mut self) {}

    /// Concrete type tag of this view.
    fn view_type(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    /// Upcast used for the checked downcast in `dequeue`.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Short type name for log fields.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
