//! Coordinator-side state of the three invocation protocols.

pub(crate) mod inner;
pub mod selection;
pub(crate) mod task;

pub use selection::{SelectionEvent, SelectionFuture};
