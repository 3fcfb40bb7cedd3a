//! Bounded queues and the work items that flow through them.

mod bounded;
mod item;

pub use bounded::{BoundedQueue, Closeable};
pub use item::WorkItem;
