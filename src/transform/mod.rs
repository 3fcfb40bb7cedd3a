//! Per-item transforms plugged into pipeline stages.

mod adapters;
mod demo;
mod emit;

pub use adapters::{expand, filter, map, try_map, Expand, Filter, Map, TryMap};
pub use demo::DemoTransform;
pub use emit::{Emit, Transform};
