//! Keyed Cells
//!
//! Observable maps and sets. Both keep insertion order (backed by
//! `indexmap`) and offer per-key subscriptions next to the whole-collection
//! channel, so a consumer interested in a single key is not woken by
//! changes to any other.

mod map;
mod set;

pub use map::{MapCell, MapChange};
pub use set::{SetCell, SetChange};
