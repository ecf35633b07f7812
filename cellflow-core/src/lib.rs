//! Cellflow Core
//!
//! This crate provides a single-threaded, push-based reactive dataflow
//! layer. It implements:
//!
//! - Value cells with synchronous, re-entrancy checked propagation
//! - Operator pipelines mixing synchronous and asynchronous steps
//! - Collection cells with structural change records and derived views
//! - Keyed map and set cells with per-key subscriptions
//! - Duplex cells carrying data in two directions
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: event channels, cancellation, value and duplex cells
//! - `pipeline`: operators and the interpreter that runs them
//! - `collection`: collection cells, change records, views and merging
//! - `keyed`: map and set cells
//! - `config`: leak diagnostics thresholds
//! - `error`: the crate error type
//!
//! # Example
//!
//! ```rust,ignore
//! use cellflow_core::pipeline::{filter, map};
//! use cellflow_core::reactive::ValueCell;
//!
//! let count = ValueCell::new(0);
//! let doubled = count.transform(filter(|v: &i32| *v > 0).then(map(|v: i32| v * 2)));
//!
//! doubled.listen(|v| println!("doubled: {v}"));
//! count.update(5)?; // prints "doubled: 10"
//! ```

pub mod collection;
pub mod config;
pub mod error;
pub mod keyed;
pub mod pipeline;
pub mod reactive;

pub use collection::{ChangeDetail, ChangeKind, CollectionCell, CollectionChange};
pub use config::Diagnostics;
pub use error::{CellError, CellResult};
pub use keyed::{MapCell, MapChange, SetCell, SetChange};
pub use pipeline::{Operator, Pipeline};
pub use reactive::{CancellationToken, DuplexCell, Subscription, ValueCell};
