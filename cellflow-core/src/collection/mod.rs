//! Collection Cells
//!
//! Observable ordered sequences that describe every mutation as a
//! [`CollectionChange`], plus views derived from them.
//!
//! # Overview
//!
//! - [`CollectionCell`]: the sequence itself and its mutators
//! - views: `map`, `filter`, `sort`, `reverse`, `slice`, `unique` and
//!   `flatten`, each a collection cell maintained from its parent's changes
//! - grouping: `group_by` and `index_by`, which project a collection into a
//!   [`MapCell`](crate::keyed::MapCell)
//! - [`reconcile`]: the merge algorithm behind `merge`
//!
//! Change records are serializable, so a remote copy can be kept in sync by
//! shipping changes and replaying them with
//! [`apply_collection_change`](CollectionCell::apply_collection_change).

mod array;
mod change;
mod grouping;
mod merge;
mod views;

pub use array::{CollectionCell, WeakCollectionCell};
pub use change::{ChangeDetail, ChangeKind, CollectionChange};
pub use merge::{reconcile, MergeStep};
