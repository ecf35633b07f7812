//! Collection change records.
//!
//! Every mutation of a [`CollectionCell`](super::CollectionCell) is described
//! by exactly one [`CollectionChange`]. The record carries enough to replay
//! the mutation on a copy of the collection, and `new_state` always holds the
//! complete sequence after the mutation so a consumer can resynchronize from
//! scratch at any point.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Coarse category of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Remove,
    Replace,
    Swap,
    Merge,
}

/// Exact mutation that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetail {
    /// Items added at the end; `index` is the old length.
    Append,
    /// Items added at the front.
    Prepend,
    /// Items added at `index`.
    Insert,
    /// `count` items removed from the front.
    RemoveLeft,
    /// `count` items removed from the end; `index` is the new length.
    RemoveRight,
    /// `count` items removed starting at `index`.
    Remove,
    /// Every item removed.
    Clear,
    /// The items at `index` and `index2` traded places.
    Swap,
    /// The item at `index` was replaced; `target` holds the old item.
    Replace,
    /// The whole sequence was reconciled against `items`.
    Merge,
}

impl ChangeDetail {
    pub fn kind(self) -> ChangeKind {
        match self {
            Self::Append | Self::Prepend | Self::Insert => ChangeKind::Add,
            Self::RemoveLeft | Self::RemoveRight | Self::Remove | Self::Clear => ChangeKind::Remove,
            Self::Swap => ChangeKind::Swap,
            Self::Replace => ChangeKind::Replace,
            Self::Merge => ChangeKind::Merge,
        }
    }
}

/// One mutation of a collection cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionChange<T> {
    pub operation: ChangeKind,
    pub operation_detailed: ChangeDetail,
    pub index: usize,
    #[serde(default)]
    pub index2: Option<usize>,
    #[serde(default)]
    pub count: Option<usize>,
    /// Added items for additions, removed items for removals, the new item
    /// for replacements, the swapped items for swaps and the merged
    /// sequence for merges.
    pub items: Vec<T>,
    /// The replaced item.
    #[serde(default)]
    pub target: Option<T>,
    /// The whole sequence after the mutation.
    pub new_state: Rc<Vec<T>>,
    /// The whole sequence before the mutation, for clears and merges.
    #[serde(default)]
    pub previous_state: Option<Rc<Vec<T>>>,
}

impl<T> CollectionChange<T> {
    /// Number of items the change adds or removes.
    pub fn len(&self) -> usize {
        self.count.unwrap_or(self.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A change before the mutation has produced its new state.
pub(crate) struct ChangeDraft<T> {
    pub detail: ChangeDetail,
    pub index: usize,
    pub index2: Option<usize>,
    pub count: Option<usize>,
    pub items: Vec<T>,
    pub target: Option<T>,
    pub previous_state: Option<Rc<Vec<T>>>,
}

impl<T> ChangeDraft<T> {
    pub fn new(detail: ChangeDetail, index: usize, items: Vec<T>) -> Self {
        Self {
            detail,
            index,
            index2: None,
            count: None,
            items,
            target: None,
            previous_state: None,
        }
    }

    pub fn counted(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn finish(self, new_state: Rc<Vec<T>>) -> CollectionChange<T> {
        CollectionChange {
            operation: self.detail.kind(),
            operation_detailed: self.detail,
            index: self.index,
            index2: self.index2,
            count: self.count,
            items: self.items,
            target: self.target,
            new_state,
            previous_state: self.previous_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_map_to_kinds() {
        assert_eq!(ChangeDetail::Prepend.kind(), ChangeKind::Add);
        assert_eq!(ChangeDetail::Clear.kind(), ChangeKind::Remove);
        assert_eq!(ChangeDetail::Merge.kind(), ChangeKind::Merge);
    }

    #[test]
    fn serialized_names_are_snake_case() {
        let json = serde_json::to_string(&ChangeDetail::RemoveLeft).unwrap();
        assert_eq!(json, "\"remove_left\"");
    }

    #[test]
    fn missing_optional_fields_default() {
        let change: CollectionChange<i32> = serde_json::from_str(
            r#"{"operation":"add","operation_detailed":"append","index":0,"items":[1],"new_state":[1]}"#,
        )
        .unwrap();
        assert_eq!(change.len(), 1);
        assert_eq!(change.previous_state, None);
        assert_eq!(*change.new_state, vec![1]);
    }
}
