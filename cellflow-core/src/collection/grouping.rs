//! Keyed projections of a collection.
//!
//! [`group_by`](CollectionCell::group_by) splits a collection into one
//! sub-collection per key and [`index_by`](CollectionCell::index_by) keeps
//! one item per key. Both are maintained from the parent's changes.

use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use super::array::CollectionCell;
use super::change::{ChangeDetail, CollectionChange};
use crate::config::Diagnostics;
use crate::error::CellResult;
use crate::keyed::MapCell;

impl<T: Clone + PartialEq + 'static> CollectionCell<T> {
    /// Group the items by `key`.
    ///
    /// Each group holds its items in parent order. Groups are created when
    /// their first item arrives and deleted when their last item leaves. The
    /// map follows the parent until either of them is cancelled.
    pub fn group_by<K, F>(&self, key: F) -> MapCell<K, CollectionCell<T>>
    where
        K: Hash + Eq + Clone + 'static,
        F: Fn(&T) -> K + 'static,
    {
        let grouping = Grouping {
            groups: MapCell::with_diagnostics(IndexMap::new(), self.diagnostics()),
            key,
            diagnostics: self.diagnostics(),
        };

        let initial = grouping.partition(&self.data());
        for (k, items) in initial {
            let group = grouping.group(items);
            // A fresh map has no listeners to fail.
            let _ = grouping.groups.set(k, group);
        }

        let groups = grouping.groups.clone();
        debug!(source = self.id(), groups = groups.len(), "group view attached");
        groups.bind_source(&self.listen(move |change: &CollectionChange<T>| grouping.apply(change)));
        groups
    }

    /// Index the items by `key`.
    ///
    /// A key maps to the item most recently added under it. When that item
    /// is removed the key falls back to the last remaining item with the
    /// same key, or is deleted. Cancelling the map detaches it.
    pub fn index_by<K, F>(&self, key: F) -> MapCell<K, T>
    where
        K: Hash + Eq + Clone + 'static,
        F: Fn(&T) -> K + 'static,
    {
        let index = Index {
            entries: MapCell::with_diagnostics(IndexMap::new(), self.diagnostics()),
            key,
        };
        for item in self.data().iter() {
            let _ = index.entries.set((index.key)(item), item.clone());
        }

        let entries = index.entries.clone();
        debug!(source = self.id(), keys = entries.len(), "index view attached");
        entries.bind_source(&self.listen(move |change: &CollectionChange<T>| index.apply(change)));
        entries
    }
}

struct Grouping<K, T, F>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    groups: MapCell<K, CollectionCell<T>>,
    key: F,
    diagnostics: Rc<Diagnostics>,
}

impl<K, T, F> Grouping<K, T, F>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + PartialEq + 'static,
    F: Fn(&T) -> K,
{
    fn group(&self, items: Vec<T>) -> CollectionCell<T> {
        CollectionCell::with_diagnostics(items, self.diagnostics.clone())
    }

    fn partition(&self, items: &[T]) -> IndexMap<K, Vec<T>> {
        let mut groups: IndexMap<K, Vec<T>> = IndexMap::new();
        for item in items {
            groups.entry((self.key)(item)).or_default().push(item.clone());
        }
        groups
    }

    /// Position within the `key` group of parent slot `end`.
    fn rank(&self, state: &[T], end: usize, key: &K) -> usize {
        state[..end.min(state.len())]
            .iter()
            .filter(|item| (self.key)(item) == *key)
            .count()
    }

    fn apply(&self, change: &CollectionChange<T>) -> CellResult<()> {
        let state = change.new_state.as_slice();
        match change.operation_detailed {
            ChangeDetail::Append | ChangeDetail::Prepend | ChangeDetail::Insert => {
                self.add(state, change.index, &change.items)
            }
            ChangeDetail::RemoveLeft | ChangeDetail::RemoveRight | ChangeDetail::Remove => {
                self.remove(state, change.index, &change.items)
            }
            ChangeDetail::Clear => self.groups.clear(),
            ChangeDetail::Replace => match (change.target.as_ref(), change.items.first()) {
                (Some(old), Some(new)) => self.replace(state, change.index, old, new),
                _ => self.rebuild(state),
            },
            ChangeDetail::Swap => {
                let affected: Vec<K> = [Some(change.index), change.index2]
                    .into_iter()
                    .flatten()
                    .filter_map(|i| state.get(i))
                    .map(|item| (self.key)(item))
                    .collect();
                for k in affected {
                    self.sync(state, k)?;
                }
                Ok(())
            }
            ChangeDetail::Merge => self.rebuild(state),
        }
    }

    fn add(&self, state: &[T], index: usize, items: &[T]) -> CellResult<()> {
        for (offset, item) in items.iter().enumerate() {
            let k = (self.key)(item);
            let at = self.rank(state, index + offset, &k);
            match self.groups.get(&k) {
                Some(group) => group.insert_at(at.min(group.len()), [item.clone()])?,
                None => self.groups.set(k, self.group(vec![item.clone()]))?,
            }
        }
        Ok(())
    }

    /// Same-key items of a removed range are adjacent within their group,
    /// so each one sits at the group position of the range start.
    fn remove(&self, state: &[T], index: usize, items: &[T]) -> CellResult<()> {
        for item in items {
            let k = (self.key)(item);
            self.remove_one(state, index, &k)?;
        }
        Ok(())
    }

    fn remove_one(&self, state: &[T], index: usize, k: &K) -> CellResult<()> {
        let Some(group) = self.groups.get(k) else {
            return Ok(());
        };
        let at = self.rank(state, index, k);
        if at < group.len() {
            group.remove_at(at)?;
        }
        if group.is_empty() {
            self.groups.delete(k)?;
        }
        Ok(())
    }

    fn replace(&self, state: &[T], index: usize, old: &T, new: &T) -> CellResult<()> {
        let (old_key, new_key) = ((self.key)(old), (self.key)(new));
        if old_key == new_key {
            return match self.groups.get(&new_key) {
                Some(group) => group.set(self.rank(state, index, &new_key), new.clone()).map(drop),
                None => self.sync(state, new_key),
            };
        }

        self.remove_one(state, index, &old_key)?;
        self.add(state, index, std::slice::from_ref(new))
    }

    /// Recompute one group from the parent.
    fn sync(&self, state: &[T], k: K) -> CellResult<()> {
        let items: Vec<T> = state.iter().filter(|item| (self.key)(item) == k).cloned().collect();
        match self.groups.get(&k) {
            Some(_) if items.is_empty() => self.groups.delete(&k).map(drop),
            Some(group) => group.merge(items),
            None if items.is_empty() => Ok(()),
            None => self.groups.set(k, self.group(items)),
        }
    }

    fn rebuild(&self, state: &[T]) -> CellResult<()> {
        let wanted = self.partition(state);
        for stale in self.groups.keys().into_iter().filter(|k| !wanted.contains_key(k)) {
            self.groups.delete(&stale)?;
        }
        for (k, items) in wanted {
            match self.groups.get(&k) {
                Some(group) => group.merge(items)?,
                None => self.groups.set(k, self.group(items))?,
            }
        }
        Ok(())
    }
}

struct Index<K, T, F>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    entries: MapCell<K, T>,
    key: F,
}

impl<K, T, F> Index<K, T, F>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + PartialEq + 'static,
    F: Fn(&T) -> K,
{
    fn apply(&self, change: &CollectionChange<T>) -> CellResult<()> {
        let state = change.new_state.as_slice();
        match change.operation_detailed {
            ChangeDetail::Append | ChangeDetail::Prepend | ChangeDetail::Insert => {
                for item in &change.items {
                    self.entries.set((self.key)(item), item.clone())?;
                }
                Ok(())
            }
            ChangeDetail::RemoveLeft | ChangeDetail::RemoveRight | ChangeDetail::Remove => {
                for item in &change.items {
                    self.forget(state, item)?;
                }
                Ok(())
            }
            ChangeDetail::Clear => self.entries.clear(),
            ChangeDetail::Replace => {
                if let Some(old) = &change.target {
                    self.forget(state, old)?;
                }
                match change.items.first() {
                    Some(new) => self.entries.set((self.key)(new), new.clone()),
                    None => Ok(()),
                }
            }
            ChangeDetail::Swap => Ok(()),
            ChangeDetail::Merge => self.rebuild(state),
        }
    }

    /// Drop `item` from the index, falling back to the last remaining item
    /// with its key.
    fn forget(&self, state: &[T], item: &T) -> CellResult<()> {
        let k = (self.key)(item);
        if self.entries.get(&k).as_ref() != Some(item) {
            return Ok(());
        }
        match state.iter().rev().find(|other| (self.key)(other) == k) {
            Some(fallback) => self.entries.set(k, fallback.clone()),
            None => self.entries.delete(&k).map(drop),
        }
    }

    fn rebuild(&self, state: &[T]) -> CellResult<()> {
        let mut wanted: IndexMap<K, T> = IndexMap::new();
        for item in state {
            wanted.insert((self.key)(item), item.clone());
        }

        for stale in self.entries.keys().into_iter().filter(|k| !wanted.contains_key(k)) {
            self.entries.delete(&stale)?;
        }
        for (k, item) in wanted {
            if self.entries.get(&k).as_ref() != Some(&item) {
                self.entries.set(k, item)?;
            }
        }
        Ok(())
    }
}
