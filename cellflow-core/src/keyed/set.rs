//! Set Cells
//!
//! A [`SetCell`] is an insertion-ordered observable set. Like
//! [`MapCell`](super::MapCell) it has a whole-collection channel and lazily
//! created per-key channels that fire within the same call.
//!
//! # Set Algebra
//!
//! `union`, `intersection`, `difference` and `symmetric_difference` derive a
//! new set that is kept up to date key by key: a change of one key in either
//! operand only re-evaluates that key.

use std::cell::{Cell, RefCell};
use std::hash::Hash;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::Diagnostics;
use crate::error::CellResult;
use crate::reactive::{
    next_cell_id, CancellationToken, EventChannel, Listener, ListenerOutput, Subscription, UpdateGuard, UpdateState,
};

/// One membership change of a [`SetCell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetChange<K> {
    pub key: K,
    pub exists: bool,
}

struct SetInner<K: 'static> {
    id: u64,
    data: RefCell<IndexSet<K>>,
    state: Cell<UpdateState>,
    updates: EventChannel<SetChange<K>>,
    sources: CancellationToken,
    keyed: RefCell<IndexMap<K, EventChannel<SetChange<K>>>>,
    diagnostics: Rc<Diagnostics>,
}

/// An observable, insertion-ordered set.
pub struct SetCell<K: Hash + Eq + Clone + 'static> {
    inner: Rc<SetInner<K>>,
}

impl<K: Hash + Eq + Clone + 'static> SetCell<K> {
    pub fn new() -> Self {
        Self::with_diagnostics(IndexSet::new(), Rc::new(Diagnostics::default()))
    }

    pub fn from_keys(keys: impl IntoIterator<Item = K>) -> Self {
        Self::with_diagnostics(keys.into_iter().collect(), Rc::new(Diagnostics::default()))
    }

    pub fn with_diagnostics(data: IndexSet<K>, diagnostics: Rc<Diagnostics>) -> Self {
        Self {
            inner: Rc::new(SetInner {
                id: next_cell_id(),
                data: RefCell::new(data),
                state: Cell::new(UpdateState::Idle),
                updates: EventChannel::with_diagnostics(diagnostics.clone()),
                sources: CancellationToken::with_diagnostics(diagnostics.clone()),
                keyed: RefCell::new(IndexMap::new()),
                diagnostics,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner.data.borrow().contains(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.data.borrow().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.borrow().is_empty()
    }

    fn guard(&self) -> CellResult<UpdateGuard<'_>> {
        UpdateGuard::enter(&self.inner.state, || format!("set#{}", self.inner.id))
    }

    /// Add `key`. Returns whether it was newly added; existing keys fire
    /// nothing.
    pub fn add(&self, key: K) -> CellResult<bool> {
        let _guard = self.guard()?;
        if !self.inner.data.borrow_mut().insert(key.clone()) {
            return Ok(false);
        }
        self.publish(SetChange { key, exists: true })?;
        Ok(true)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &K) -> CellResult<bool> {
        let _guard = self.guard()?;
        if !self.inner.data.borrow_mut().shift_remove(key) {
            return Ok(false);
        }
        self.publish(SetChange {
            key: key.clone(),
            exists: false,
        })?;
        Ok(true)
    }

    /// Flip membership of `key`, returning whether it is now present.
    pub fn toggle(&self, key: K) -> CellResult<bool> {
        if self.has(&key) {
            self.delete(&key).map(|_| false)
        } else {
            self.add(key)
        }
    }

    /// Remove every key, firing one change per key.
    pub fn clear(&self) -> CellResult<()> {
        let _guard = self.guard()?;
        let removed = std::mem::take(&mut *self.inner.data.borrow_mut());

        let mut result = Ok(());
        for key in removed {
            result = result.and(self.publish(SetChange { key, exists: false }));
        }
        result
    }

    /// Replay a change recorded on another set.
    pub fn apply_set_change(&self, change: &SetChange<K>) -> CellResult<()> {
        if change.exists {
            self.add(change.key.clone()).map(|_| ())
        } else {
            self.delete(&change.key).map(|_| ())
        }
    }

    fn publish(&self, change: SetChange<K>) -> CellResult<()> {
        trace!(set = self.inner.id, exists = change.exists, "set cell changed");
        let whole = self.inner.updates.fire(&change);
        let channel = self.inner.keyed.borrow().get(&change.key).cloned();
        let keyed = match channel {
            Some(channel) => channel.fire(&change),
            None => Ok(()),
        };
        whole.and(keyed)
    }

    pub fn listen<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&SetChange<K>) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.updates.subscribe(callback)
    }

    /// Replay every key as an addition, then listen.
    pub fn listen_and_repeat<F, R>(&self, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&SetChange<K>) -> R + 'static,
        R: ListenerOutput,
    {
        let listener: Listener<SetChange<K>> = Rc::new(move |c: &SetChange<K>| callback(c).into_result());
        for key in self.keys() {
            listener(&SetChange { key, exists: true })?;
        }
        Ok(self.inner.updates.attach(listener, false))
    }

    /// Listen to membership changes of one key.
    pub fn listen_on_key<F, R>(&self, key: &K, callback: F) -> Subscription
    where
        F: Fn(&SetChange<K>) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner
            .keyed
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(|| EventChannel::with_diagnostics(self.inner.diagnostics.clone()))
            .clone()
            .subscribe(callback)
    }

    pub fn union(&self, other: &SetCell<K>) -> SetCell<K> {
        self.algebra(other, "union", |a, b| a || b)
    }

    pub fn intersection(&self, other: &SetCell<K>) -> SetCell<K> {
        self.algebra(other, "intersection", |a, b| a && b)
    }

    /// Keys in this set but not in `other`.
    pub fn difference(&self, other: &SetCell<K>) -> SetCell<K> {
        self.algebra(other, "difference", |a, b| a && !b)
    }

    pub fn symmetric_difference(&self, other: &SetCell<K>) -> SetCell<K> {
        self.algebra(other, "symmetric_difference", |a, b| a != b)
    }

    fn algebra(&self, other: &SetCell<K>, name: &str, rule: fn(bool, bool) -> bool) -> SetCell<K> {
        let seed: IndexSet<K> = self
            .keys()
            .into_iter()
            .chain(other.keys())
            .filter(|k| rule(self.has(k), other.has(k)))
            .collect();
        let result = SetCell::with_diagnostics(seed, self.inner.diagnostics.clone());

        let left = Rc::downgrade(&self.inner);
        let right = Rc::downgrade(&other.inner);
        for source in [self, other] {
            let (left, right) = (left.clone(), right.clone());
            let feed = source.listen({
                let result = result.clone();
                move |change: &SetChange<K>| {
                    let wanted = rule(is_member(&left, &change.key), is_member(&right, &change.key));
                    if wanted {
                        result.add(change.key.clone()).map(|_| ())
                    } else {
                        result.delete(&change.key).map(|_| ())
                    }
                }
            });
            result.bind_source(&feed);
        }

        debug!(set = result.inner.id, operation = name, "derived set created");
        result
    }

    pub fn has_subscriptions(&self) -> bool {
        self.inner.updates.has_subscriptions()
            || self.inner.keyed.borrow().values().any(|c| c.has_subscriptions())
    }

    /// Drop every listener and, for derived sets, detach from both inputs.
    pub fn cancel_all(&self) {
        self.inner.updates.cancel_all();
        for channel in std::mem::take(&mut *self.inner.keyed.borrow_mut()).into_values() {
            channel.cancel_all();
        }
        self.inner.sources.cancel();
    }

    /// Remove `subscription`, which feeds this cell, once this cell is
    /// cancelled.
    pub(crate) fn bind_source(&self, subscription: &Subscription) {
        // Only fails on a cancelled cell, and then removes the subscription.
        let _ = subscription.clone().until(&self.inner.sources);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

fn is_member<K: Hash + Eq + 'static>(set: &Weak<SetInner<K>>, key: &K) -> bool {
    set.upgrade().is_some_and(|inner| inner.data.borrow().contains(key))
}

impl<K: Hash + Eq + Clone + 'static> Clone for SetCell<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: Hash + Eq + Clone + 'static> Default for SetCell<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + 'static> PartialEq for SetCell<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<K: Hash + Eq + Clone + std::fmt::Debug + 'static> std::fmt::Debug for SetCell<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.inner.data.borrow().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_delete_toggle() {
        let set = SetCell::new();
        assert!(set.add(1).unwrap());
        assert!(!set.add(1).unwrap());
        assert!(set.toggle(2).unwrap());
        assert!(!set.toggle(1).unwrap());
        assert_eq!(set.keys(), vec![2]);
        assert!(set.delete(&2).unwrap());
        assert!(set.is_empty());
    }

    #[test]
    fn only_real_changes_fire() {
        let set = SetCell::from_keys(["a"]);
        let changes = Rc::new(RefCell::new(Vec::new()));
        {
            let changes = changes.clone();
            set.listen(move |c: &SetChange<&str>| changes.borrow_mut().push(c.clone()));
        }

        set.add("a").unwrap();
        set.delete(&"missing").unwrap();
        set.add("b").unwrap();
        assert_eq!(*changes.borrow(), vec![SetChange { key: "b", exists: true }]);
    }

    #[test]
    fn key_listeners_only_see_their_key() {
        let set = SetCell::new();
        let seen = Rc::new(Cell::new(0));
        {
            let seen = seen.clone();
            set.listen_on_key(&"x", move |_: &SetChange<&str>| seen.set(seen.get() + 1));
        }

        set.add("y").unwrap();
        set.add("x").unwrap();
        set.delete(&"x").unwrap();
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn algebra_tracks_both_operands() {
        let a = SetCell::from_keys([1, 2, 3]);
        let b = SetCell::from_keys([3, 4]);

        let union = a.union(&b);
        let both = a.intersection(&b);
        let only_a = a.difference(&b);
        let either = a.symmetric_difference(&b);

        assert_eq!(union.keys(), vec![1, 2, 3, 4]);
        assert_eq!(both.keys(), vec![3]);
        assert_eq!(only_a.keys(), vec![1, 2]);
        assert_eq!(either.keys(), vec![1, 2, 4]);

        b.add(1).unwrap();
        a.delete(&3).unwrap();

        assert!(both.has(&1));
        assert!(!both.has(&3));
        assert!(!only_a.has(&1));
        assert!(either.has(&3));
        assert!(!either.has(&1));
        assert!(union.has(&3));
    }

    #[test]
    fn cancelled_derived_set_leaves_its_operands() {
        let a = SetCell::from_keys([1]);
        let b = SetCell::from_keys([2]);
        let union = a.union(&b);
        assert!(a.has_subscriptions() && b.has_subscriptions());

        union.cancel_all();
        assert!(!a.has_subscriptions());
        assert!(!b.has_subscriptions());

        a.add(5).unwrap();
        assert!(!union.has(&5));
    }

    #[test]
    fn replaying_changes_mirrors_the_set() {
        let source = SetCell::new();
        let mirror = SetCell::new();
        {
            let mirror = mirror.clone();
            source.listen(move |c: &SetChange<u32>| mirror.apply_set_change(c));
        }

        source.add(1).unwrap();
        source.add(2).unwrap();
        source.toggle(1).unwrap();
        source.clear().unwrap();
        source.add(7).unwrap();
        assert_eq!(mirror.keys(), vec![7]);
    }

    #[test]
    fn listen_and_repeat_replays_members() {
        let set = SetCell::from_keys(['a', 'b']);
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            set.listen_and_repeat(move |c: &SetChange<char>| seen.borrow_mut().push(c.key)).unwrap();
        }
        set.add('c').unwrap();
        assert_eq!(*seen.borrow(), vec!['a', 'b', 'c']);
    }
}
