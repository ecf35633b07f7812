//! Map Cells
//!
//! A [`MapCell`] is an insertion-ordered key/value store with a
//! whole-collection change channel and lazily created per-key channels.
//! Every mutation fires the whole-collection channel first and then the
//! channel of the key it touched, before the mutating call returns.

use std::cell::{Cell, RefCell};
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::Diagnostics;
use crate::error::{CellError, CellResult};
use crate::reactive::{
    next_cell_id, CancellationToken, EventChannel, Listener, ListenerOutput, Subscription, UpdateGuard, UpdateState,
    ValueCell,
};

/// One mutation of a [`MapCell`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapChange<K, V> {
    pub key: K,
    pub old_value: Option<V>,
    pub new_value: Option<V>,
    pub deleted: bool,
}

impl<K, V> MapChange<K, V> {
    fn set(key: K, old_value: Option<V>, new_value: V) -> Self {
        Self {
            key,
            old_value,
            new_value: Some(new_value),
            deleted: false,
        }
    }

    fn delete(key: K, old_value: V) -> Self {
        Self {
            key,
            old_value: Some(old_value),
            new_value: None,
            deleted: true,
        }
    }
}

struct MapInner<K: 'static, V: 'static> {
    id: u64,
    data: RefCell<IndexMap<K, V>>,
    state: Cell<UpdateState>,
    updates: EventChannel<MapChange<K, V>>,
    sources: CancellationToken,
    keyed: RefCell<IndexMap<K, EventChannel<MapChange<K, V>>>>,
    diagnostics: Rc<Diagnostics>,
}

/// An observable, insertion-ordered map.
pub struct MapCell<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    inner: Rc<MapInner<K, V>>,
}

impl<K, V> MapCell<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    pub fn new() -> Self {
        Self::with_diagnostics(IndexMap::new(), Rc::new(Diagnostics::default()))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self::with_diagnostics(entries.into_iter().collect(), Rc::new(Diagnostics::default()))
    }

    pub fn with_diagnostics(data: IndexMap<K, V>, diagnostics: Rc<Diagnostics>) -> Self {
        Self {
            inner: Rc::new(MapInner {
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

    pub fn diagnostics(&self) -> Rc<Diagnostics> {
        self.inner.diagnostics.clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.data.borrow().get(key).cloned()
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner.data.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.data.borrow().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.data.borrow().values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .data
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.borrow().is_empty()
    }

    /// Insert or overwrite `key`.
    pub fn set(&self, key: K, value: V) -> CellResult<()> {
        let _guard = UpdateGuard::enter(&self.inner.state, || format!("map#{}", self.inner.id))?;
        let old = self.inner.data.borrow_mut().insert(key.clone(), value.clone());
        self.publish(MapChange::set(key, old, value))
    }

    /// Remove `key`, returning its value. Missing keys fire nothing.
    pub fn delete(&self, key: &K) -> CellResult<Option<V>> {
        let _guard = UpdateGuard::enter(&self.inner.state, || format!("map#{}", self.inner.id))?;
        let Some(old) = self.inner.data.borrow_mut().shift_remove(key) else {
            return Ok(None);
        };
        self.publish(MapChange::delete(key.clone(), old.clone()))?;
        Ok(Some(old))
    }

    /// Remove every entry, firing one deletion per key.
    pub fn clear(&self) -> CellResult<()> {
        let _guard = UpdateGuard::enter(&self.inner.state, || format!("map#{}", self.inner.id))?;
        let removed = std::mem::take(&mut *self.inner.data.borrow_mut());

        let mut result = Ok(());
        for (key, old) in removed {
            result = result.and(self.publish(MapChange::delete(key, old)));
        }
        result
    }

    /// Set every entry of `entries`; keys not mentioned are kept.
    pub fn merge(&self, entries: IndexMap<K, V>) -> CellResult<()> {
        let mut result = Ok(());
        for (key, value) in entries {
            result = result.and(self.set(key, value));
        }
        result
    }

    /// Replay a change recorded on another map.
    pub fn apply_map_change(&self, change: &MapChange<K, V>) -> CellResult<()> {
        if change.deleted {
            return self.delete(&change.key).map(|_| ());
        }
        match &change.new_value {
            Some(value) => self.set(change.key.clone(), value.clone()),
            None => Err(CellError::InvalidChange("set change without a new value".into())),
        }
    }

    fn publish(&self, change: MapChange<K, V>) -> CellResult<()> {
        trace!(map = self.inner.id, deleted = change.deleted, "map cell changed");
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
        F: Fn(&MapChange<K, V>) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.updates.subscribe(callback)
    }

    /// Replay every entry as a set change, then listen.
    pub fn listen_and_repeat<F, R>(&self, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&MapChange<K, V>) -> R + 'static,
        R: ListenerOutput,
    {
        let listener: Listener<MapChange<K, V>> = Rc::new(move |c: &MapChange<K, V>| callback(c).into_result());
        for (key, value) in self.entries() {
            listener(&MapChange::set(key, None, value))?;
        }
        Ok(self.inner.updates.attach(listener, false))
    }

    fn key_channel(&self, key: &K) -> EventChannel<MapChange<K, V>> {
        self.inner
            .keyed
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(|| EventChannel::with_diagnostics(self.inner.diagnostics.clone()))
            .clone()
    }

    /// Listen to changes of one key.
    pub fn listen_on_key<F, R>(&self, key: &K, callback: F) -> Subscription
    where
        F: Fn(&MapChange<K, V>) -> R + 'static,
        R: ListenerOutput,
    {
        self.key_channel(key).subscribe(callback)
    }

    /// Replay the key's current value (when present), then listen to it.
    pub fn listen_on_key_and_repeat<F, R>(&self, key: &K, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&MapChange<K, V>) -> R + 'static,
        R: ListenerOutput,
    {
        let listener: Listener<MapChange<K, V>> = Rc::new(move |c: &MapChange<K, V>| callback(c).into_result());
        if let Some(value) = self.get(key) {
            listener(&MapChange::set(key.clone(), None, value))?;
        }
        Ok(self.key_channel(key).attach(listener, false))
    }

    /// A value cell following one key. It keeps its last value when the key
    /// is deleted.
    pub fn pick(&self, key: &K) -> ValueCell<V> {
        let cell = ValueCell::with_diagnostics(self.get(key), self.diagnostics());
        let target = cell.clone();
        cell.bind_source(&self.listen_on_key(key, move |change: &MapChange<K, V>| match &change.new_value {
            Some(value) => target.update(value.clone()),
            None => Ok(()),
        }));
        cell
    }

    pub fn has_subscriptions(&self) -> bool {
        self.inner.updates.has_subscriptions()
            || self.inner.keyed.borrow().values().any(|c| c.has_subscriptions())
    }

    /// Drop every whole-collection and per-key listener, and detach from
    /// the collection this map was derived from.
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

impl<K, V> Clone for MapCell<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for MapCell<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PartialEq for MapCell<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<K, V> std::fmt::Debug for MapCell<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug + 'static,
    V: Clone + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.inner.data.borrow().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<K: Clone + 'static, V: Clone + 'static>() -> (Rc<RefCell<Vec<MapChange<K, V>>>>, impl Fn(&MapChange<K, V>) + 'static) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |c: &MapChange<K, V>| sink.borrow_mut().push(c.clone()))
    }

    #[test]
    fn set_get_delete() {
        let map = MapCell::new();
        map.set("a", 1).unwrap();
        map.set("b", 2).unwrap();
        assert_eq!(map.get(&"a"), Some(1));
        assert!(map.has(&"b"));
        assert_eq!(map.keys(), vec!["a", "b"]);

        assert_eq!(map.delete(&"a").unwrap(), Some(1));
        assert_eq!(map.delete(&"a").unwrap(), None);
        assert_eq!(map.entries(), vec![("b", 2)]);
    }

    #[test]
    fn whole_and_key_channels_fire_together() {
        let map = MapCell::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            map.listen(move |c: &MapChange<&str, i32>| order.borrow_mut().push(format!("all:{}", c.key)));
        }
        {
            let order = order.clone();
            map.listen_on_key(&"x", move |_: &MapChange<&str, i32>| order.borrow_mut().push("x".to_string()));
        }

        map.set("x", 1).unwrap();
        map.set("y", 2).unwrap();
        assert_eq!(*order.borrow(), vec!["all:x", "x", "all:y"]);
    }

    #[test]
    fn set_reports_previous_value() {
        let map = MapCell::from_entries([("k", 1)]);
        let (log, callback) = record();
        map.listen(callback);

        map.set("k", 2).unwrap();
        assert_eq!(log.borrow()[0], MapChange::set("k", Some(1), 2));
    }

    #[test]
    fn clear_deletes_every_key() {
        let map = MapCell::from_entries([(1, 'a'), (2, 'b')]);
        let (log, callback) = record();
        map.listen(callback);

        map.clear().unwrap();
        assert!(map.is_empty());
        assert_eq!(log.borrow().len(), 2);
        assert!(log.borrow().iter().all(|c| c.deleted));
    }

    #[test]
    fn listen_and_repeat_replays_entries() {
        let map = MapCell::from_entries([("a", 1), ("b", 2)]);
        let (log, callback) = record();
        map.listen_and_repeat(callback).unwrap();
        assert_eq!(log.borrow().len(), 2);

        let (keyed, callback) = record();
        map.listen_on_key_and_repeat(&"b", callback).unwrap();
        assert_eq!(keyed.borrow()[0].new_value, Some(2));
    }

    #[test]
    fn pick_follows_one_key() {
        let map = MapCell::from_entries([("a", 1)]);
        let a = map.pick(&"a");
        let missing = map.pick(&"z");
        assert_eq!(a.value(), Some(1));
        assert!(!missing.is_primed());

        map.set("a", 5).unwrap();
        map.set("z", 9).unwrap();
        assert_eq!(a.value(), Some(5));
        assert_eq!(missing.value(), Some(9));

        map.delete(&"a").unwrap();
        assert_eq!(a.value(), Some(5));

        a.cancel_all();
        missing.cancel_all();
        assert!(!map.has_subscriptions());
    }

    #[test]
    fn merge_sets_given_entries() {
        let map = MapCell::from_entries([("keep", 0), ("over", 1)]);
        map.merge(IndexMap::from([("over", 2), ("new", 3)])).unwrap();
        assert_eq!(map.entries(), vec![("keep", 0), ("over", 2), ("new", 3)]);
    }

    #[test]
    fn changes_replay_on_another_map() {
        let source = MapCell::new();
        let mirror = MapCell::new();
        {
            let mirror = mirror.clone();
            source.listen(move |c: &MapChange<String, i32>| mirror.apply_map_change(c));
        }

        source.set("a".to_string(), 1).unwrap();
        source.set("b".to_string(), 2).unwrap();
        source.delete(&"a".to_string()).unwrap();
        assert_eq!(mirror.entries(), source.entries());

        let broken = MapChange {
            key: "x".to_string(),
            old_value: None,
            new_value: None,
            deleted: false,
        };
        assert!(matches!(mirror.apply_map_change(&broken), Err(CellError::InvalidChange(_))));
    }

    #[test]
    fn cancel_all_drops_key_listeners() {
        let map: MapCell<u8, u8> = MapCell::new();
        map.listen_on_key(&1, |_: &MapChange<u8, u8>| {});
        assert!(map.has_subscriptions());
        map.cancel_all();
        assert!(!map.has_subscriptions());
    }
}
