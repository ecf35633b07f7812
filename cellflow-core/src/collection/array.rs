//! Collection Cell Implementation
//!
//! A [`CollectionCell`] is an observable ordered sequence. Instead of
//! re-publishing the whole sequence on every change it fires a
//! [`CollectionChange`] describing the mutation, which lets derived views
//! update themselves incrementally.
//!
//! # Mutation Protocol
//!
//! Every mutator follows the same steps:
//!
//! 1. Validate arguments. Out-of-range indices fail before anything changes.
//! 2. Compute the new backing sequence.
//! 3. Fire exactly one change whose `new_state` shares storage with the
//!    backing sequence at that instant.
//! 4. Update the length cell if the length changed.
//!
//! Storage is an `Rc<Vec<T>>`. Listeners may keep `new_state` around; the
//! next mutation then copies the sequence instead of changing it under them.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use super::change::{ChangeDetail, ChangeDraft, CollectionChange};
use super::merge::reconcile;
use crate::config::Diagnostics;
use crate::error::{CellError, CellResult};
use crate::reactive::{
    next_cell_id, CancellationToken, EventChannel, Listener, ListenerOutput, Subscription, UpdateGuard, UpdateState,
    ValueCell,
};

type Refresher = Rc<dyn Fn() -> CellResult<()>>;

struct CollectionInner<T: 'static> {
    id: u64,
    name: RefCell<Option<String>>,
    data: RefCell<Rc<Vec<T>>>,
    state: Cell<UpdateState>,
    updates: EventChannel<CollectionChange<T>>,
    length: ValueCell<usize>,
    /// Links to whatever this collection is derived from.
    sources: CancellationToken,
    refresher: RefCell<Option<Refresher>>,
    diagnostics: Rc<Diagnostics>,
}

/// An observable ordered sequence.
///
/// # Example
///
/// ```rust,ignore
/// let list = CollectionCell::new([3, 1, 2]);
/// let sorted = list.sort(|a, b| a.cmp(b));
///
/// list.push([0])?;
/// assert_eq!(*sorted.data(), vec![0, 1, 2, 3]);
/// ```
pub struct CollectionCell<T: Clone + 'static> {
    inner: Rc<CollectionInner<T>>,
}

impl<T: Clone + 'static> CollectionCell<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self::with_diagnostics(items.into_iter().collect(), Rc::new(Diagnostics::default()))
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_diagnostics(items: Vec<T>, diagnostics: Rc<Diagnostics>) -> Self {
        let len = items.len();
        Self {
            inner: Rc::new(CollectionInner {
                id: next_cell_id(),
                name: RefCell::new(None),
                data: RefCell::new(Rc::new(items)),
                state: Cell::new(UpdateState::Idle),
                updates: EventChannel::with_diagnostics(diagnostics.clone()),
                length: ValueCell::with_diagnostics(Some(len), diagnostics.clone()),
                sources: CancellationToken::with_diagnostics(diagnostics.clone()),
                refresher: RefCell::new(None),
                diagnostics,
            }),
        }
    }

    /// Name the collection; the name shows up in errors and logs.
    pub fn named(self, name: impl Into<String>) -> Self {
        *self.inner.name.borrow_mut() = Some(name.into());
        self
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .borrow()
            .clone()
            .unwrap_or_else(|| format!("collection#{}", self.inner.id))
    }

    pub fn diagnostics(&self) -> Rc<Diagnostics> {
        self.inner.diagnostics.clone()
    }

    /// The current sequence, shared with the cell.
    pub fn data(&self) -> Rc<Vec<T>> {
        self.inner.data.borrow().clone()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.inner.data.borrow().as_ref().clone()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.inner.data.borrow().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.borrow().is_empty()
    }

    /// A value cell holding the current length.
    pub fn length(&self) -> ValueCell<usize> {
        self.inner.length.clone()
    }

    fn out_of_bounds(&self, index: usize) -> CellError {
        CellError::IndexOutOfBounds { index, len: self.len() }
    }

    fn commit(&self, draft: ChangeDraft<T>, mutate: impl FnOnce(&mut Rc<Vec<T>>)) -> CellResult<()> {
        let _guard = UpdateGuard::enter(&self.inner.state, || self.name())?;

        let (old_len, new_state) = {
            let mut data = self.inner.data.borrow_mut();
            let old_len = data.len();
            mutate(&mut data);
            (old_len, Rc::clone(&data))
        };

        let change = draft.finish(new_state);
        trace!(
            collection = self.inner.id,
            operation = ?change.operation_detailed,
            len = change.new_state.len(),
            "collection changed"
        );

        let fired = self.inner.updates.fire(&change);
        let len = change.new_state.len();
        let resized = if len != old_len {
            self.inner.length.update(len)
        } else {
            Ok(())
        };
        fired.and(resized)
    }

    /// Append items at the end.
    pub fn push(&self, items: impl IntoIterator<Item = T>) -> CellResult<()> {
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }
        let draft = ChangeDraft::new(ChangeDetail::Append, self.len(), items.clone()).counted(items.len());
        self.commit(draft, |data| Rc::make_mut(data).extend(items))
    }

    /// Insert items at the front.
    pub fn unshift(&self, items: impl IntoIterator<Item = T>) -> CellResult<()> {
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }
        let draft = ChangeDraft::new(ChangeDetail::Prepend, 0, items.clone()).counted(items.len());
        self.commit(draft, |data| {
            Rc::make_mut(data).splice(0..0, items);
        })
    }

    /// Insert items before `index`; `index == len()` appends.
    pub fn insert_at(&self, index: usize, items: impl IntoIterator<Item = T>) -> CellResult<()> {
        if index > self.len() {
            return Err(self.out_of_bounds(index));
        }
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }
        let draft = ChangeDraft::new(ChangeDetail::Insert, index, items.clone()).counted(items.len());
        self.commit(draft, |data| {
            Rc::make_mut(data).splice(index..index, items);
        })
    }

    /// Remove and return the item at `index`.
    pub fn remove_at(&self, index: usize) -> CellResult<T> {
        let Some(removed) = self.get(index) else {
            return Err(self.out_of_bounds(index));
        };
        let draft = ChangeDraft::new(ChangeDetail::Remove, index, vec![removed.clone()]).counted(1);
        self.commit(draft, |data| {
            Rc::make_mut(data).remove(index);
        })?;
        Ok(removed)
    }

    /// Remove the items in `start..end`.
    pub fn remove_range(&self, start: usize, end: usize) -> CellResult<Vec<T>> {
        let len = self.len();
        if end > len {
            return Err(self.out_of_bounds(end));
        }
        if start > end {
            return Err(self.out_of_bounds(start));
        }
        if start == end {
            return Ok(Vec::new());
        }

        let removed = self.inner.data.borrow()[start..end].to_vec();
        let draft = ChangeDraft::new(ChangeDetail::Remove, start, removed.clone()).counted(end - start);
        self.commit(draft, |data| {
            Rc::make_mut(data).drain(start..end);
        })?;
        Ok(removed)
    }

    /// Remove up to `count` items from the front.
    pub fn remove_left(&self, count: usize) -> CellResult<Vec<T>> {
        let count = count.min(self.len());
        if count == 0 {
            return Ok(Vec::new());
        }

        let removed = self.inner.data.borrow()[..count].to_vec();
        let draft = ChangeDraft::new(ChangeDetail::RemoveLeft, 0, removed.clone()).counted(count);
        self.commit(draft, |data| {
            Rc::make_mut(data).drain(..count);
        })?;
        Ok(removed)
    }

    /// Remove up to `count` items from the end.
    pub fn remove_right(&self, count: usize) -> CellResult<Vec<T>> {
        let len = self.len();
        let count = count.min(len);
        if count == 0 {
            return Ok(Vec::new());
        }

        let keep = len - count;
        let removed = self.inner.data.borrow()[keep..].to_vec();
        let draft = ChangeDraft::new(ChangeDetail::RemoveRight, keep, removed.clone()).counted(count);
        self.commit(draft, |data| Rc::make_mut(data).truncate(keep))?;
        Ok(removed)
    }

    /// Remove and return the last item.
    pub fn pop(&self) -> CellResult<Option<T>> {
        Ok(self.remove_right(1)?.pop())
    }

    /// Remove and return the first item.
    pub fn shift(&self) -> CellResult<Option<T>> {
        Ok(self.remove_left(1)?.into_iter().next())
    }

    /// Exchange the items at `a` and `b`.
    pub fn swap(&self, a: usize, b: usize) -> CellResult<()> {
        let (first, second) = {
            let data = self.inner.data.borrow();
            match (data.get(a), data.get(b)) {
                (Some(first), Some(second)) => (first.clone(), second.clone()),
                (None, _) => return Err(CellError::IndexOutOfBounds { index: a, len: data.len() }),
                (_, None) => return Err(CellError::IndexOutOfBounds { index: b, len: data.len() }),
            }
        };

        let mut draft = ChangeDraft::new(ChangeDetail::Swap, a, vec![second, first]);
        draft.index2 = Some(b);
        self.commit(draft, |data| Rc::make_mut(data).swap(a, b))
    }

    /// Replace the item at `index`, returning the old one.
    pub fn set(&self, index: usize, item: T) -> CellResult<T> {
        let Some(old) = self.get(index) else {
            return Err(self.out_of_bounds(index));
        };

        let mut draft = ChangeDraft::new(ChangeDetail::Replace, index, vec![item.clone()]);
        draft.target = Some(old.clone());
        self.commit(draft, |data| Rc::make_mut(data)[index] = item)?;
        Ok(old)
    }

    /// Remove every item.
    pub fn clear(&self) -> CellResult<()> {
        let previous = self.data();
        let mut draft = ChangeDraft::new(ChangeDetail::Clear, 0, previous.as_ref().clone()).counted(previous.len());
        draft.previous_state = Some(previous);
        self.commit(draft, |data| *data = Rc::new(Vec::new()))
    }

    /// Reconcile the sequence into `items`, treating elements for which
    /// `same` holds as one element.
    pub fn merge_by<F>(&self, items: impl IntoIterator<Item = T>, same: F) -> CellResult<()>
    where
        F: Fn(&T, &T) -> bool,
    {
        let target: Vec<T> = items.into_iter().collect();
        let previous = self.data();

        let mut next = previous.as_ref().clone();
        reconcile(&mut next, &target, same);

        let mut draft = ChangeDraft::new(ChangeDetail::Merge, 0, target);
        draft.previous_state = Some(previous);
        self.commit(draft, |data| *data = Rc::new(next))
    }

    /// Replace the whole sequence, reported as a merge.
    pub(crate) fn reset(&self, items: Vec<T>) -> CellResult<()> {
        let mut draft = ChangeDraft::new(ChangeDetail::Merge, 0, items.clone());
        draft.previous_state = Some(self.data());
        self.commit(draft, |data| *data = Rc::new(items))
    }

    /// Replay a change recorded on another collection.
    ///
    /// Merges are replayed by adopting the recorded `new_state`.
    pub fn apply_collection_change(&self, change: &CollectionChange<T>) -> CellResult<()> {
        let items = change.items.iter().cloned();
        match change.operation_detailed {
            ChangeDetail::Append => self.push(items),
            ChangeDetail::Prepend => self.unshift(items),
            ChangeDetail::Insert => self.insert_at(change.index, items),
            ChangeDetail::RemoveLeft => self.remove_left(change.len()).map(drop),
            ChangeDetail::RemoveRight => self.remove_right(change.len()).map(drop),
            ChangeDetail::Remove => self.remove_range(change.index, change.index + change.len()).map(drop),
            ChangeDetail::Clear => self.clear(),
            ChangeDetail::Swap => {
                let other = change
                    .index2
                    .ok_or_else(|| CellError::InvalidChange("swap without a second index".into()))?;
                self.swap(change.index, other)
            }
            ChangeDetail::Replace => {
                let item = change
                    .items
                    .first()
                    .cloned()
                    .ok_or_else(|| CellError::InvalidChange("replace without an item".into()))?;
                self.set(change.index, item).map(drop)
            }
            ChangeDetail::Merge => self.reset(change.new_state.as_ref().clone()),
        }
    }

    pub fn listen<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&CollectionChange<T>) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.updates.subscribe(callback)
    }

    pub fn listen_once<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&CollectionChange<T>) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.updates.subscribe_once(callback)
    }

    /// Replay the whole sequence as an append at index 0, then listen.
    pub fn listen_and_repeat<F, R>(&self, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&CollectionChange<T>) -> R + 'static,
        R: ListenerOutput,
    {
        let listener: Listener<CollectionChange<T>> =
            Rc::new(move |change: &CollectionChange<T>| callback(change).into_result());

        let data = self.data();
        let replay = ChangeDraft::new(ChangeDetail::Append, 0, data.as_ref().clone())
            .counted(data.len())
            .finish(data);
        listener(&replay)?;

        Ok(self.inner.updates.attach(listener, false))
    }

    /// A value cell holding the whole sequence, updated after every change
    /// until it is cancelled.
    pub fn to_value_cell(&self) -> ValueCell<Rc<Vec<T>>> {
        let cell = ValueCell::with_diagnostics(Some(self.data()), self.diagnostics());
        let target = cell.clone();
        cell.bind_source(&self.listen(move |change: &CollectionChange<T>| target.update(change.new_state.clone())));
        cell
    }

    /// Recompute a derived view from its source. Does nothing on
    /// collections that are not views.
    pub fn refresh(&self) -> CellResult<()> {
        let refresher = self.inner.refresher.borrow().clone();
        match refresher {
            Some(refresh) => {
                debug!(collection = self.inner.id, "refreshing view");
                refresh()
            }
            None => Ok(()),
        }
    }

    /// Refresh this view whenever `trigger` updates.
    ///
    /// Fails once the view has been detached with [`cancel_all`](Self::cancel_all).
    pub fn refresh_on<X: Clone + 'static>(&self, trigger: &ValueCell<X>) -> CellResult<Subscription> {
        let view = self.downgrade();
        trigger
            .listen(move |_: &X| match view.upgrade() {
                Some(view) => view.refresh(),
                None => Ok(()),
            })
            .until(&self.inner.sources)
    }

    /// Keep `view` in sync with this collection through `translate`.
    pub(crate) fn attach_view<U, F>(&self, view: &CollectionCell<U>, translate: F)
    where
        U: Clone + 'static,
        F: Fn(&CollectionCell<U>, &CollectionChange<T>) -> CellResult<()> + 'static,
    {
        let target = view.clone();
        let subscription = self.listen(move |change: &CollectionChange<T>| translate(&target, change));
        // A view's source token is live until the view is cancelled.
        let _ = subscription.until(&view.inner.sources);
        debug!(source = self.inner.id, view = view.inner.id, "collection view attached");
    }

    /// Install how `view` is recomputed from this collection's data.
    pub(crate) fn install_refresh<U, F>(&self, view: &CollectionCell<U>, recompute: F)
    where
        U: Clone + 'static,
        F: Fn(&CollectionCell<U>, &[T]) -> CellResult<()> + 'static,
    {
        let source = self.downgrade();
        let target = view.downgrade();
        *view.inner.refresher.borrow_mut() = Some(Rc::new(move || match (source.upgrade(), target.upgrade()) {
            (Some(source), Some(view)) => recompute(&view, &source.data()),
            _ => Ok(()),
        }));
    }

    /// An empty cell sharing this cell's diagnostics.
    pub(crate) fn derived<U: Clone + 'static>(&self, items: Vec<U>) -> CollectionCell<U> {
        CollectionCell::with_diagnostics(items, self.diagnostics())
    }

    pub(crate) fn sources(&self) -> &CancellationToken {
        &self.inner.sources
    }

    pub fn has_subscriptions(&self) -> bool {
        self.inner.updates.has_subscriptions()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.updates.subscriber_count()
    }

    /// Drop every listener and, for views, detach from the source.
    pub fn cancel_all(&self) {
        self.inner.updates.cancel_all();
        self.inner.length.cancel_all();
        self.inner.sources.cancel();
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakCollectionCell<T> {
        WeakCollectionCell {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + 'static> CollectionCell<T> {
    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.inner.data.borrow().iter().position(|v| v == item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.index_of(item).is_some()
    }

    /// Remove the first item equal to `item`. Returns whether one was found.
    pub fn remove(&self, item: &T) -> CellResult<bool> {
        match self.index_of(item) {
            Some(index) => self.remove_at(index).map(|_| true),
            None => Ok(false),
        }
    }

    /// Replace the first item equal to `old`. Returns whether one was found.
    pub fn replace(&self, old: &T, item: T) -> CellResult<bool> {
        match self.index_of(old) {
            Some(index) => self.set(index, item).map(|_| true),
            None => Ok(false),
        }
    }

    /// Exchange the first items equal to `a` and `b`. Returns whether both
    /// were found.
    pub fn swap_items(&self, a: &T, b: &T) -> CellResult<bool> {
        match (self.index_of(a), self.index_of(b)) {
            (Some(i), Some(j)) => self.swap(i, j).map(|_| true),
            _ => Ok(false),
        }
    }

    /// Reconcile the sequence into `items` by equality.
    pub fn merge(&self, items: impl IntoIterator<Item = T>) -> CellResult<()> {
        self.merge_by(items, |a, b| a == b)
    }
}

/// Non-owning handle to a [`CollectionCell`].
pub struct WeakCollectionCell<T: Clone + 'static> {
    inner: Weak<CollectionInner<T>>,
}

impl<T: Clone + 'static> WeakCollectionCell<T> {
    pub fn upgrade(&self) -> Option<CollectionCell<T>> {
        self.inner.upgrade().map(|inner| CollectionCell { inner })
    }
}

impl<T: Clone + 'static> Clone for WeakCollectionCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Clone for CollectionCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Collections compare by identity, so nested collections merge by cell.
impl<T: Clone + 'static> PartialEq for CollectionCell<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: Clone + 'static> Eq for CollectionCell<T> {}

impl<T: Clone + 'static> Default for CollectionCell<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Clone + std::fmt::Debug + 'static> std::fmt::Debug for CollectionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionCell")
            .field("id", &self.inner.id)
            .field("data", &self.inner.data.borrow())
            .finish()
    }
}
