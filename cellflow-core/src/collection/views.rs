//! Derived Collection Views
//!
//! A view is a [`CollectionCell`] kept in step with a parent collection.
//! Every parent change is translated into the smallest mutation of the view
//! that keeps it consistent, so listeners of the view see incremental
//! changes as well.
//!
//! # Translation
//!
//! | Parent change | map | filter | sort | reverse |
//! |---|---|---|---|---|
//! | add | same op, mapped | same op, passing items | sorted insert | opposite end |
//! | remove | same op | passing items | by equality | opposite end |
//! | replace | set slot | by predicate outcome | remove, sorted insert | rebuild |
//! | swap | swap | swap, or merge | nothing | rebuild |
//! | merge | rebuild, reusing values | merge | merge | rebuild |
//! | clear | clear | clear | clear | clear |
//!
//! A unique view compares its contents with the deduplicated parent and
//! applies the one insert, removal or replacement that closes the gap, or a
//! merge when the difference is not a single run.
//!
//! A sorted view merges when several items are added or removed at once,
//! and when an added or swapped item ties with a neighbour, since only the
//! parent order places ties.
//!
//! Predicates and comparators may read other cells. Views do not track such
//! reads; call [`refresh`](CollectionCell::refresh) or bind it with
//! [`refresh_on`](CollectionCell::refresh_on).

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;

use tracing::trace;

use super::array::CollectionCell;
use super::change::{ChangeDetail, CollectionChange};
use crate::error::CellResult;
use crate::reactive::{CancellableId, CancellationToken, ValueCell};

impl<T: Clone + 'static> CollectionCell<T> {
    /// A view holding the sequence back to front.
    pub fn reverse(&self) -> CollectionCell<T> {
        let view = self.derived(reversed(&self.data()));
        self.attach_view(&view, reverse_change);
        self.install_refresh(&view, |view, data| view.reset(reversed(data)));
        view
    }
}

impl<T: Clone + PartialEq + 'static> CollectionCell<T> {
    /// A view holding `f` of every item.
    ///
    /// On merges, items that survived keep their mapped value instead of
    /// running `f` again.
    pub fn map<U, F>(&self, f: F) -> CollectionCell<U>
    where
        U: Clone + 'static,
        F: Fn(&T) -> U + 'static,
    {
        let f = Rc::new(f);
        let view = self.derived(self.data().iter().map(|v| f(v)).collect());

        let project = f.clone();
        self.attach_view(&view, move |view, change| map_change(view, change, &*project));
        self.install_refresh(&view, move |view, data| view.reset(data.iter().map(|v| f(v)).collect()));
        view
    }

    /// A view holding the items for which `predicate` holds, in order.
    pub fn filter<F>(&self, predicate: F) -> CollectionCell<T>
    where
        F: Fn(&T) -> bool + 'static,
    {
        let predicate = Rc::new(predicate);
        let view = self.derived(passing(&self.data(), &*predicate));

        let test = predicate.clone();
        self.attach_view(&view, move |view, change| filter_change(view, change, &*test));
        self.install_refresh(&view, move |view, data| view.merge(passing(data, &*predicate)));
        view
    }

    /// A view holding the items ordered by `compare`. Equal items keep their
    /// parent order.
    pub fn sort<F>(&self, compare: F) -> CollectionCell<T>
    where
        F: Fn(&T, &T) -> Ordering + 'static,
    {
        let compare = Rc::new(compare);
        let view = self.derived(sorted(&self.data(), &*compare));

        let order = compare.clone();
        self.attach_view(&view, move |view, change| sort_change(view, change, &*order));
        self.install_refresh(&view, move |view, data| view.merge(sorted(data, &*compare)));
        view
    }

    /// A view holding each distinct item once, in the order it first
    /// appeared.
    pub fn unique(&self) -> CollectionCell<T> {
        let view = self.derived(deduped(&self.data()));
        self.attach_view(&view, unique_change);
        self.install_refresh(&view, |view, data| view.merge(deduped(data)));
        view
    }

    /// A view holding the items in `start..end`, clamped to the sequence.
    pub fn slice(&self, start: usize, end: usize) -> CollectionCell<T> {
        self.slice_view(Rc::new(Cell::new((start, end))))
    }

    /// Like [`slice`](Self::slice) with bounds read from cells. Unprimed
    /// bounds mean the start and the end of the sequence.
    pub fn slice_reactive(&self, start: &ValueCell<usize>, end: &ValueCell<usize>) -> CollectionCell<T> {
        let bounds = Rc::new(Cell::new((start.value().unwrap_or(0), end.value().unwrap_or(usize::MAX))));
        let view = self.slice_view(bounds.clone());

        let (range, target) = (bounds.clone(), view.downgrade());
        let starts = start.listen(move |s: &usize| {
            range.set((*s, range.get().1));
            match target.upgrade() {
                Some(view) => view.refresh(),
                None => Ok(()),
            }
        });

        let (range, target) = (bounds, view.downgrade());
        let ends = end.listen(move |e: &usize| {
            range.set((range.get().0, *e));
            match target.upgrade() {
                Some(view) => view.refresh(),
                None => Ok(()),
            }
        });

        // The view was created above, so its source token is still live.
        let _ = starts.until(view.sources());
        let _ = ends.until(view.sources());
        view
    }

    fn slice_view(&self, bounds: Rc<Cell<(usize, usize)>>) -> CollectionCell<T> {
        let view = self.derived(window(&self.data(), bounds.get()));

        let current = bounds.clone();
        self.attach_view(&view, move |view, change| view.merge(window(&change.new_state, current.get())));
        self.install_refresh(&view, move |view, data| view.merge(window(data, bounds.get())));
        view
    }
}

type Generation = RefCell<Option<(CancellationToken, CancellableId)>>;

impl<T: Clone + PartialEq + 'static> CollectionCell<CollectionCell<T>> {
    /// A view concatenating every inner collection.
    ///
    /// The view follows changes of the outer collection and of every inner
    /// collection it currently holds.
    pub fn flatten(&self) -> CollectionCell<T> {
        let outer = self.data();
        let view = self.derived(concat(&outer));
        let generation: Rc<Generation> = Rc::new(RefCell::new(None));
        track_inner(&view, &outer, &generation);

        self.attach_view(&view, move |view, change| {
            track_inner(view, &change.new_state, &generation);
            view.merge(concat(&change.new_state))
        });
        self.install_refresh(&view, |view, outer| view.merge(concat(outer)));
        view
    }
}

/// Resubscribe to the current inner collections, dropping the previous
/// generation of inner subscriptions.
fn track_inner<T: Clone + PartialEq + 'static>(
    view: &CollectionCell<T>,
    inners: &[CollectionCell<T>],
    generation: &Generation,
) {
    if let Some((token, link)) = generation.borrow_mut().take() {
        view.sources().remove_cancellable(link);
        token.cancel();
    }

    let token = CancellationToken::with_diagnostics(view.diagnostics());
    let Ok(link) = view.sources().add_token(&token) else {
        // The view has been cancelled.
        return;
    };

    for inner in inners {
        let target = view.downgrade();
        let _ = inner
            .listen(move |_: &CollectionChange<T>| match target.upgrade() {
                Some(view) => view.refresh(),
                None => Ok(()),
            })
            .until(&token);
    }

    trace!(view = view.id(), inners = inners.len(), "flattened view rewired");
    *generation.borrow_mut() = Some((token, link));
}

fn map_change<T, U>(view: &CollectionCell<U>, change: &CollectionChange<T>, f: &dyn Fn(&T) -> U) -> CellResult<()>
where
    T: Clone + PartialEq + 'static,
    U: Clone + 'static,
{
    let mapped = || change.items.iter().map(f).collect::<Vec<U>>();
    match change.operation_detailed {
        ChangeDetail::Append => view.push(mapped()),
        ChangeDetail::Prepend => view.unshift(mapped()),
        ChangeDetail::Insert => view.insert_at(change.index, mapped()),
        ChangeDetail::RemoveLeft => view.remove_left(change.len()).map(drop),
        ChangeDetail::RemoveRight => view.remove_right(change.len()).map(drop),
        ChangeDetail::Remove => view.remove_range(change.index, change.index + change.len()).map(drop),
        ChangeDetail::Clear => view.clear(),
        ChangeDetail::Replace => match change.items.first() {
            Some(item) => view.set(change.index, f(item)).map(drop),
            None => view.reset(change.new_state.iter().map(f).collect()),
        },
        ChangeDetail::Swap => match change.index2 {
            Some(other) => view.swap(change.index, other),
            None => view.reset(change.new_state.iter().map(f).collect()),
        },
        ChangeDetail::Merge => {
            let previous = change.previous_state.as_deref().map(Vec::as_slice).unwrap_or(&[]);
            view.reset(remap(previous, &view.data(), &change.new_state, f))
        }
    }
}

/// Map `next`, reusing the value mapped for an equal item of `previous`.
/// Each previous value is reused at most once.
fn remap<T: PartialEq, U: Clone>(previous: &[T], mapped: &[U], next: &[T], f: &dyn Fn(&T) -> U) -> Vec<U> {
    let mut used = vec![false; previous.len()];
    next.iter()
        .map(|item| {
            let reusable = previous
                .iter()
                .zip(mapped)
                .enumerate()
                .find(|(j, (old, _))| !used[*j] && *old == item)
                .map(|(j, (_, value))| (j, value.clone()));
            match reusable {
                Some((j, value)) => {
                    used[j] = true;
                    value
                }
                None => f(item),
            }
        })
        .collect()
}

fn filter_change<T>(view: &CollectionCell<T>, change: &CollectionChange<T>, predicate: &dyn Fn(&T) -> bool) -> CellResult<()>
where
    T: Clone + PartialEq + 'static,
{
    let state = change.new_state.as_slice();
    // Position in the view of the parent slot `end`.
    let before = |end: usize| state[..end.min(state.len())].iter().filter(|v| predicate(v)).count().min(view.len());
    let resync = || view.merge(passing(state, predicate));

    match change.operation_detailed {
        ChangeDetail::Append => view.push(passing(&change.items, predicate)),
        ChangeDetail::Prepend => view.unshift(passing(&change.items, predicate)),
        ChangeDetail::Insert => view.insert_at(before(change.index), passing(&change.items, predicate)),
        detail @ (ChangeDetail::RemoveLeft | ChangeDetail::RemoveRight | ChangeDetail::Remove) => {
            let removed = change.items.iter().filter(|v| predicate(v)).count();
            if removed == 0 {
                return Ok(());
            }
            match detail {
                ChangeDetail::RemoveLeft => view.remove_left(removed).map(drop),
                ChangeDetail::RemoveRight => view.remove_right(removed).map(drop),
                _ => {
                    let start = before(change.index);
                    view.remove_range(start, (start + removed).min(view.len())).map(drop)
                }
            }
        }
        ChangeDetail::Clear => view.clear(),
        ChangeDetail::Replace => {
            let (Some(new), Some(old)) = (change.items.first(), change.target.as_ref()) else {
                return resync();
            };
            let at = before(change.index);
            match (predicate(old), predicate(new)) {
                (true, true) => view.set(at, new.clone()).map(drop),
                (true, false) => view.remove_at(at).map(drop),
                (false, true) => view.insert_at(at, [new.clone()]),
                (false, false) => Ok(()),
            }
        }
        ChangeDetail::Swap => {
            let Some(other) = change.index2 else {
                return resync();
            };
            match (state.get(change.index), state.get(other)) {
                (Some(a), Some(b)) => match (predicate(a), predicate(b)) {
                    (true, true) => view.swap(before(change.index), before(other)),
                    (false, false) => Ok(()),
                    _ => resync(),
                },
                _ => resync(),
            }
        }
        ChangeDetail::Merge => resync(),
    }
}

fn sort_change<T>(view: &CollectionCell<T>, change: &CollectionChange<T>, compare: &dyn Fn(&T, &T) -> Ordering) -> CellResult<()>
where
    T: Clone + PartialEq + 'static,
{
    let resync = || view.merge(sorted(&change.new_state, compare));
    // Ties take their place from the parent order, which only a full sort knows.
    let insert = |item: &T| {
        let data = view.data();
        let at = data.partition_point(|existing| compare(existing, item) == Ordering::Less);
        match data.get(at) {
            Some(next) if compare(next, item) == Ordering::Equal => resync(),
            _ => view.insert_at(at, [item.clone()]),
        }
    };
    let remove = |item: &T| match view.index_of(item) {
        Some(at) => view.remove_at(at).map(drop),
        None => Ok(()),
    };

    match change.operation_detailed {
        ChangeDetail::Append | ChangeDetail::Prepend | ChangeDetail::Insert => match change.items.as_slice() {
            [item] => insert(item),
            _ => resync(),
        },
        ChangeDetail::RemoveLeft | ChangeDetail::RemoveRight | ChangeDetail::Remove => match change.items.as_slice() {
            [item] => remove(item),
            _ => resync(),
        },
        ChangeDetail::Clear => view.clear(),
        ChangeDetail::Replace => {
            if let Some(old) = &change.target {
                remove(old)?;
            }
            match change.items.first() {
                Some(new) => insert(new),
                None => resync(),
            }
        }
        ChangeDetail::Swap => {
            let state = change.new_state.as_slice();
            let tied = |item: &T| state.iter().filter(|v| compare(v, item) == Ordering::Equal).count() > 1;
            match change.index2.and_then(|other| Some((state.get(change.index)?, state.get(other)?))) {
                Some((a, b)) if !tied(a) && !tied(b) => Ok(()),
                _ => resync(),
            }
        }
        ChangeDetail::Merge => resync(),
    }
}

fn reverse_change<T: Clone + 'static>(view: &CollectionCell<T>, change: &CollectionChange<T>) -> CellResult<()> {
    let len = change.new_state.len();
    let count = change.len();
    let backwards = || change.items.iter().rev().cloned().collect::<Vec<T>>();

    match change.operation_detailed {
        ChangeDetail::Append => view.unshift(backwards()),
        ChangeDetail::Prepend => view.push(backwards()),
        ChangeDetail::Insert => view.insert_at(len.saturating_sub(change.index + count), backwards()),
        ChangeDetail::RemoveLeft => view.remove_right(count).map(drop),
        ChangeDetail::RemoveRight => view.remove_left(count).map(drop),
        ChangeDetail::Remove => {
            let start = len.saturating_sub(change.index);
            view.remove_range(start, start + count).map(drop)
        }
        ChangeDetail::Clear => view.clear(),
        ChangeDetail::Replace | ChangeDetail::Swap | ChangeDetail::Merge => view.reset(reversed(&change.new_state)),
    }
}

fn unique_change<T: Clone + PartialEq + 'static>(view: &CollectionCell<T>, change: &CollectionChange<T>) -> CellResult<()> {
    match change.operation_detailed {
        ChangeDetail::Clear => view.clear(),
        _ => converge(view, deduped(&change.new_state)),
    }
}

/// Bring `view` to `target` with a single insert, removal or replacement
/// when the two differ by one contiguous run, and a merge otherwise.
fn converge<T: Clone + PartialEq + 'static>(view: &CollectionCell<T>, target: Vec<T>) -> CellResult<()> {
    let current = view.data();
    if *current == target {
        return Ok(());
    }

    let head = current.iter().zip(&target).take_while(|(a, b)| a == b).count();
    let tail = current[head..]
        .iter()
        .rev()
        .zip(target[head..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    match (current.len() - head - tail, target.len() - head - tail) {
        (0, added) if head == current.len() => view.push(target[head..head + added].to_vec()),
        (0, added) => view.insert_at(head, target[head..head + added].to_vec()),
        (removed, 0) => view.remove_range(head, head + removed).map(drop),
        (1, 1) => view.set(head, target[head].clone()).map(drop),
        _ => view.merge(target),
    }
}

fn passing<T: Clone>(items: &[T], predicate: &dyn Fn(&T) -> bool) -> Vec<T> {
    items.iter().filter(|v| predicate(v)).cloned().collect()
}

fn sorted<T: Clone>(items: &[T], compare: &dyn Fn(&T, &T) -> Ordering) -> Vec<T> {
    let mut items = items.to_vec();
    items.sort_by(|a, b| compare(a, b));
    items
}

fn reversed<T: Clone>(items: &[T]) -> Vec<T> {
    items.iter().rev().cloned().collect()
}

fn deduped<T: Clone + PartialEq>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn window<T: Clone>(items: &[T], (start, end): (usize, usize)) -> Vec<T> {
    let end = end.min(items.len());
    let start = start.min(end);
    items[start..end].to_vec()
}

fn concat<T: Clone + 'static>(inners: &[CollectionCell<T>]) -> Vec<T> {
    inners.iter().flat_map(|inner| inner.data().as_ref().clone()).collect()
}
