//! Value Cell Implementation
//!
//! A [`ValueCell`] is the fundamental reactive primitive. It holds the latest
//! value pushed into it and notifies listeners synchronously on every update.
//!
//! # How Value Cells Work
//!
//! 1. `update` stores the value and fires the update channel. Every listener,
//!    including cells derived through `transform` or `aggregate`, runs before
//!    `update` returns.
//!
//! 2. Updating a cell from inside one of its own notifications is rejected
//!    with [`CellError::ReentrantUpdate`]. The guard is an explicit
//!    [`UpdateState`] that returns to `Idle` even when a listener fails.
//!
//! 3. Computation errors travel on a separate error channel. They are first
//!    offered to the cell's error handler, which may turn them back into a
//!    value; otherwise error listeners receive them; otherwise the error is
//!    returned to whoever triggered the update.
//!
//! # Memory Layout
//!
//! Each cell consists of:
//! - A unique ID (8 bytes)
//! - The current value, `None` until the cell is primed
//! - Update and error channels, each a list of boxed callbacks

use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::trace;

use super::cancellation::CancellationToken;
use super::channel::{EventChannel, Listener};
use super::subscriber::{ListenerOutput, Subscription};
use crate::config::Diagnostics;
use crate::error::{CellError, CellResult};
use crate::pipeline::{Pipeline, PipelineSink};

/// Counter for generating unique cell IDs.
static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique cell ID.
pub(crate) fn next_cell_id() -> u64 {
    CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Re-entrancy state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// No update is in progress.
    Idle,

    /// Listeners of an update are currently running.
    Updating,
}

/// Marks a cell as updating and puts it back to idle when dropped.
pub(crate) struct UpdateGuard<'a> {
    state: &'a Cell<UpdateState>,
}

impl<'a> UpdateGuard<'a> {
    pub(crate) fn enter(state: &'a Cell<UpdateState>, name: impl FnOnce() -> String) -> CellResult<Self> {
        if state.get() == UpdateState::Updating {
            return Err(CellError::ReentrantUpdate(name()));
        }
        state.set(UpdateState::Updating);
        Ok(Self { state })
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.state.set(UpdateState::Idle);
    }
}

type ErrorHandler<T> = Rc<dyn Fn(CellError) -> CellResult<T>>;

struct CellInner<T: 'static> {
    id: u64,
    name: RefCell<Option<String>>,
    value: RefCell<Option<T>>,
    state: Cell<UpdateState>,
    updates: EventChannel<T>,
    errors: EventChannel<CellError>,
    error_handler: RefCell<Option<ErrorHandler<T>>>,
    sources: CancellationToken,
    diagnostics: Rc<Diagnostics>,
}

/// An observable holding a current value.
///
/// # Example
///
/// ```rust,ignore
/// let count = ValueCell::new(0);
/// count.listen(|v| println!("count is {v}"));
///
/// count.update(5)?; // prints "count is 5"
/// ```
pub struct ValueCell<T: Clone + 'static> {
    inner: Rc<CellInner<T>>,
}

impl<T: Clone + 'static> ValueCell<T> {
    /// Create a primed cell holding `value`.
    pub fn new(value: T) -> Self {
        Self::with_diagnostics(Some(value), Rc::new(Diagnostics::default()))
    }

    /// Create a cell that has not received a value yet.
    pub fn unprimed() -> Self {
        Self::with_diagnostics(None, Rc::new(Diagnostics::default()))
    }

    /// Create a cell reporting leaks against `diagnostics`.
    pub fn with_diagnostics(value: Option<T>, diagnostics: Rc<Diagnostics>) -> Self {
        Self {
            inner: Rc::new(CellInner {
                id: next_cell_id(),
                name: RefCell::new(None),
                value: RefCell::new(value),
                state: Cell::new(UpdateState::Idle),
                updates: EventChannel::with_diagnostics(diagnostics.clone()),
                errors: EventChannel::with_diagnostics(diagnostics.clone()),
                error_handler: RefCell::new(None),
                sources: CancellationToken::with_diagnostics(diagnostics.clone()),
                diagnostics,
            }),
        }
    }

    /// Name the cell; the name shows up in errors and logs.
    pub fn named(self, name: impl Into<String>) -> Self {
        *self.inner.name.borrow_mut() = Some(name.into());
        self
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The cell's name, or a generated one.
    pub fn name(&self) -> String {
        self.inner
            .name
            .borrow()
            .clone()
            .unwrap_or_else(|| format!("cell#{}", self.inner.id))
    }

    pub fn diagnostics(&self) -> Rc<Diagnostics> {
        self.inner.diagnostics.clone()
    }

    /// An empty cell sharing this cell's diagnostics.
    pub(crate) fn derived<U: Clone + 'static>(&self) -> ValueCell<U> {
        ValueCell::with_diagnostics(None, self.diagnostics())
    }

    /// Remove `subscription`, which feeds this cell, once this cell is
    /// cancelled.
    pub(crate) fn bind_source(&self, subscription: &Subscription) {
        // Only fails on a cancelled cell, and then removes the subscription.
        let _ = subscription.clone().until(&self.inner.sources);
    }

    /// Get the current value, `None` before the first update.
    pub fn value(&self) -> Option<T> {
        self.inner.value.borrow().clone()
    }

    /// Whether the cell holds a value.
    pub fn is_primed(&self) -> bool {
        self.inner.value.borrow().is_some()
    }

    /// Current re-entrancy state.
    pub fn state(&self) -> UpdateState {
        self.inner.state.get()
    }

    /// Store a new value and notify listeners.
    ///
    /// Fails with [`CellError::ReentrantUpdate`] when called from one of this
    /// cell's own listeners, or with the first listener error.
    pub fn update(&self, value: T) -> CellResult<()> {
        let _guard = UpdateGuard::enter(&self.inner.state, || self.name())?;

        *self.inner.value.borrow_mut() = Some(value.clone());
        trace!(cell = self.inner.id, "value cell updated");

        self.inner.updates.fire(&value)
    }

    /// Update using a function of the current value.
    pub fn update_with<F>(&self, f: F) -> CellResult<()>
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let next = {
            let current = self.inner.value.borrow();
            f(current.as_ref())
        };
        self.update(next)
    }

    /// Listen to future updates.
    pub fn listen<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.updates.subscribe(callback)
    }

    /// Replay the current value (when primed), then listen to future updates.
    pub fn listen_and_repeat<F, R>(&self, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        let listener: Listener<T> = Rc::new(move |v: &T| callback(v).into_result());
        if let Some(value) = self.value() {
            listener(&value)?;
        }
        Ok(self.inner.updates.attach(listener, false))
    }

    /// Listen to the next update only.
    pub fn listen_once<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.updates.subscribe_once(callback)
    }

    /// Resolve with the value of the next update.
    pub fn await_next_update(&self) -> impl Future<Output = CellResult<T>> {
        let (tx, rx) = oneshot::channel();
        let tx = Cell::new(Some(tx));
        self.listen_once(move |v: &T| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(v.clone());
            }
        });
        async move { rx.await.map_err(|_| CellError::Disconnected) }
    }

    /// Forward every update of this cell into `target`.
    pub fn pipe(&self, target: &ValueCell<T>) -> Subscription {
        let target = target.clone();
        self.listen(move |v: &T| target.update(v.clone()))
    }

    /// Derive a cell driven through an operator pipeline.
    ///
    /// The derived cell stays unprimed until the first value makes it through
    /// every operator. Cancelling the derived cell detaches it from this one.
    ///
    /// # Panics
    ///
    /// A value reaching an asynchronous step inside a tokio runtime panics
    /// unless it runs within a [`LocalSet`](tokio::task::LocalSet). Outside
    /// any runtime the step fails into the derived cell's error channel.
    pub fn transform<U, P>(&self, pipeline: P) -> ValueCell<U>
    where
        U: Clone + 'static,
        P: Into<Pipeline<T, U>>,
    {
        self.bind_transform(pipeline.into()).0
    }

    /// Like [`transform`](Self::transform), detaching when `token` cancels.
    pub fn transform_until<U, P>(&self, pipeline: P, token: &CancellationToken) -> CellResult<ValueCell<U>>
    where
        U: Clone + 'static,
        P: Into<Pipeline<T, U>>,
    {
        let (result, subscription) = self.bind_transform(pipeline.into());
        subscription.until(token)?;
        Ok(result)
    }

    fn bind_transform<U: Clone + 'static>(&self, pipeline: Pipeline<T, U>) -> (ValueCell<U>, Subscription) {
        let result: ValueCell<U> = self.derived();
        let run = pipeline.bind(Rc::new(result.clone()));
        let subscription = self.listen(move |v: &T| run(v.clone()));
        result.bind_source(&subscription);
        (result, subscription)
    }

    /// Merge this cell and `others` into a cell that takes whichever value
    /// was written last.
    pub fn combine(&self, others: &[&ValueCell<T>]) -> ValueCell<T> {
        let result = self.derived();
        for source in std::iter::once(self).chain(others.iter().copied()) {
            result.bind_source(&source.pipe(&result));
        }
        result
    }

    /// Install the recovery handler offered every error first.
    ///
    /// Returning `Ok(v)` turns the error into an update with `v`; returning
    /// an error passes it on to error listeners.
    pub fn handle_errors<F>(&self, handler: F)
    where
        F: Fn(CellError) -> CellResult<T> + 'static,
    {
        *self.inner.error_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Listen to errors that the handler did not recover from.
    pub fn on_error<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&CellError) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.errors.subscribe(callback)
    }

    /// Route an error through handler, error listeners, and finally back to
    /// the caller.
    pub fn emit_error(&self, error: CellError) -> CellResult<()> {
        if error.is_reentrancy() {
            return Err(error);
        }

        let handler = self.inner.error_handler.borrow().clone();
        let error = match handler {
            Some(handler) => match handler(error) {
                Ok(value) => return self.update(value),
                Err(error) => error,
            },
            None => error,
        };

        if self.inner.errors.has_subscriptions() {
            self.inner.errors.fire(&error)
        } else {
            Err(error)
        }
    }

    /// Whether anything listens to updates.
    pub fn has_subscriptions(&self) -> bool {
        self.inner.updates.has_subscriptions()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.updates.subscriber_count()
    }

    /// Drop every update and error listener, and detach from the cells this
    /// one was derived from.
    pub fn cancel_all(&self) {
        self.inner.updates.cancel_all();
        self.inner.errors.cancel_all();
        self.inner.sources.cancel();
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// A handle that does not keep the cell alive.
    pub fn downgrade(&self) -> WeakValueCell<T> {
        WeakValueCell {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Non-owning handle to a [`ValueCell`].
pub struct WeakValueCell<T: Clone + 'static> {
    inner: Weak<CellInner<T>>,
}

impl<T: Clone + 'static> WeakValueCell<T> {
    pub fn upgrade(&self) -> Option<ValueCell<T>> {
        self.inner.upgrade().map(|inner| ValueCell { inner })
    }
}

impl<T: Clone + 'static> Clone for WeakValueCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> PipelineSink<T> for ValueCell<T> {
    fn accept(&self, value: T) -> CellResult<()> {
        self.update(value)
    }

    fn reject(&self, error: CellError) -> CellResult<()> {
        self.emit_error(error)
    }
}

impl<T: Clone + 'static> Clone for ValueCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Cells compare by identity.
impl<T: Clone + 'static> PartialEq for ValueCell<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: Clone + 'static> Eq for ValueCell<T> {}

impl<T: Clone + 'static> Default for ValueCell<T> {
    fn default() -> Self {
        Self::unprimed()
    }
}

impl<T> Debug for ValueCell<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCell")
            .field("id", &self.inner.id)
            .field("value", &self.value())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
