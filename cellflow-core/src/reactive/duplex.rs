//! Duplex Cells
//!
//! A [`DuplexCell`] carries data in two directions. Writes coming from the
//! data source travel *downstream* towards consumers; writes made by
//! consumers travel *upstream* back towards the source. Both directions share
//! one stored value but have their own channel and their own re-entrancy
//! guard, so a write in one direction may trigger a write in the other.
//!
//! A root cell (`propagate_writes_to_read_stream`) echoes upstream writes to
//! its downstream listeners, which is how an edit made through one derived
//! cell reaches every sibling. Cells derived with
//! [`transform_duplex`](DuplexCell::transform_duplex) do not echo; they
//! forward upstream writes to their parent instead.
//!
//! ```rust,ignore
//! let cents = DuplexCell::root(150);
//! let euros = cents.transform_duplex(duplex_map(|c| c / 100, |e| e * 100));
//! euros.update_upstream(3)?; // cents now holds 300
//! ```

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace};

use super::cancellation::CancellationToken;
use super::cell::{next_cell_id, UpdateGuard, UpdateState, ValueCell};
use super::channel::{EventChannel, Listener};
use super::subscriber::{ListenerOutput, Subscription};
use crate::config::Diagnostics;
use crate::error::{CellError, CellResult};
use crate::pipeline::{filter, map, Operator, Pipeline, PipelineSink};

/// Direction of travel through a duplex cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the data source towards consumers.
    Downstream,
    /// From consumers back towards the data source.
    Upstream,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::Downstream => Self::Upstream,
            Self::Upstream => Self::Downstream,
        }
    }
}

struct DuplexInner<T: 'static> {
    id: u64,
    value: RefCell<Option<T>>,
    propagate_writes_to_read_stream: bool,
    downstream_state: Cell<UpdateState>,
    upstream_state: Cell<UpdateState>,
    downstream: EventChannel<T>,
    upstream: EventChannel<T>,
    sources: CancellationToken,
    diagnostics: Rc<Diagnostics>,
}

/// A cell with independent downstream and upstream flows.
pub struct DuplexCell<T: Clone + 'static> {
    inner: Rc<DuplexInner<T>>,
}

impl<T: Clone + 'static> DuplexCell<T> {
    /// Create a primed cell.
    pub fn new(value: T, propagate_writes_to_read_stream: bool) -> Self {
        Self::with_diagnostics(Some(value), propagate_writes_to_read_stream, Rc::new(Diagnostics::default()))
    }

    /// Create a primed root cell that echoes upstream writes downstream.
    pub fn root(value: T) -> Self {
        Self::new(value, true)
    }

    pub fn unprimed(propagate_writes_to_read_stream: bool) -> Self {
        Self::with_diagnostics(None, propagate_writes_to_read_stream, Rc::new(Diagnostics::default()))
    }

    pub fn with_diagnostics(
        value: Option<T>,
        propagate_writes_to_read_stream: bool,
        diagnostics: Rc<Diagnostics>,
    ) -> Self {
        Self {
            inner: Rc::new(DuplexInner {
                id: next_cell_id(),
                value: RefCell::new(value),
                propagate_writes_to_read_stream,
                downstream_state: Cell::new(UpdateState::Idle),
                upstream_state: Cell::new(UpdateState::Idle),
                downstream: EventChannel::with_diagnostics(diagnostics.clone()),
                upstream: EventChannel::with_diagnostics(diagnostics.clone()),
                sources: CancellationToken::with_diagnostics(diagnostics.clone()),
                diagnostics,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn value(&self) -> Option<T> {
        self.inner.value.borrow().clone()
    }

    pub fn is_primed(&self) -> bool {
        self.inner.value.borrow().is_some()
    }

    pub fn propagates_writes_to_read_stream(&self) -> bool {
        self.inner.propagate_writes_to_read_stream
    }

    fn guard_name(&self, direction: Direction) -> String {
        format!("duplex#{} ({direction:?})", self.inner.id)
    }

    /// Store a value coming from the data source and notify downstream
    /// listeners.
    pub fn update_downstream(&self, value: T) -> CellResult<()> {
        let _guard = UpdateGuard::enter(&self.inner.downstream_state, || self.guard_name(Direction::Downstream))?;
        *self.inner.value.borrow_mut() = Some(value.clone());
        trace!(cell = self.inner.id, "duplex downstream update");
        self.inner.downstream.fire(&value)
    }

    /// Store a value written by a consumer and notify upstream listeners.
    ///
    /// Root cells also notify their downstream listeners.
    pub fn update_upstream(&self, value: T) -> CellResult<()> {
        let _guard = UpdateGuard::enter(&self.inner.upstream_state, || self.guard_name(Direction::Upstream))?;
        *self.inner.value.borrow_mut() = Some(value.clone());
        trace!(cell = self.inner.id, "duplex upstream update");

        let upstream = self.inner.upstream.fire(&value);
        if !self.inner.propagate_writes_to_read_stream {
            return upstream;
        }

        let _echo = UpdateGuard::enter(&self.inner.downstream_state, || self.guard_name(Direction::Downstream))?;
        let downstream = self.inner.downstream.fire(&value);
        upstream.and(downstream)
    }

    /// Write in the given direction.
    pub fn update(&self, direction: Direction, value: T) -> CellResult<()> {
        match direction {
            Direction::Downstream => self.update_downstream(value),
            Direction::Upstream => self.update_upstream(value),
        }
    }

    fn channel(&self, direction: Direction) -> &EventChannel<T> {
        match direction {
            Direction::Downstream => &self.inner.downstream,
            Direction::Upstream => &self.inner.upstream,
        }
    }

    pub fn listen_downstream<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.downstream.subscribe(callback)
    }

    pub fn listen_upstream<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.upstream.subscribe(callback)
    }

    pub fn listen_downstream_once<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.downstream.subscribe_once(callback)
    }

    pub fn listen_upstream_once<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.inner.upstream.subscribe_once(callback)
    }

    /// Replay the current value (when primed), then listen downstream.
    pub fn listen_downstream_and_repeat<F, R>(&self, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.listen_and_repeat(Direction::Downstream, callback)
    }

    /// Replay the current value (when primed), then listen upstream.
    pub fn listen_upstream_and_repeat<F, R>(&self, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.listen_and_repeat(Direction::Upstream, callback)
    }

    fn listen_and_repeat<F, R>(&self, direction: Direction, callback: F) -> CellResult<Subscription>
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        let listener: Listener<T> = Rc::new(move |v: &T| callback(v).into_result());
        if let Some(value) = self.value() {
            listener(&value)?;
        }
        Ok(self.channel(direction).attach(listener, false))
    }

    /// Derive a child cell connected through `pipeline`.
    ///
    /// Downstream values of this cell run through the pipeline's down half
    /// into the child; upstream writes on the child run through the up half
    /// back into this cell. The child starts with this cell's current value
    /// mapped through the down half, when that happens synchronously.
    ///
    /// Upstream values run through the up halves last step first, so each
    /// up half receives the type its own down half produced.
    ///
    /// Cancelling the child detaches it from this cell.
    pub fn transform_duplex<U, P>(&self, pipeline: P) -> DuplexCell<U>
    where
        U: Clone + 'static,
        P: Into<DuplexPipeline<T, U>>,
    {
        let DuplexPipeline { down, up } = pipeline.into();
        let child: DuplexCell<U> = DuplexCell::with_diagnostics(None, false, self.inner.diagnostics.clone());

        let run_down = down.bind(Rc::new(DownstreamSink(child.clone())));
        if let Some(value) = self.value() {
            if let Err(e) = run_down(value) {
                error!(parent = self.inner.id, error = %e, "seeding a derived duplex cell failed");
            }
        }
        let feed = self.listen_downstream(move |v: &T| run_down(v.clone()));
        child.bind_source(&feed);

        let run_up = up.bind(Rc::new(UpstreamSink(self.downgrade())));
        child.listen_upstream(move |v: &U| run_up(v.clone()));

        debug!(parent = self.inner.id, child = child.inner.id, "duplex cell derived");
        child
    }

    /// Derive a child that only lets values travel in `direction`.
    pub fn create_one_way(&self, direction: Direction) -> DuplexCell<T> {
        self.transform_duplex(diode(direction))
    }

    /// A value cell following the downstream flow.
    pub fn downstream_cell(&self) -> ValueCell<T> {
        let cell = ValueCell::with_diagnostics(self.value(), self.inner.diagnostics.clone());
        let target = cell.clone();
        cell.bind_source(&self.listen_downstream(move |v: &T| target.update(v.clone())));
        cell
    }

    pub fn has_subscriptions(&self) -> bool {
        self.inner.downstream.has_subscriptions() || self.inner.upstream.has_subscriptions()
    }

    /// Drop every listener in both directions and detach from the parent.
    pub fn cancel_all(&self) {
        self.inner.downstream.cancel_all();
        self.inner.upstream.cancel_all();
        self.inner.sources.cancel();
    }

    fn bind_source(&self, subscription: &Subscription) {
        // Only fails on a cancelled cell, and then removes the subscription.
        let _ = subscription.clone().until(&self.inner.sources);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn downgrade(&self) -> Weak<DuplexInner<T>> {
        Rc::downgrade(&self.inner)
    }
}

impl<T: Clone + 'static> Clone for DuplexCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + std::fmt::Debug + 'static> std::fmt::Debug for DuplexCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexCell")
            .field("id", &self.inner.id)
            .field("value", &self.value())
            .field("root", &self.inner.propagate_writes_to_read_stream)
            .finish()
    }
}

struct DownstreamSink<T: Clone + 'static>(DuplexCell<T>);

impl<T: Clone + 'static> PipelineSink<T> for DownstreamSink<T> {
    fn accept(&self, value: T) -> CellResult<()> {
        self.0.update_downstream(value)
    }

    fn reject(&self, error: CellError) -> CellResult<()> {
        Err(error)
    }
}

/// Holds the parent weakly; a dropped parent swallows upstream writes.
struct UpstreamSink<T: 'static>(Weak<DuplexInner<T>>);

impl<T: Clone + 'static> PipelineSink<T> for UpstreamSink<T> {
    fn accept(&self, value: T) -> CellResult<()> {
        match self.0.upgrade() {
            Some(inner) => DuplexCell { inner }.update_upstream(value),
            None => Ok(()),
        }
    }

    fn reject(&self, error: CellError) -> CellResult<()> {
        Err(error)
    }
}

/// One step of a duplex pipeline: a downstream operator and its upstream
/// counterpart.
pub struct DuplexOperator<D, U> {
    pub name: String,
    pub down: Operator<D, U>,
    pub up: Operator<U, D>,
}

impl<D: 'static, U: 'static> DuplexOperator<D, U> {
    pub fn new(name: impl Into<String>, down: Operator<D, U>, up: Operator<U, D>) -> Self {
        let name = name.into();
        Self {
            down: down.named(format!("{name}.down")),
            up: up.named(format!("{name}.up")),
            name,
        }
    }

    /// Start a duplex pipeline with this step followed by `next`.
    pub fn then<V: 'static>(self, next: DuplexOperator<U, V>) -> DuplexPipeline<D, V> {
        DuplexPipeline::from(self).then(next)
    }
}

/// A chain of duplex operators.
///
/// Downstream values run through the down halves in declaration order.
/// Upstream values run through the up halves in reverse declaration order,
/// so each up half receives the type its own down half produced.
pub struct DuplexPipeline<D, U> {
    down: Pipeline<D, U>,
    up: Pipeline<U, D>,
}

impl<T: 'static> DuplexPipeline<T, T> {
    pub fn identity() -> Self {
        Self {
            down: Pipeline::identity(),
            up: Pipeline::identity(),
        }
    }
}

impl<D: 'static, U: 'static> DuplexPipeline<D, U> {
    pub fn then<V: 'static>(self, next: DuplexOperator<U, V>) -> DuplexPipeline<D, V> {
        DuplexPipeline {
            down: self.down.then(next.down),
            up: Pipeline::from(next.up).chain(self.up),
        }
    }

    pub fn len(&self) -> usize {
        self.down.len()
    }

    pub fn is_empty(&self) -> bool {
        self.down.is_empty()
    }
}

impl<D: 'static, U: 'static> From<DuplexOperator<D, U>> for DuplexPipeline<D, U> {
    fn from(operator: DuplexOperator<D, U>) -> Self {
        Self {
            down: Pipeline::from(operator.down),
            up: Pipeline::from(operator.up),
        }
    }
}

/// Map values both ways.
pub fn duplex_map<D, U, F, G>(down: F, up: G) -> DuplexOperator<D, U>
where
    D: 'static,
    U: 'static,
    F: Fn(D) -> U + 'static,
    G: Fn(U) -> D + 'static,
{
    DuplexOperator::new("duplex_map", map(down), map(up))
}

/// Filter values with a separate predicate per direction.
pub fn duplex_filter<T, F, G>(down: F, up: G) -> DuplexOperator<T, T>
where
    T: 'static,
    F: Fn(&T) -> bool + 'static,
    G: Fn(&T) -> bool + 'static,
{
    DuplexOperator::new("duplex_filter", filter(down), filter(up))
}

/// Let values travel in `direction` only.
pub fn diode<T: 'static>(direction: Direction) -> DuplexOperator<T, T> {
    let downstream = direction == Direction::Downstream;
    DuplexOperator::new("diode", filter(move |_: &T| downstream), filter(move |_: &T| !downstream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn record<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(&T) + 'static) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |v: &T| sink.borrow_mut().push(v.clone()))
    }

    #[test]
    fn non_root_upstream_write_stays_upstream() {
        let cell = DuplexCell::new(0, false);
        let (down, on_down) = record();
        let (up, on_up) = record();
        cell.listen_downstream(on_down);
        cell.listen_upstream(on_up);

        cell.update_upstream(5).unwrap();
        assert_eq!(*up.borrow(), vec![5]);
        assert!(down.borrow().is_empty());
        assert_eq!(cell.value(), Some(5));
    }

    #[test]
    fn root_echoes_upstream_writes() {
        let cell = DuplexCell::root(0);
        let (down, on_down) = record();
        cell.listen_downstream(on_down);

        cell.update_upstream(5).unwrap();
        assert_eq!(*down.borrow(), vec![5]);
    }

    #[test]
    fn directions_have_independent_guards() {
        let cell = DuplexCell::new(0, false);
        let handle = cell.clone();
        cell.listen_upstream(move |v: &i32| handle.update_downstream(v * 10));
        let (down, on_down) = record();
        cell.listen_downstream(on_down);

        cell.update_upstream(1).unwrap();
        assert_eq!(*down.borrow(), vec![10]);

        let looping = DuplexCell::new(0, false);
        let handle = looping.clone();
        looping.listen_downstream(move |v: &i32| handle.update_downstream(v + 1));
        assert!(matches!(looping.update_downstream(1), Err(CellError::ReentrantUpdate(_))));
    }

    #[test]
    fn transform_duplex_maps_both_ways() {
        let cents = DuplexCell::root(150_i64);
        let euros = cents.transform_duplex(duplex_map(|c: i64| c / 100, |e: i64| e * 100));
        assert_eq!(euros.value(), Some(1));

        cents.update_downstream(900).unwrap();
        assert_eq!(euros.value(), Some(9));

        euros.update_upstream(3).unwrap();
        assert_eq!(cents.value(), Some(300));
        // The root echoes the edit back down to every child.
        assert_eq!(euros.value(), Some(3));
    }

    #[test]
    fn chained_duplex_pipeline_reverses_upstream() {
        let root = DuplexCell::root(2_i32);
        let label = root.transform_duplex(
            duplex_map(|v: i32| v * 10, |v: i32| v / 10).then(duplex_map(
                |v: i32| v.to_string(),
                |s: String| s.parse::<i32>().unwrap_or_default(),
            )),
        );
        assert_eq!(label.value().as_deref(), Some("20"));

        label.update_upstream("70".to_string()).unwrap();
        assert_eq!(root.value(), Some(7));
    }

    #[test]
    fn one_way_children_block_the_other_direction() {
        let root = DuplexCell::root(1);
        let read_only = root.create_one_way(Direction::Downstream);
        let write_only = root.create_one_way(Direction::Upstream);

        root.update_downstream(2).unwrap();
        assert_eq!(read_only.value(), Some(2));
        assert_eq!(write_only.value(), None);

        read_only.update_upstream(9).unwrap();
        assert_eq!(root.value(), Some(2));

        write_only.update_upstream(9).unwrap();
        assert_eq!(root.value(), Some(9));
        assert_eq!(read_only.value(), Some(9));
    }

    #[test]
    fn downstream_cell_follows_downstream_flow() {
        let root = DuplexCell::root(1);
        let view = root.downstream_cell();
        assert_eq!(view.value(), Some(1));

        root.update_downstream(4).unwrap();
        assert_eq!(view.value(), Some(4));
    }

    #[test]
    fn listen_and_repeat_replays_per_direction() {
        let cell = DuplexCell::new(3, false);
        let (down, on_down) = record();
        cell.listen_downstream_and_repeat(on_down).unwrap();
        assert_eq!(*down.borrow(), vec![3]);
        assert_eq!(Direction::Upstream.reverse(), Direction::Downstream);
    }

    #[test]
    fn cancelled_children_leave_the_parent() {
        let root = DuplexCell::root(1);
        let child = root.transform_duplex(duplex_map(|v: i32| v + 1, |v: i32| v - 1));
        let view = root.downstream_cell();
        assert!(root.has_subscriptions());

        child.cancel_all();
        view.cancel_all();
        assert!(!root.has_subscriptions());

        root.update_downstream(5).unwrap();
        assert_eq!(child.value(), Some(2));
        assert_eq!(view.value(), Some(1));
    }

    #[test]
    #[traced_test]
    fn failed_seed_is_logged() {
        let root = DuplexCell::root(-1);
        let checked = DuplexOperator::new(
            "checked",
            crate::pipeline::try_map(|v: i32| {
                if v < 0 {
                    Err(CellError::failed("negative"))
                } else {
                    Ok(v)
                }
            }),
            map(|v: i32| v),
        );
        let child = root.transform_duplex(checked);

        assert_eq!(child.value(), None);
        assert!(logs_contain("seeding a derived duplex cell failed"));

        root.update_downstream(4).unwrap();
        assert_eq!(child.value(), Some(4));
    }

    #[test]
    fn cancel_all_clears_both_directions() {
        let cell = DuplexCell::new(0, false);
        cell.listen_downstream(|_: &i32| {});
        cell.listen_upstream(|_: &i32| {});
        assert!(cell.has_subscriptions());
        cell.cancel_all();
        assert!(!cell.has_subscriptions());
    }
}
