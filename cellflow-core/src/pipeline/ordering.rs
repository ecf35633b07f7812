//! Ordering policies for asynchronous values.
//!
//! A cell carrying [`Deferred`] values can race: a value written later may
//! resolve sooner. [`await_ordered`] releases results strictly in the order
//! the values arrived. [`await_latest`] only releases a result if no newer
//! value arrived while it was pending; superseded work still runs to
//! completion, its result is dropped.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use futures_util::future::{LocalBoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::oneshot;

use super::operator::{Gated, Operation, Operator};

/// A value that becomes available later. Cloning shares the same result.
pub type Deferred<T> = Shared<LocalBoxFuture<'static, T>>;

/// Wrap a future so it can travel through a cell.
pub fn deferred<T, F>(future: F) -> Deferred<T>
where
    T: Clone + 'static,
    F: Future<Output = T> + 'static,
{
    future.boxed_local().shared()
}

/// Monotonic counter telling whether a ticket is still the newest one.
#[derive(Debug, Clone, Default)]
pub struct FreshnessToken {
    latest: Rc<Cell<u64>>,
}

impl FreshnessToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supersede every earlier ticket.
    pub fn issue(&self) -> u64 {
        let ticket = self.latest.get() + 1;
        self.latest.set(ticket);
        ticket
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.latest.get() == ticket
    }
}

type Released = Shared<LocalBoxFuture<'static, ()>>;

/// Resolve deferred values, emitting results in arrival order.
pub fn await_ordered<T: Clone + 'static>() -> Operator<Deferred<T>, T> {
    // Completion signal of the most recently queued value.
    let tail: RefCell<Option<Released>> = RefCell::new(None);

    Operator::new(
        "await_ordered",
        Operation::MapDelay(Rc::new(move |pending: Deferred<T>| {
            let (release, released) = oneshot::channel::<()>();
            let released: Released = released.map(|_| ()).boxed_local().shared();
            let previous = tail.replace(Some(released));

            async move {
                let value = pending.await;
                if let Some(previous) = previous {
                    previous.await;
                }
                let _ = release.send(());
                Ok(value)
            }
            .boxed_local()
        })),
    )
}

/// Resolve deferred values, dropping any result superseded by a newer value.
pub fn await_latest<T: Clone + 'static>() -> Operator<Deferred<T>, T> {
    let freshness = FreshnessToken::new();

    Operator::new(
        "await_latest",
        Operation::MapDelayFilter(Rc::new(move |pending: Deferred<T>| {
            let ticket = freshness.issue();
            let freshness = freshness.clone();
            async move {
                let value = pending.await;
                Ok(if freshness.is_current(ticket) {
                    Gated::pass(value)
                } else {
                    Gated::cancelled()
                })
            }
            .boxed_local()
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ValueCell;
    use std::time::Duration;
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    fn after(ms: u64, label: &'static str) -> Deferred<&'static str> {
        deferred(async move {
            sleep(Duration::from_millis(ms)).await;
            label
        })
    }

    fn record(cell: &ValueCell<&'static str>) -> Rc<RefCell<Vec<&'static str>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        cell.listen(move |v: &&'static str| sink.borrow_mut().push(*v));
        log
    }

    #[test]
    fn freshness_tickets_supersede_each_other() {
        let token = FreshnessToken::new();
        let first = token.issue();
        assert!(token.is_current(first));
        let second = token.issue();
        assert!(!token.is_current(first));
        assert!(token.is_current(second));
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_emits_in_arrival_order() {
        LocalSet::new()
            .run_until(async {
                let source: ValueCell<Deferred<&'static str>> = ValueCell::unprimed();
                let out: ValueCell<&'static str> = source.transform(await_ordered());
                let seen = record(&out);

                source.update(after(30, "P1")).unwrap();
                source.update(after(10, "P2")).unwrap();

                sleep(Duration::from_millis(20)).await;
                assert!(seen.borrow().is_empty());

                sleep(Duration::from_millis(20)).await;
                assert_eq!(*seen.borrow(), vec!["P1", "P2"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn latest_drops_superseded_results() {
        LocalSet::new()
            .run_until(async {
                let source: ValueCell<Deferred<&'static str>> = ValueCell::unprimed();
                let out: ValueCell<&'static str> = source.transform(await_latest());
                let seen = record(&out);

                source.update(after(30, "P1")).unwrap();
                source.update(after(10, "P2")).unwrap();

                sleep(Duration::from_millis(50)).await;
                assert_eq!(*seen.borrow(), vec!["P2"]);
                assert_eq!(out.value(), Some("P2"));
            })
            .await;
    }

    #[tokio::test]
    async fn deferred_values_share_one_result() {
        let value = deferred(async { 7 });
        let copy = value.clone();
        assert_eq!(value.await, 7);
        assert_eq!(copy.await, 7);
    }
}
