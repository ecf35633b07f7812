//! Operator library.
//!
//! Constructors for the common pipeline steps. Stateful operators (`unique`,
//! `skip`, `take`, `reduce`, `throttle`, `debounce`) keep their state inside
//! the operator, so every pipeline built from one operator value shares it.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;

use super::operator::{Gated, Operation, Operator};
use super::ordering::{Deferred, FreshnessToken};
use crate::error::CellResult;

/// Replace every value with `f(value)`.
pub fn map<I, O, F>(f: F) -> Operator<I, O>
where
    I: 'static,
    O: 'static,
    F: Fn(I) -> O + 'static,
{
    Operator::new("map", Operation::Map(Rc::new(move |v: I| Ok(f(v)))))
}

/// Replace every value with `f(value)`; failures go to the error channel.
pub fn try_map<I, O, F>(f: F) -> Operator<I, O>
where
    I: 'static,
    O: 'static,
    F: Fn(I) -> CellResult<O> + 'static,
{
    Operator::new("try_map", Operation::Map(Rc::new(f)))
}

/// Let through values matching `predicate`.
pub fn filter<T, F>(predicate: F) -> Operator<T, T>
where
    T: 'static,
    F: Fn(&T) -> bool + 'static,
{
    Operator::new(
        "filter",
        Operation::Filter(Rc::new(move |v: T| Ok(predicate(&v).then_some(v)))),
    )
}

/// Observe values without changing them.
pub fn tap<T, F>(f: F) -> Operator<T, T>
where
    T: 'static,
    F: Fn(&T) + 'static,
{
    Operator::new(
        "tap",
        Operation::Noop(Rc::new(move |v: T| {
            f(&v);
            Ok(v)
        })),
    )
}

/// Drop values equal to the previous one that got through.
pub fn unique<T>() -> Operator<T, T>
where
    T: Clone + PartialEq + 'static,
{
    let last: RefCell<Option<T>> = RefCell::new(None);
    Operator::new(
        "unique",
        Operation::Filter(Rc::new(move |v: T| {
            let mut last = last.borrow_mut();
            if last.as_ref() == Some(&v) {
                return Ok(None);
            }
            *last = Some(v.clone());
            Ok(Some(v))
        })),
    )
}

/// Drop the first `count` values.
pub fn skip<T: 'static>(count: usize) -> Operator<T, T> {
    let seen = Cell::new(0usize);
    Operator::new(
        "skip",
        Operation::Filter(Rc::new(move |v: T| {
            if seen.get() < count {
                seen.set(seen.get() + 1);
                Ok(None)
            } else {
                Ok(Some(v))
            }
        })),
    )
}

/// Let through the first `count` values only.
pub fn take<T: 'static>(count: usize) -> Operator<T, T> {
    let passed = Cell::new(0usize);
    Operator::new(
        "take",
        Operation::Filter(Rc::new(move |v: T| {
            if passed.get() >= count {
                return Ok(None);
            }
            passed.set(passed.get() + 1);
            Ok(Some(v))
        })),
    )
}

/// Fold every value into an accumulator and emit the accumulator.
pub fn reduce<T, A, F>(initial: A, f: F) -> Operator<T, A>
where
    T: 'static,
    A: Clone + 'static,
    F: Fn(&A, T) -> A + 'static,
{
    let acc = RefCell::new(initial);
    Operator::new(
        "reduce",
        Operation::Map(Rc::new(move |v: T| {
            let next = f(&acc.borrow(), v);
            *acc.borrow_mut() = next.clone();
            Ok(next)
        })),
    )
}

/// Let through at most one value per `period`, starting with the first.
pub fn throttle<T: 'static>(period: Duration) -> Operator<T, T> {
    let last: Cell<Option<Instant>> = Cell::new(None);
    Operator::new(
        "throttle",
        Operation::Filter(Rc::new(move |v: T| {
            let now = Instant::now();
            match last.get() {
                Some(at) if now.duration_since(at) < period => Ok(None),
                _ => {
                    last.set(Some(now));
                    Ok(Some(v))
                }
            }
        })),
    )
}

/// Replace every value with the output of an asynchronous function.
pub fn async_map<I, O, F, Fut>(f: F) -> Operator<I, O>
where
    I: 'static,
    O: 'static,
    F: Fn(I) -> Fut + 'static,
    Fut: Future<Output = O> + 'static,
{
    Operator::new(
        "async_map",
        Operation::MapDelay(Rc::new(move |v: I| {
            let pending = f(v);
            async move { Ok(pending.await) }.boxed_local()
        })),
    )
}

/// Let through values for which an asynchronous predicate resolves `true`.
pub fn async_filter<T, F, Fut>(predicate: F) -> Operator<T, T>
where
    T: 'static,
    F: Fn(&T) -> Fut + 'static,
    Fut: Future<Output = bool> + 'static,
{
    Operator::new(
        "async_filter",
        Operation::DelayFilter(Rc::new(move |v: T| {
            let pending = predicate(&v);
            async move { Ok(pending.await.then_some(v)) }.boxed_local()
        })),
    )
}

/// Hold every value back for `duration`.
pub fn delay<T: 'static>(duration: Duration) -> Operator<T, T> {
    Operator::new(
        "delay",
        Operation::Delay(Rc::new(move |v: T| {
            async move {
                tokio::time::sleep(duration).await;
                Ok(v)
            }
            .boxed_local()
        })),
    )
}

/// Emit a value once no newer value arrived for `duration`.
pub fn debounce<T: 'static>(duration: Duration) -> Operator<T, T> {
    let freshness = FreshnessToken::new();
    Operator::new(
        "debounce",
        Operation::MapDelayFilter(Rc::new(move |v: T| {
            let ticket = freshness.issue();
            let freshness = freshness.clone();
            async move {
                tokio::time::sleep(duration).await;
                Ok(if freshness.is_current(ticket) {
                    Gated::pass(v)
                } else {
                    Gated::cancelled()
                })
            }
            .boxed_local()
        })),
    )
}

/// Unwrap deferred values as they resolve, in resolution order.
pub fn await_value<T: Clone + 'static>() -> Operator<Deferred<T>, T> {
    Operator::new(
        "await_value",
        Operation::MapDelay(Rc::new(|pending: Deferred<T>| async move { Ok(pending.await) }.boxed_local())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;
    use crate::pipeline::deferred;
    use crate::reactive::ValueCell;
    use tokio::task::LocalSet;

    fn record<T: Clone + 'static>(cell: &ValueCell<T>) -> Rc<RefCell<Vec<T>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        cell.listen(move |v: &T| sink.borrow_mut().push(v.clone()));
        log
    }

    #[test]
    fn map_and_filter_compose() {
        let source = ValueCell::new(0);
        let out: ValueCell<String> = source.transform(filter(|v: &i32| v % 2 == 0).then(map(|v: i32| format!("#{v}"))));
        let seen = record(&out);

        for v in 1..=4 {
            source.update(v).unwrap();
        }
        assert_eq!(*seen.borrow(), vec!["#2".to_string(), "#4".to_string()]);
    }

    #[test]
    fn try_map_failures_reach_error_listeners() {
        let source = ValueCell::new(0);
        let out: ValueCell<i32> = source.transform(try_map(|v: i32| {
            if v < 0 {
                Err(CellError::failed("negative"))
            } else {
                Ok(v)
            }
        }));
        let errors = Rc::new(RefCell::new(Vec::new()));
        {
            let errors = errors.clone();
            out.on_error(move |e: &CellError| errors.borrow_mut().push(e.clone()));
        }

        source.update(-1).unwrap();
        source.update(2).unwrap();
        assert_eq!(*errors.borrow(), vec![CellError::failed("negative")]);
        assert_eq!(out.value(), Some(2));
    }

    #[test]
    fn tap_sees_values_unchanged() {
        let tapped = Rc::new(Cell::new(0));
        let source = ValueCell::new(0);
        let out: ValueCell<i32> = {
            let tapped = tapped.clone();
            source.transform(tap(move |v: &i32| tapped.set(*v)))
        };

        source.update(8).unwrap();
        assert_eq!(tapped.get(), 8);
        assert_eq!(out.value(), Some(8));
    }

    #[test]
    fn unique_drops_consecutive_repeats() {
        let source = ValueCell::new(0);
        let out: ValueCell<i32> = source.transform(unique());
        let seen = record(&out);

        for v in [1, 1, 2, 2, 1] {
            source.update(v).unwrap();
        }
        assert_eq!(*seen.borrow(), vec![1, 2, 1]);
    }

    #[test]
    fn skip_and_take_count_values() {
        let source = ValueCell::new(0);
        let out: ValueCell<i32> = source.transform(skip(1).then(take(2)));
        let seen = record(&out);

        for v in 1..=5 {
            source.update(v).unwrap();
        }
        assert_eq!(*seen.borrow(), vec![2, 3]);
    }

    #[test]
    fn reduce_accumulates() {
        let source = ValueCell::new(0);
        let total: ValueCell<i64> = source.transform(reduce(0i64, |acc: &i64, v: i32| acc + v as i64));

        for v in [1, 2, 3] {
            source.update(v).unwrap();
        }
        assert_eq!(total.value(), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_limits_rate() {
        let source = ValueCell::new(0);
        let out: ValueCell<i32> = source.transform(throttle(Duration::from_millis(100)));
        let seen = record(&out);

        source.update(1).unwrap();
        source.update(2).unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        source.update(3).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_holds_values_back() {
        LocalSet::new()
            .run_until(async {
                let source = ValueCell::new(0);
                let out: ValueCell<i32> = source.transform(delay(Duration::from_millis(20)));

                source.update(5).unwrap();
                assert!(!out.is_primed());
                tokio::time::sleep(Duration::from_millis(30)).await;
                assert_eq!(out.value(), Some(5));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn async_map_and_filter_resolve_later() {
        LocalSet::new()
            .run_until(async {
                let source = ValueCell::new(0);
                let out: ValueCell<i32> = source.transform(
                    async_filter(|v: &i32| {
                        let keep = *v > 1;
                        async move { keep }
                    })
                    .then(async_map(|v: i32| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        v * 100
                    })),
                );
                let seen = record(&out);

                source.update(1).unwrap();
                source.update(2).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(*seen.borrow(), vec![200]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_keeps_the_last_burst_value() {
        LocalSet::new()
            .run_until(async {
                let source = ValueCell::new(0);
                let out: ValueCell<i32> = source.transform(debounce(Duration::from_millis(50)));
                let seen = record(&out);

                source.update(1).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                source.update(2).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                source.update(3).unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(*seen.borrow(), vec![3]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn await_value_emits_in_resolution_order() {
        LocalSet::new()
            .run_until(async {
                let source: ValueCell<Deferred<&'static str>> = ValueCell::unprimed();
                let out: ValueCell<&'static str> = source.transform(await_value());
                let seen = record(&out);

                source
                    .update(deferred(async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        "slow"
                    }))
                    .unwrap();
                source
                    .update(deferred(async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        "fast"
                    }))
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(*seen.borrow(), vec!["fast", "slow"]);
            })
            .await;
    }
}
