//! Pipeline Interpreter
//!
//! Runs one input value through a list of erased operators.
//!
//! # Algorithm
//!
//! 1. Apply steps in order while they are synchronous.
//! 2. A filter step that rejects the value ends the run without output.
//! 3. A failing step hands its error to the sink and ends the run.
//! 4. The first asynchronous step hands the rest of the run to a local task,
//!    which awaits the step and continues with step 1 from the next index.
//!    Without a tokio runtime the step fails instead. Inside a runtime the
//!    task is spawned with `spawn_local`, which panics outside a `LocalSet`.
//! 5. A value that survives every step is handed to the sink.

use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tracing::{error, trace};

use super::operator::{AnyValue, ErasedOperator, Operation};
use super::PipelineSink;
use crate::error::{CellError, CellResult};

type Suspended = LocalBoxFuture<'static, CellResult<Option<AnyValue>>>;

/// Result of applying one step.
enum Step {
    Next(AnyValue),
    Stop,
    Failed(CellError),
    Suspend(Suspended),
}

fn apply(operator: &ErasedOperator, value: AnyValue) -> Step {
    match operator.operation() {
        Operation::Filter(f) => match f(value) {
            Ok(Some(value)) => Step::Next(value),
            Ok(None) => Step::Stop,
            Err(e) => Step::Failed(e),
        },
        Operation::Noop(f) | Operation::Map(f) => match f(value) {
            Ok(value) => Step::Next(value),
            Err(e) => Step::Failed(e),
        },
        Operation::Delay(f) | Operation::MapDelay(f) => {
            Step::Suspend(f(value).map(|result| result.map(Some)).boxed_local())
        }
        Operation::DelayFilter(f) => Step::Suspend(f(value)),
        Operation::MapDelayFilter(f) => {
            Step::Suspend(f(value).map(|result| result.map(|gate| gate.into_item())).boxed_local())
        }
    }
}

fn deliver<O: 'static>(value: AnyValue, sink: &dyn PipelineSink<O>) -> CellResult<()> {
    match value.downcast::<O>() {
        Ok(value) => sink.accept(*value),
        Err(_) => sink.reject(CellError::operator(
            "pipeline",
            "last step produced a value of an unexpected type",
        )),
    }
}

/// Run `input` through `operators`, feeding `sink`.
///
/// Errors returned here come from the synchronous part of the run: a step
/// failure that the sink did not recover from, or a failure while the sink
/// propagated the result.
pub(crate) fn execute<O: 'static>(
    operators: Rc<[ErasedOperator]>,
    input: AnyValue,
    sink: Rc<dyn PipelineSink<O>>,
) -> CellResult<()> {
    let mut value = input;

    for (index, operator) in operators.iter().enumerate() {
        match apply(operator, value) {
            Step::Next(next) => value = next,
            Step::Stop => {
                trace!(operator = operator.name(), "pipeline stopped by filter");
                return Ok(());
            }
            Step::Failed(e) => return sink.reject(e),
            Step::Suspend(pending) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return sink.reject(CellError::operator(
                        operator.name(),
                        "asynchronous step ran outside a tokio runtime",
                    ));
                }
                trace!(operator = operator.name(), "pipeline suspended");
                tokio::task::spawn_local(resume(operators.clone(), index + 1, pending, sink));
                return Ok(());
            }
        }
    }

    deliver(value, &*sink)
}

/// Continue a suspended run once `pending` resolves.
async fn resume<O: 'static>(
    operators: Rc<[ErasedOperator]>,
    mut index: usize,
    mut pending: Suspended,
    sink: Rc<dyn PipelineSink<O>>,
) {
    loop {
        let mut value = match pending.await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(e) => return report(sink.reject(e)),
        };

        loop {
            let Some(operator) = operators.get(index) else {
                return report(deliver(value, &*sink));
            };
            index += 1;

            match apply(operator, value) {
                Step::Next(next) => value = next,
                Step::Stop => return,
                Step::Failed(e) => return report(sink.reject(e)),
                Step::Suspend(next) => {
                    pending = next;
                    break;
                }
            }
        }
    }
}

/// Nobody is left to return an asynchronous failure to, so it is logged.
fn report(result: CellResult<()>) {
    if let Err(e) = result {
        error!(error = %e, "asynchronous pipeline step failed and no handler recovered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{filter, map, Pipeline};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Collect {
        values: RefCell<Vec<i32>>,
        errors: RefCell<Vec<CellError>>,
    }

    impl PipelineSink<i32> for Collect {
        fn accept(&self, value: i32) -> CellResult<()> {
            self.values.borrow_mut().push(value);
            Ok(())
        }

        fn reject(&self, error: CellError) -> CellResult<()> {
            self.errors.borrow_mut().push(error);
            Ok(())
        }
    }

    #[test]
    fn synchronous_steps_run_in_order() {
        let sink = Rc::new(Collect::default());
        let run = Pipeline::from(map(|v: i32| v + 1))
            .then(map(|v: i32| v * 10))
            .bind(sink.clone());

        run(1).unwrap();
        assert_eq!(*sink.values.borrow(), vec![20]);
    }

    #[test]
    fn filter_stops_the_value() {
        let sink = Rc::new(Collect::default());
        let run = Pipeline::from(filter(|v: &i32| *v > 2))
            .then(map(|v: i32| v * 10))
            .bind(sink.clone());

        run(1).unwrap();
        run(3).unwrap();
        assert_eq!(*sink.values.borrow(), vec![30]);
    }

    #[test]
    fn step_errors_go_to_the_sink() {
        let sink = Rc::new(Collect::default());
        let run = Pipeline::from(crate::pipeline::try_map(|_: i32| -> CellResult<i32> {
            Err(CellError::failed("nope"))
        }))
        .bind(sink.clone());

        run(1).unwrap();
        assert!(sink.values.borrow().is_empty());
        assert_eq!(*sink.errors.borrow(), vec![CellError::failed("nope")]);
    }

    #[test]
    fn async_step_without_runtime_fails_into_the_sink() {
        let sink = Rc::new(Collect::default());
        let run = Pipeline::from(map(|v: i32| v + 1))
            .then(crate::pipeline::async_map(|v: i32| async move { v * 2 }))
            .bind(sink.clone());

        run(1).unwrap();
        assert!(sink.values.borrow().is_empty());
        assert!(matches!(sink.errors.borrow().as_slice(), [CellError::Operator { .. }]));
    }

    #[test]
    fn identity_pipeline_delivers_input() {
        let sink = Rc::new(Collect::default());
        let run = Pipeline::<i32, i32>::identity().bind(sink.clone());
        run(5).unwrap();
        assert_eq!(*sink.values.borrow(), vec![5]);
    }
}
