//! Operator Pipelines
//!
//! A [`Pipeline`] is an ordered list of [`Operator`]s that a cell runs every
//! update through before handing the result to a derived cell.
//!
//! # Concepts
//!
//! ## Ordering
//!
//! Steps always run in declared order. Synchronous steps run inline, inside
//! the `update` call that produced the value. The first asynchronous step
//! suspends that value on a local task, and everything after it runs when
//! the step resolves.
//!
//! ## Races
//!
//! Each value is processed independently. Two values that are both
//! suspended race each other unless an operator imposes an order:
//! [`await_ordered`] releases results in arrival order and [`await_latest`]
//! drops every result that has been superseded by a newer input.
//!
//! # Runtime Requirements
//!
//! Asynchronous steps are spawned with `tokio::task::spawn_local`, so a
//! pipeline containing them must be driven from inside a
//! `tokio::task::LocalSet`. Purely synchronous pipelines need no runtime.

mod interpreter;
mod operator;
mod operators;
mod ordering;

use std::marker::PhantomData;
use std::rc::Rc;

pub use operator::{Gated, Operation, OperationType, Operator, OperatorFuture};
pub use operators::{
    async_filter, async_map, await_value, debounce, delay, filter, map, reduce, skip, take, tap,
    throttle, try_map, unique,
};
pub use ordering::{await_latest, await_ordered, deferred, Deferred, FreshnessToken};

pub(crate) use operator::ErasedOperator;

use crate::error::{CellError, CellResult};

/// Receiver of a pipeline's results.
pub trait PipelineSink<O> {
    /// A value made it through every step.
    fn accept(&self, value: O) -> CellResult<()>;

    /// A step failed.
    fn reject(&self, error: CellError) -> CellResult<()>;
}

/// An ordered chain of operators turning `I` into `O`.
pub struct Pipeline<I, O> {
    operators: Vec<ErasedOperator>,
    _types: PhantomData<fn(I) -> O>,
}

impl<T: 'static> Pipeline<T, T> {
    /// A pipeline that passes every value through unchanged.
    pub fn identity() -> Self {
        Self {
            operators: Vec::new(),
            _types: PhantomData,
        }
    }
}

impl<I: 'static, O: 'static> Pipeline<I, O> {
    /// Append `next` as the last step.
    pub fn then<P: 'static>(mut self, next: Operator<O, P>) -> Pipeline<I, P> {
        self.operators.push(next.erase());
        Pipeline {
            operators: self.operators,
            _types: PhantomData,
        }
    }

    /// Append every step of `rest`.
    pub fn chain<P: 'static>(mut self, rest: Pipeline<O, P>) -> Pipeline<I, P> {
        self.operators.extend(rest.operators);
        Pipeline {
            operators: self.operators,
            _types: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Names of the steps in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.operators.iter().map(|op| op.name()).collect()
    }

    /// Kinds of the steps in execution order.
    pub fn operation_types(&self) -> Vec<OperationType> {
        self.operators.iter().map(|op| op.operation_type()).collect()
    }

    /// Turn the pipeline into an entry point that feeds `sink`.
    ///
    /// The returned function runs the synchronous prefix of the pipeline and
    /// reports what happened to it; asynchronous continuations report their
    /// own failures through the log.
    pub fn bind(self, sink: Rc<dyn PipelineSink<O>>) -> Rc<dyn Fn(I) -> CellResult<()>> {
        let operators: Rc<[ErasedOperator]> = self.operators.into();
        Rc::new(move |input: I| interpreter::execute(operators.clone(), Box::new(input), sink.clone()))
    }
}

impl<I: 'static, O: 'static> From<Operator<I, O>> for Pipeline<I, O> {
    fn from(operator: Operator<I, O>) -> Self {
        Self {
            operators: vec![operator.erase()],
            _types: PhantomData,
        }
    }
}

impl<I, O> Clone for Pipeline<I, O> {
    fn clone(&self) -> Self {
        Self {
            operators: self.operators.clone(),
            _types: PhantomData,
        }
    }
}

impl<I, O> std::fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.operators.iter()).finish()
    }
}
