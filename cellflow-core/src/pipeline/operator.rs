//! Operators
//!
//! An [`Operator`] is one named step of a transform pipeline. What the step
//! does is described by its [`Operation`], a sum type with one variant per
//! [`OperationType`]. The interpreter matches on it exhaustively.
//!
//! Filter-type steps hand back `Some(item)` to continue and `None` to stop
//! the current value; map-type steps always produce a replacement value.
//! Asynchronous variants return a boxed local future.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use futures_util::future::{self, LocalBoxFuture};
use futures_util::FutureExt;

use crate::error::{CellError, CellResult};

/// Future returned by asynchronous operator steps.
pub type OperatorFuture<T> = LocalBoxFuture<'static, CellResult<T>>;

/// The kind of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Synchronously decides whether the value continues.
    Filter,
    /// Observes the value without changing it.
    Noop,
    /// Synchronously replaces the value.
    Map,
    /// Waits, then passes the value on.
    Delay,
    /// Asynchronously replaces the value.
    MapDelay,
    /// Asynchronously decides whether the value continues.
    DelayFilter,
    /// Asynchronously replaces the value or cancels it.
    MapDelayFilter,
}

impl OperationType {
    /// Whether steps of this kind suspend the pipeline.
    pub fn is_async(self) -> bool {
        matches!(
            self,
            Self::Delay | Self::MapDelay | Self::DelayFilter | Self::MapDelayFilter
        )
    }

    /// Whether steps of this kind can stop propagation.
    pub fn can_stop(self) -> bool {
        matches!(self, Self::Filter | Self::DelayFilter | Self::MapDelayFilter)
    }
}

/// Outcome of a [`Operation::MapDelayFilter`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gated<T> {
    pub item: Option<T>,
    pub cancelled: bool,
}

impl<T> Gated<T> {
    /// Let `item` continue.
    pub fn pass(item: T) -> Self {
        Self {
            item: Some(item),
            cancelled: false,
        }
    }

    /// Stop propagation of the current value.
    pub fn cancelled() -> Self {
        Self {
            item: None,
            cancelled: true,
        }
    }

    /// The item to continue with, if the step was not cancelled.
    pub fn into_item(self) -> Option<T> {
        if self.cancelled {
            None
        } else {
            self.item
        }
    }
}

/// What an operator does, by kind.
pub enum Operation<I, O> {
    Filter(Rc<dyn Fn(I) -> CellResult<Option<O>>>),
    Noop(Rc<dyn Fn(I) -> CellResult<O>>),
    Map(Rc<dyn Fn(I) -> CellResult<O>>),
    Delay(Rc<dyn Fn(I) -> OperatorFuture<O>>),
    MapDelay(Rc<dyn Fn(I) -> OperatorFuture<O>>),
    DelayFilter(Rc<dyn Fn(I) -> OperatorFuture<Option<O>>>),
    MapDelayFilter(Rc<dyn Fn(I) -> OperatorFuture<Gated<O>>>),
}

impl<I, O> Operation<I, O> {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::Filter(_) => OperationType::Filter,
            Self::Noop(_) => OperationType::Noop,
            Self::Map(_) => OperationType::Map,
            Self::Delay(_) => OperationType::Delay,
            Self::MapDelay(_) => OperationType::MapDelay,
            Self::DelayFilter(_) => OperationType::DelayFilter,
            Self::MapDelayFilter(_) => OperationType::MapDelayFilter,
        }
    }
}

impl<I, O> Clone for Operation<I, O> {
    fn clone(&self) -> Self {
        match self {
            Self::Filter(f) => Self::Filter(f.clone()),
            Self::Noop(f) => Self::Noop(f.clone()),
            Self::Map(f) => Self::Map(f.clone()),
            Self::Delay(f) => Self::Delay(f.clone()),
            Self::MapDelay(f) => Self::MapDelay(f.clone()),
            Self::DelayFilter(f) => Self::DelayFilter(f.clone()),
            Self::MapDelayFilter(f) => Self::MapDelayFilter(f.clone()),
        }
    }
}

/// Type-erased value flowing between pipeline steps.
pub(crate) type AnyValue = Box<dyn Any>;

/// An operator whose input and output types have been erased.
pub(crate) type ErasedOperator = Operator<AnyValue, AnyValue>;

/// A named pipeline step turning `I` into `O`.
pub struct Operator<I, O> {
    name: Cow<'static, str>,
    operation: Operation<I, O>,
}

impl<I: 'static, O: 'static> Operator<I, O> {
    pub fn new(name: impl Into<Cow<'static, str>>, operation: Operation<I, O>) -> Self {
        Self {
            name: name.into(),
            operation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> &Operation<I, O> {
        &self.operation
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation.operation_type()
    }

    /// Rename the operator. Names show up in operator errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Start a pipeline running this operator, then `next`.
    pub fn then<P: 'static>(self, next: Operator<O, P>) -> super::Pipeline<I, P> {
        super::Pipeline::from(self).then(next)
    }

    /// Erase input and output types so heterogeneous steps share one list.
    pub(crate) fn erase(self) -> ErasedOperator {
        let name = self.name;
        let label = name.to_string();

        let operation = match self.operation {
            Operation::Filter(f) => Operation::Filter(Rc::new(move |value: AnyValue| {
                let input = downcast::<I>(&label, value)?;
                Ok(f(input)?.map(box_value))
            })),
            Operation::Noop(f) => Operation::Noop(erase_sync(label, f)),
            Operation::Map(f) => Operation::Map(erase_sync(label, f)),
            Operation::Delay(f) => Operation::Delay(erase_async(label, f, box_value)),
            Operation::MapDelay(f) => Operation::MapDelay(erase_async(label, f, box_value)),
            Operation::DelayFilter(f) => {
                Operation::DelayFilter(erase_async(label, f, |item: Option<O>| item.map(box_value)))
            }
            Operation::MapDelayFilter(f) => Operation::MapDelayFilter(erase_async(label, f, |gate: Gated<O>| Gated {
                item: gate.item.map(box_value),
                cancelled: gate.cancelled,
            })),
        };

        Operator { name, operation }
    }
}

impl<I, O> Clone for Operator<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            operation: self.operation.clone(),
        }
    }
}

impl<I, O> fmt::Debug for Operator<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("operation_type", &self.operation.operation_type())
            .finish()
    }
}

fn box_value<T: 'static>(value: T) -> AnyValue {
    Box::new(value)
}

fn downcast<T: 'static>(operator: &str, value: AnyValue) -> CellResult<T> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| CellError::operator(operator, "received a value of an unexpected type"))
}

fn erase_sync<I: 'static, O: 'static>(
    label: String,
    f: Rc<dyn Fn(I) -> CellResult<O>>,
) -> Rc<dyn Fn(AnyValue) -> CellResult<AnyValue>> {
    Rc::new(move |value: AnyValue| {
        let input = downcast::<I>(&label, value)?;
        f(input).map(box_value)
    })
}

fn erase_async<I, O, E>(
    label: String,
    f: Rc<dyn Fn(I) -> OperatorFuture<O>>,
    wrap: fn(O) -> E,
) -> Rc<dyn Fn(AnyValue) -> OperatorFuture<E>>
where
    I: 'static,
    O: 'static,
    E: 'static,
{
    Rc::new(move |value: AnyValue| match downcast::<I>(&label, value) {
        Ok(input) => f(input).map(move |result| result.map(wrap)).boxed_local(),
        Err(error) => future::ready(Err(error)).boxed_local(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double() -> Operator<i32, i32> {
        Operator::new("double", Operation::Map(Rc::new(|v: i32| Ok(v * 2))))
    }

    #[test]
    fn operation_types_are_reported() {
        assert_eq!(double().operation_type(), OperationType::Map);
        assert!(!OperationType::Map.is_async());
        assert!(OperationType::MapDelayFilter.is_async());
        assert!(OperationType::MapDelayFilter.can_stop());
        assert!(!OperationType::Noop.can_stop());
    }

    #[test]
    fn erased_operator_keeps_behavior() {
        let erased = double().erase();
        let Operation::Map(f) = erased.operation() else {
            panic!("erasure changed the operation type");
        };
        let out = f(Box::new(21)).unwrap();
        assert_eq!(*out.downcast::<i32>().unwrap(), 42);
    }

    #[test]
    fn erased_operator_rejects_foreign_types() {
        let erased = double().erase();
        let Operation::Map(f) = erased.operation() else {
            panic!("erasure changed the operation type");
        };
        let err = f(Box::new("not a number")).unwrap_err();
        assert!(matches!(err, CellError::Operator { ref operator, .. } if operator == "double"));
    }

    #[test]
    fn gated_cancel_wins() {
        assert_eq!(Gated::pass(1).into_item(), Some(1));
        assert_eq!(Gated::<i32>::cancelled().into_item(), None);
        let odd = Gated {
            item: Some(1),
            cancelled: true,
        };
        assert_eq!(odd.into_item(), None);
    }
}
