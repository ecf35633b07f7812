//! Aggregation
//!
//! `aggregate` derives one cell from a cell and a tuple of one to nine other
//! cells. Whenever any participant fires, every participant's current value
//! is read again and the combinator runs on the full set; nothing is diffed.
//! The combinator only runs once every participant is primed.
//!
//! ```rust,ignore
//! let width = ValueCell::new(2);
//! let height = ValueCell::new(3);
//! let area = width.aggregate((height.clone(),), |w, (h,)| w * h);
//! ```
//!
//! Each participant mirrors its latest value into a shared slot that the
//! combinator reads from. The derived cell therefore holds no handle to any
//! participant and the participants never keep each other alive. Cancelling
//! the derived cell removes its listener from every participant.

use std::cell::RefCell;
use std::rc::Rc;

use super::cell::ValueCell;
use super::subscriber::SubscriptionSet;
use crate::error::CellResult;

type Recompute = Rc<dyn Fn() -> CellResult<()>>;

/// A tuple of value cells usable as aggregation co-participants.
pub trait CellTuple {
    /// Tuple of the participants' values.
    type Values;

    /// Latest known value of every participant.
    type Slots: 'static;

    /// Slots holding the participants' current values.
    fn seed(&self) -> Rc<Self::Slots>;

    /// Read every slot, `None` while any participant is unprimed.
    fn read(slots: &Self::Slots) -> Option<Self::Values>;

    /// Mirror every participant into `slots` and run `recompute` after each
    /// fire.
    fn watch(&self, slots: &Rc<Self::Slots>, recompute: &Recompute) -> SubscriptionSet;
}

macro_rules! impl_cell_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Clone + 'static),+> CellTuple for ($(ValueCell<$name>,)+) {
            type Values = ($($name,)+);
            type Slots = ($(RefCell<Option<$name>>,)+);

            fn seed(&self) -> Rc<Self::Slots> {
                Rc::new(($(RefCell::new(self.$idx.value()),)+))
            }

            fn read(slots: &Self::Slots) -> Option<Self::Values> {
                Some(($(slots.$idx.borrow().clone()?,)+))
            }

            fn watch(&self, slots: &Rc<Self::Slots>, recompute: &Recompute) -> SubscriptionSet {
                let mut subscriptions = SubscriptionSet::new();
                $(
                    let slot = slots.clone();
                    let run = recompute.clone();
                    subscriptions.push(self.$idx.listen(move |v: &$name| {
                        *slot.$idx.borrow_mut() = Some(v.clone());
                        run()
                    }));
                )+
                subscriptions
            }
        }
    };
}

impl_cell_tuple!(A: 0);
impl_cell_tuple!(A: 0, B: 1);
impl_cell_tuple!(A: 0, B: 1, C: 2);
impl_cell_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_cell_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_cell_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_cell_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_cell_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
impl_cell_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8);

impl<T: Clone + 'static> ValueCell<T> {
    /// Combine this cell with `others` into a derived cell.
    pub fn aggregate<C, R, F>(&self, others: C, combinator: F) -> ValueCell<R>
    where
        C: CellTuple,
        R: Clone + 'static,
        F: Fn(&T, C::Values) -> R + 'static,
    {
        let (result, recompute) = self.bind_aggregate(others, move |own: &T, rest| Ok(combinator(own, rest)));
        // A fresh cell has no listeners yet, so the first update cannot fail.
        let _ = recompute();
        result
    }

    /// Like [`aggregate`](Self::aggregate) with a fallible combinator.
    ///
    /// Later failures go to the derived cell's error channel; a failure of
    /// the initial computation that nothing handles is returned here.
    pub fn try_aggregate<C, R, F>(&self, others: C, combinator: F) -> CellResult<ValueCell<R>>
    where
        C: CellTuple,
        R: Clone + 'static,
        F: Fn(&T, C::Values) -> CellResult<R> + 'static,
    {
        let (result, recompute) = self.bind_aggregate(others, combinator);
        recompute()?;
        Ok(result)
    }

    fn bind_aggregate<C, R, F>(&self, others: C, combinator: F) -> (ValueCell<R>, Recompute)
    where
        C: CellTuple,
        R: Clone + 'static,
        F: Fn(&T, C::Values) -> CellResult<R> + 'static,
    {
        let result: ValueCell<R> = self.derived();
        let own_slot = Rc::new(RefCell::new(self.value()));
        let slots = others.seed();

        let recompute: Recompute = {
            let result = result.clone();
            let own_slot = own_slot.clone();
            let slots = slots.clone();
            Rc::new(move || {
                let own = own_slot.borrow().clone();
                let (Some(own), Some(rest)) = (own, C::read(&slots)) else {
                    return Ok(());
                };
                match combinator(&own, rest) {
                    Ok(value) => result.update(value),
                    Err(error) => result.emit_error(error),
                }
            })
        };

        let run = recompute.clone();
        let mut subscriptions = others.watch(&slots, &recompute);
        subscriptions.push(self.listen(move |v: &T| {
            *own_slot.borrow_mut() = Some(v.clone());
            run()
        }));
        for subscription in subscriptions.iter() {
            result.bind_source(subscription);
        }
        tracing::debug!(participants = subscriptions.len(), "aggregate cell bound");

        (result, recompute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;

    #[test]
    fn aggregates_one_co_cell() {
        let a = ValueCell::new(2);
        let b = ValueCell::new(3);
        let product = a.aggregate((b.clone(),), |a, (b,)| a * b);

        assert_eq!(product.value(), Some(6));
        b.update(4).unwrap();
        assert_eq!(product.value(), Some(8));
        a.update(10).unwrap();
        assert_eq!(product.value(), Some(40));
    }

    #[test]
    fn cancelled_aggregate_leaves_participants() {
        let a = ValueCell::new(1);
        let b = ValueCell::new(2);
        let sum = a.aggregate((b.clone(),), |a, (b,)| a + b);
        assert_eq!((a.subscriber_count(), b.subscriber_count()), (1, 1));

        sum.cancel_all();
        drop(sum);
        assert!(!a.has_subscriptions());
        assert!(!b.has_subscriptions());
    }

    #[test]
    fn aggregates_nine_co_cells() {
        let base = ValueCell::new(0);
        let cells: Vec<ValueCell<i32>> = (1..=9).map(ValueCell::new).collect();
        let sum = base.aggregate(
            (
                cells[0].clone(),
                cells[1].clone(),
                cells[2].clone(),
                cells[3].clone(),
                cells[4].clone(),
                cells[5].clone(),
                cells[6].clone(),
                cells[7].clone(),
                cells[8].clone(),
            ),
            |base, (a, b, c, d, e, f, g, h, i)| base + a + b + c + d + e + f + g + h + i,
        );

        assert_eq!(sum.value(), Some(45));
        cells[8].update(100).unwrap();
        assert_eq!(sum.value(), Some(136));
    }

    #[test]
    fn mixed_types_recombine_fully() {
        let name = ValueCell::new("total".to_string());
        let count = ValueCell::new(3usize);
        let unit = ValueCell::new('x');
        let label = name.aggregate((count.clone(), unit.clone()), |name, (count, unit)| {
            format!("{name}: {count}{unit}")
        });

        assert_eq!(label.value().as_deref(), Some("total: 3x"));
        unit.update('y').unwrap();
        assert_eq!(label.value().as_deref(), Some("total: 3y"));
    }

    #[test]
    fn waits_until_every_participant_is_primed() {
        let a = ValueCell::new(1);
        let b: ValueCell<i32> = ValueCell::unprimed();
        let sum = a.aggregate((b.clone(),), |a, (b,)| a + b);

        assert!(!sum.is_primed());
        b.update(2).unwrap();
        assert_eq!(sum.value(), Some(3));
    }

    #[test]
    fn every_fire_emits_a_fresh_combination() {
        let a = ValueCell::new(1);
        let b = ValueCell::new(1);
        let sum = a.aggregate((b.clone(),), |a, (b,)| a + b);
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            sum.listen(move |v: &i32| seen.borrow_mut().push(*v));
        }

        a.update(1).unwrap();
        b.update(5).unwrap();
        assert_eq!(*seen.borrow(), vec![2, 6]);
    }

    #[test]
    fn combinator_errors_reach_error_channel() {
        let a = ValueCell::new(1);
        let b = ValueCell::new(1);
        let ratio = a
            .try_aggregate((b.clone(),), |a, (b,)| {
                if b == 0 {
                    Err(CellError::failed("division by zero"))
                } else {
                    Ok(a / b)
                }
            })
            .unwrap();

        let errors = Rc::new(RefCell::new(Vec::new()));
        {
            let errors = errors.clone();
            ratio.on_error(move |e: &CellError| errors.borrow_mut().push(e.to_string()));
        }

        b.update(0).unwrap();
        assert_eq!(*errors.borrow(), vec!["division by zero".to_string()]);
        assert_eq!(ratio.value(), Some(1));
    }

    #[test]
    fn unhandled_combinator_error_surfaces_at_the_trigger() {
        let a = ValueCell::new(1);
        let b = ValueCell::new(1);
        let _checked = a
            .try_aggregate((b.clone(),), |_, (b,)| {
                if b < 0 {
                    Err(CellError::failed("negative"))
                } else {
                    Ok(b)
                }
            })
            .unwrap();

        assert_eq!(b.update(-1), Err(CellError::failed("negative")));
    }
}
