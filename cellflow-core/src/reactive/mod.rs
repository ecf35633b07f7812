//! Reactive Primitives
//!
//! This module implements the push-based core: cancellation tokens, event
//! channels, value cells and duplex cells. Collections and keyed cells are
//! built on top of these in their own modules.
//!
//! # Concepts
//!
//! ## Event Channels
//!
//! An [`EventChannel`] is a list of callbacks. Firing it calls every callback
//! registered when the fire started, in registration order.
//!
//! ## Value Cells
//!
//! A [`ValueCell`] holds a current value and owns an update channel and an
//! error channel. Updates propagate synchronously: when `update` returns,
//! every derived cell has seen the new value.
//!
//! ## Cancellation
//!
//! Every listener registration yields a [`Subscription`]. Subscriptions can
//! be cancelled one by one or bound to a [`CancellationToken`] that tears
//! down a whole group at once.
//!
//! # Implementation Notes
//!
//! Everything here is single-threaded. Cells share state through `Rc` and
//! `RefCell` and are therefore `!Send`; asynchronous pipeline steps run on a
//! `tokio::task::LocalSet`.

mod aggregate;
mod cancellation;
mod cell;
mod channel;
mod duplex;
mod subscriber;

pub use aggregate::CellTuple;
pub use cancellation::{CancellableId, CancellationToken};
pub use cell::{UpdateState, ValueCell, WeakValueCell};
pub use channel::EventChannel;
pub use duplex::{diode, duplex_filter, duplex_map, Direction, DuplexCell, DuplexOperator, DuplexPipeline};
pub use subscriber::{ListenerOutput, SubscriberId, Subscription, SubscriptionSet};

pub(crate) use cell::{next_cell_id, UpdateGuard};
pub(crate) use channel::Listener;
