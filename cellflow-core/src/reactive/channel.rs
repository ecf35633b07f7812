//! Event Channel
//!
//! The multi-subscriber notification primitive every cell is built on.
//!
//! # Firing Semantics
//!
//! A fire takes a snapshot of the subscriber list before calling anyone.
//! Subscribing or unsubscribing from inside a callback therefore only affects
//! later fires: a callback removed mid-fire still runs in the current pass and
//! a callback added mid-fire does not.
//!
//! A failing subscriber does not stop the pass. Its error is logged, the
//! remaining subscribers run, and the first error is returned once the pass is
//! complete.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{error, trace, warn};

use super::cancellation::CancellationToken;
use super::subscriber::{ListenerOutput, SubscriberId, Subscription, SubscriptionState};
use crate::config::Diagnostics;
use crate::error::CellResult;

pub(crate) type Listener<T> = Rc<dyn Fn(&T) -> CellResult<()>>;

struct Entry<T> {
    id: SubscriberId,
    once: bool,
    state: Rc<SubscriptionState>,
    callback: Listener<T>,
}

struct ChannelInner<T> {
    entries: RefCell<Vec<Entry<T>>>,
    diagnostics: Rc<Diagnostics>,
    leak_warned: Cell<bool>,
}

/// A re-entrancy safe publish/subscribe channel.
///
/// Clones refer to the same channel.
pub struct EventChannel<T: 'static> {
    inner: Rc<ChannelInner<T>>,
}

impl<T: 'static> EventChannel<T> {
    /// Create an empty channel with default diagnostics.
    pub fn new() -> Self {
        Self::with_diagnostics(Rc::new(Diagnostics::default()))
    }

    /// Create an empty channel reporting leaks against `diagnostics`.
    pub fn with_diagnostics(diagnostics: Rc<Diagnostics>) -> Self {
        Self {
            inner: Rc::new(ChannelInner {
                entries: RefCell::new(Vec::new()),
                diagnostics,
                leak_warned: Cell::new(false),
            }),
        }
    }

    /// The diagnostics this channel reports against.
    pub fn diagnostics(&self) -> Rc<Diagnostics> {
        self.inner.diagnostics.clone()
    }

    /// Register a persistent callback.
    pub fn subscribe<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.attach(Rc::new(move |data: &T| callback(data).into_result()), false)
    }

    /// Register a persistent callback removed when `token` cancels.
    pub fn subscribe_until<F, R>(&self, callback: F, token: &CancellationToken) -> CellResult<Subscription>
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.subscribe(callback).until(token)
    }

    /// Register a callback that runs on the next fire only.
    pub fn subscribe_once<F, R>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.attach(Rc::new(move |data: &T| callback(data).into_result()), true)
    }

    /// Register a one-shot callback removed when `token` cancels.
    pub fn subscribe_once_until<F, R>(&self, callback: F, token: &CancellationToken) -> CellResult<Subscription>
    where
        F: Fn(&T) -> R + 'static,
        R: ListenerOutput,
    {
        self.subscribe_once(callback).until(token)
    }

    pub(crate) fn attach(&self, callback: Listener<T>, once: bool) -> Subscription {
        let id = SubscriberId::new();
        let state = SubscriptionState::new(true);

        let count = {
            let mut entries = self.inner.entries.borrow_mut();
            entries.push(Entry {
                id,
                once,
                state: state.clone(),
                callback,
            });
            entries.len()
        };

        if let Some(threshold) = self.inner.diagnostics.subscriber_leak_threshold {
            if count > threshold && !self.inner.leak_warned.replace(true) {
                warn!(
                    subscribers = count,
                    threshold, "event channel exceeded its subscriber threshold, possible subscription leak"
                );
            }
        }

        let channel = Rc::downgrade(&self.inner);
        Subscription::new(
            id,
            state,
            Rc::new(move |id| {
                if let Some(channel) = channel.upgrade() {
                    channel.entries.borrow_mut().retain(|entry| entry.id != id);
                }
            }),
        )
    }

    /// Notify every current subscriber.
    ///
    /// Returns the first subscriber error after all subscribers have run.
    pub fn fire(&self, data: &T) -> CellResult<()> {
        let snapshot: SmallVec<[Listener<T>; 8]> = {
            let mut entries = self.inner.entries.borrow_mut();
            let snapshot = entries.iter().map(|entry| entry.callback.clone()).collect();
            entries.retain(|entry| {
                if entry.once {
                    entry.state.retire();
                }
                !entry.once
            });
            snapshot
        };

        trace!(subscribers = snapshot.len(), "firing event channel");

        let mut first_error = None;
        for callback in snapshot {
            if let Err(e) = callback(data) {
                error!(error = %e, "subscriber failed while handling an event");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every subscriber.
    pub fn cancel_all(&self) {
        let entries = std::mem::take(&mut *self.inner.entries.borrow_mut());
        for entry in entries {
            entry.state.retire();
        }
    }

    /// Whether anyone is listening.
    pub fn has_subscriptions(&self) -> bool {
        !self.inner.entries.borrow().is_empty()
    }

    /// Number of registered subscribers, one-shot ones included.
    pub fn subscriber_count(&self) -> usize {
        self.inner.entries.borrow().len()
    }
}

impl<T: 'static> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> std::fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
