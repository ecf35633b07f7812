//! Subscriber types for the reactive system.
//!
//! Every callback registered on an [`EventChannel`](super::EventChannel) gets a
//! [`SubscriberId`] and is handed back to the caller as a [`Subscription`]
//! handle that can remove it again, either directly or by binding it to a
//! [`CancellationToken`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::cancellation::{CancellableId, CancellationToken, WeakCancellationToken};
use crate::error::CellResult;

/// Unique identifier for a subscriber.
///
/// Each registered callback gets a unique ID when it subscribes. The ID is
/// what a [`Subscription`] uses to find its entry again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Values a subscriber callback may return.
///
/// Plain callbacks return `()`. Callbacks that forward into other cells
/// return the forwarded `CellResult<()>` so failures reach the code that
/// triggered the update.
pub trait ListenerOutput {
    /// Normalize into a result.
    fn into_result(self) -> CellResult<()>;
}

impl ListenerOutput for () {
    fn into_result(self) -> CellResult<()> {
        Ok(())
    }
}

impl ListenerOutput for CellResult<()> {
    fn into_result(self) -> CellResult<()> {
        self
    }
}

/// Liveness of one registered callback, shared by the channel entry and
/// every handle to it.
pub(crate) struct SubscriptionState {
    active: Cell<bool>,
    bindings: RefCell<SmallVec<[(WeakCancellationToken, CancellableId); 1]>>,
}

impl SubscriptionState {
    pub(crate) fn new(active: bool) -> Rc<Self> {
        Rc::new(Self {
            active: Cell::new(active),
            bindings: RefCell::new(SmallVec::new()),
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Mark the callback as gone and drop its teardowns from every token it
    /// was bound to. Returns whether it was still active.
    pub(crate) fn retire(&self) -> bool {
        let was_active = self.active.replace(false);
        let bindings = std::mem::take(&mut *self.bindings.borrow_mut());
        for (token, id) in bindings {
            if let Some(token) = token.upgrade() {
                token.remove_cancellable(id);
            }
        }
        was_active
    }

    fn bind(&self, token: &CancellationToken, id: CancellableId) {
        self.bindings.borrow_mut().push((token.weak(), id));
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle does not unsubscribe; subscriptions live until they
/// are cancelled, their token is cancelled, or the owning cell calls
/// `cancel_all`.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriberId,
    state: Rc<SubscriptionState>,
    detach: Rc<dyn Fn(SubscriberId)>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, state: Rc<SubscriptionState>, detach: Rc<dyn Fn(SubscriberId)>) -> Self {
        Self { id, state, detach }
    }

    /// A handle that is not attached to anything. Used where an operation
    /// completed synchronously and there is nothing left to remove.
    pub fn detached() -> Self {
        Self {
            id: SubscriberId::new(),
            state: SubscriptionState::new(false),
            detach: Rc::new(|_| {}),
        }
    }

    /// Get the subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Remove the callback. Calling this more than once is harmless.
    ///
    /// Tokens the subscription was bound to forget it as well.
    pub fn cancel(&self) {
        if self.state.retire() {
            (self.detach)(self.id);
        }
    }

    /// Tie the subscription's lifetime to `token`.
    ///
    /// Fails, and removes the subscription, when the token is already
    /// cancelled. A subscription that ends first unregisters itself from
    /// the token.
    pub fn until(self, token: &CancellationToken) -> CellResult<Self> {
        if !self.is_active() {
            return Ok(self);
        }
        let handle = self.clone();
        match token.add_cancellable(move || handle.cancel()) {
            Ok(id) => {
                self.state.bind(token, id);
                Ok(self)
            }
            Err(e) => {
                self.cancel();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A group of subscriptions cancelled together.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    subscriptions: SmallVec<[Subscription; 4]>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Cancel every subscription in the set and empty it.
    pub fn cancel(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;

    fn counting_subscription(detached: Rc<Cell<u32>>) -> Subscription {
        Subscription::new(
            SubscriberId::new(),
            SubscriptionState::new(true),
            Rc::new(move |_| detached.set(detached.get() + 1)),
        )
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn cancel_detaches_once() {
        let detached = Rc::new(Cell::new(0));
        let subscription = counting_subscription(detached.clone());

        assert!(subscription.is_active());
        subscription.cancel();
        subscription.cancel();

        assert!(!subscription.is_active());
        assert_eq!(detached.get(), 1);
    }

    #[test]
    fn until_cancelled_token_fails_and_detaches() {
        let detached = Rc::new(Cell::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let result = counting_subscription(detached.clone()).until(&token);

        assert_eq!(result.unwrap_err(), CellError::AlreadyCancelled);
        assert_eq!(detached.get(), 1);
    }

    #[test]
    fn until_token_cancels_with_token() {
        let detached = Rc::new(Cell::new(0));
        let token = CancellationToken::new();
        let subscription = counting_subscription(detached.clone()).until(&token).unwrap();

        token.cancel();

        assert!(!subscription.is_active());
        assert_eq!(detached.get(), 1);
    }

    #[test]
    fn cancelled_subscription_leaves_its_token() {
        let token = CancellationToken::new();
        for _ in 0..100 {
            let subscription = counting_subscription(Rc::new(Cell::new(0))).until(&token).unwrap();
            subscription.cancel();
        }

        assert!(token.is_empty());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn retired_state_unbinds_every_token() {
        let (first, second) = (CancellationToken::new(), CancellationToken::new());
        let subscription = counting_subscription(Rc::new(Cell::new(0)))
            .until(&first)
            .and_then(|s| s.until(&second))
            .unwrap();
        assert_eq!((first.len(), second.len()), (1, 1));

        subscription.state.retire();
        assert!(first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn set_cancels_everything() {
        let detached = Rc::new(Cell::new(0));
        let mut set = SubscriptionSet::new();
        set.push(counting_subscription(detached.clone()));
        set.push(counting_subscription(detached.clone()));

        set.cancel();

        assert!(set.is_empty());
        assert_eq!(detached.get(), 2);
    }
}
