//! Cancellation Tokens
//!
//! A [`CancellationToken`] bounds the lifetime of subscriptions. Anything that
//! registers a callback can hand over a token; cancelling the token runs every
//! registered teardown in registration order and then forgets them.
//!
//! Tokens compose:
//!
//! - [`CancellationToken::or`] cancels as soon as any input cancels.
//! - [`CancellationToken::and`] cancels once every input has cancelled.
//! - [`CancellationToken::chain`] links two tokens, optionally both ways.
//!
//! Cancellation is irreversible. Registering on a cancelled token fails with
//! [`CellError::AlreadyCancelled`] instead of silently leaking the callback.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::config::Diagnostics;
use crate::error::{CellError, CellResult};

/// Identifier of a teardown registered on a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancellableId(u64);

type Teardown = Box<dyn FnOnce()>;

struct TokenInner {
    cancelled: Cell<bool>,
    next_id: Cell<u64>,
    cancellables: RefCell<Vec<(CancellableId, Teardown)>>,
    diagnostics: Rc<Diagnostics>,
    leak_warned: Cell<bool>,
}

/// A composable, shared lifetime.
///
/// Clones refer to the same token.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Rc<TokenInner>,
}

impl CancellationToken {
    /// Create a live token with default diagnostics.
    pub fn new() -> Self {
        Self::with_diagnostics(Rc::new(Diagnostics::default()))
    }

    /// Create a live token reporting leaks against `diagnostics`.
    pub fn with_diagnostics(diagnostics: Rc<Diagnostics>) -> Self {
        Self {
            inner: Rc::new(TokenInner {
                cancelled: Cell::new(false),
                next_id: Cell::new(0),
                cancellables: RefCell::new(Vec::new()),
                diagnostics,
                leak_warned: Cell::new(false),
            }),
        }
    }

    fn downgrade(&self) -> Weak<TokenInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn weak(&self) -> WeakCancellationToken {
        WeakCancellationToken { inner: self.downgrade() }
    }

    fn from_inner(inner: Rc<TokenInner>) -> Self {
        Self { inner }
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Number of teardowns currently registered.
    pub fn len(&self) -> usize {
        self.inner.cancellables.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a teardown to run on cancellation.
    pub fn add_cancellable<F>(&self, teardown: F) -> CellResult<CancellableId>
    where
        F: FnOnce() + 'static,
    {
        if self.is_cancelled() {
            return Err(CellError::AlreadyCancelled);
        }

        let id = CancellableId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);

        let count = {
            let mut cancellables = self.inner.cancellables.borrow_mut();
            cancellables.push((id, Box::new(teardown)));
            cancellables.len()
        };

        if let Some(threshold) = self.inner.diagnostics.cancellable_leak_threshold {
            if count > threshold && !self.inner.leak_warned.replace(true) {
                warn!(
                    cancellables = count,
                    threshold, "cancellation token exceeded its cancellable threshold, possible subscription leak"
                );
            }
        }

        Ok(id)
    }

    /// Cancel `other` whenever this token is cancelled.
    pub fn add_token(&self, other: &CancellationToken) -> CellResult<CancellableId> {
        let other = other.clone();
        self.add_cancellable(move || other.cancel())
    }

    /// Remove a teardown without running it.
    pub fn remove_cancellable(&self, id: CancellableId) -> bool {
        let mut cancellables = self.inner.cancellables.borrow_mut();
        let before = cancellables.len();
        cancellables.retain(|(cid, _)| *cid != id);
        cancellables.len() != before
    }

    /// Cancel the token, running every teardown once.
    ///
    /// Cancelling an already cancelled token does nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.replace(true) {
            return;
        }

        let cancellables = std::mem::take(&mut *self.inner.cancellables.borrow_mut());
        debug!(teardowns = cancellables.len(), "cancelling token");

        for (_, teardown) in cancellables {
            teardown();
        }
    }

    /// A token that cancels as soon as any of `tokens` cancels.
    pub fn or(tokens: &[&CancellationToken]) -> CancellationToken {
        let result = CancellationToken::new();

        for token in tokens {
            if token.is_cancelled() {
                result.cancel();
                break;
            }
            let target = result.downgrade();
            // Registration only fails on a cancelled token, which was checked above.
            let _ = token.add_cancellable(move || {
                if let Some(inner) = target.upgrade() {
                    CancellationToken::from_inner(inner).cancel();
                }
            });
        }

        result
    }

    /// A token that cancels once every one of `tokens` has cancelled.
    pub fn and(tokens: &[&CancellationToken]) -> CancellationToken {
        let result = CancellationToken::new();
        let remaining = Rc::new(Cell::new(tokens.len()));

        for token in tokens {
            if token.is_cancelled() {
                remaining.set(remaining.get() - 1);
                continue;
            }
            let target = result.downgrade();
            let remaining = remaining.clone();
            let _ = token.add_cancellable(move || {
                remaining.set(remaining.get().saturating_sub(1));
                if remaining.get() == 0 {
                    if let Some(inner) = target.upgrade() {
                        CancellationToken::from_inner(inner).cancel();
                    }
                }
            });
        }

        if remaining.get() == 0 {
            result.cancel();
        }

        result
    }

    /// Cancel `other` when this token cancels, and with `two_way` the reverse
    /// as well.
    ///
    /// The reverse link holds this token weakly so the pair does not keep
    /// itself alive.
    pub fn chain(&self, other: &CancellationToken, two_way: bool) {
        if self.is_cancelled() {
            other.cancel();
        } else {
            let _ = self.add_token(other);
        }

        if two_way {
            if other.is_cancelled() {
                self.cancel();
            } else {
                let back = self.downgrade();
                let _ = other.add_cancellable(move || {
                    if let Some(inner) = back.upgrade() {
                        CancellationToken::from_inner(inner).cancel();
                    }
                });
            }
        }
    }
}

/// A token reference that does not keep the token alive.
#[derive(Clone)]
pub(crate) struct WeakCancellationToken {
    inner: Weak<TokenInner>,
}

impl WeakCancellationToken {
    pub(crate) fn upgrade(&self) -> Option<CancellationToken> {
        self.inner.upgrade().map(CancellationToken::from_inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("cancellables", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() -> Box<dyn FnOnce()>) {
        let count = Rc::new(Cell::new(0));
        let handle = count.clone();
        (count, move || {
            let handle = handle.clone();
            Box::new(move || handle.set(handle.get() + 1))
        })
    }

    #[test]
    fn cancel_runs_teardowns_once() {
        let (count, make) = counter();
        let token = CancellationToken::new();
        token.add_cancellable(make()).unwrap();
        token.add_cancellable(make()).unwrap();

        token.cancel();
        assert_eq!(count.get(), 2);
        assert!(token.is_cancelled());
        assert!(token.is_empty());

        token.cancel();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn adding_after_cancel_fails() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(token.add_cancellable(|| {}), Err(CellError::AlreadyCancelled));
    }

    #[test]
    fn removed_cancellable_does_not_run() {
        let (count, make) = counter();
        let token = CancellationToken::new();
        let id = token.add_cancellable(make()).unwrap();

        assert!(token.remove_cancellable(id));
        assert!(!token.remove_cancellable(id));
        token.cancel();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn teardowns_run_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let token = CancellationToken::new();
        for i in 0..3 {
            let order = order.clone();
            token.add_cancellable(move || order.borrow_mut().push(i)).unwrap();
        }

        token.cancel();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn or_cancels_on_any() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let either = CancellationToken::or(&[&a, &b]);

        assert!(!either.is_cancelled());
        b.cancel();
        assert!(either.is_cancelled());
    }

    #[test]
    fn or_with_cancelled_input_starts_cancelled() {
        let a = CancellationToken::new();
        a.cancel();
        assert!(CancellationToken::or(&[&a]).is_cancelled());
    }

    #[test]
    fn and_waits_for_all() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let both = CancellationToken::and(&[&a, &b]);

        a.cancel();
        assert!(!both.is_cancelled());
        b.cancel();
        assert!(both.is_cancelled());
    }

    #[test]
    fn chain_one_way() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        a.chain(&b, false);

        b.cancel();
        assert!(!a.is_cancelled());

        let c = CancellationToken::new();
        a.chain(&c, false);
        a.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn chain_two_way() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        a.chain(&b, true);

        b.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    #[traced_test]
    fn warns_once_past_threshold() {
        let diagnostics = Rc::new(Diagnostics {
            cancellable_leak_threshold: Some(2),
            ..Diagnostics::default()
        });
        let token = CancellationToken::with_diagnostics(diagnostics);
        for _ in 0..4 {
            token.add_cancellable(|| {}).unwrap();
        }

        assert!(logs_contain("possible subscription leak"));
    }
}
