//! # Request tokens
//!
//! A [`Token`] is the caller-side handle for one in-flight request. The
//! transport keeps the completion callback in its pending table keyed by
//! [`TokenId`] and retires the entry exactly once, right after invoking the
//! callback. Callers never own the pending entry, so there is no question of
//! who frees it.
//!
//! Blocking callers pass a [`ResponseSlot`] into their completion closure and
//! wait on it. If the wait times out the slot is simply dropped by the
//! waiter; the transport's eventual completion writes into the surviving
//! clone and nobody reads it.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::types::{RequestKind, RilErrno, RilResponse};

/// Correlation id, unique for the lifetime of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    id: TokenId,
    kind: RequestKind,
}

impl Token {
    pub(crate) fn new(id: TokenId, kind: RequestKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }
}

/// What the transport hands to a completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    pub error: RilErrno,
    pub response: RilResponse,
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

// ─── ResponseSlot ────────────────────────────────────────────────────────────

/// One-shot rendezvous between a completion callback and a blocked caller.
pub struct ResponseSlot<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for ResponseSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for ResponseSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// Store the value and wake the waiter. Later fills are ignored.
    pub fn fill(&self, value: T) {
        let (lock, cond) = &*self.inner;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(value);
            cond.notify_all();
        }
    }

    /// Wait until filled or `timeout` elapses. A value written before the
    /// wait started (synchronous completion) is returned immediately.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.inner;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}
