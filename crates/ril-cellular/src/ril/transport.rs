//! # Radio transport
//!
//! Owns the single channel to the radio interface library. Requests go out
//! through [`RadioTransport::send`], each under a fresh [`TokenId`]; the
//! library reports back through the [`RilEnv`] it was handed at
//! registration.
//!
//! ```text
//!  caller ──send──► pending[id] = callback ──on_request──► library
//!                                                            │
//!  caller ◄──callback(Completion)── pending.remove(id) ◄─────┘ on_request_complete
//! ```
//!
//! The pending entry is inserted before the request is forwarded, so a
//! library that answers inline (loopback, simulators) finds it. The entry is
//! removed before the callback runs and the lock is never held across a
//! callback or a library call. A completion whose id is no longer pending
//! (already cancelled, or bogus) is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::token::{Completion, CompletionFn, ResponseSlot, Token, TokenId};
use super::types::{RadioState, RilErrno, RilRequest, RilResponse, Unsolicited};
use crate::error::{CellularError, Result};

// ─── Library boundary ────────────────────────────────────────────────────────

/// Callbacks the radio interface library uses to report back.
pub trait RilEnv: Send + Sync {
    fn on_request_complete(&self, token: TokenId, error: RilErrno, response: RilResponse);
    fn on_unsolicited_response(&self, response: Unsolicited);
}

/// The radio interface library as seen from this crate.
///
/// Implementations may complete a request synchronously from inside
/// [`on_request`](RadioInterface::on_request).
pub trait RadioInterface: Send + Sync {
    /// Hand the library its environment. Returns `false` when the library
    /// refuses to register.
    fn init(&self, env: Arc<dyn RilEnv>) -> bool;

    fn on_request(&self, token: TokenId, request: RilRequest);

    fn on_state_request(&self) -> RadioState;

    /// Best-effort cancellation; the library may ignore it.
    fn on_cancel(&self, token: TokenId);

    fn version(&self) -> Option<String>;

    /// Hardware power control, when the library has any.
    fn set_module_power(&self, _on: bool) -> RilErrno {
        RilErrno::RequestNotSupported
    }
}

/// Request/response capability the upper layers depend on.
pub trait Transport: Send + Sync {
    /// Forward a request. `Err(DeviceError)` means no token was created and
    /// the completion will never run.
    fn send(&self, request: RilRequest, completion: CompletionFn) -> Result<Token>;

    /// Always yields exactly one completion for a still-pending token.
    fn cancel(&self, token: Token);

    fn radio_state(&self) -> RadioState;
}

pub type UnsolicitedHandler = Arc<dyn Fn(&Unsolicited) + Send + Sync>;

struct PendingRequest {
    token: Token,
    callback: CompletionFn,
    issued_at: Instant,
}

struct TransportShared {
    next_id: AtomicU64,
    registered: AtomicBool,
    pending: Mutex<HashMap<TokenId, PendingRequest>>,
    unsolicited: Mutex<Option<UnsolicitedHandler>>,
}

impl TransportShared {
    fn take_pending(&self, id: TokenId) -> Option<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

impl RilEnv for TransportShared {
    fn on_request_complete(&self, token: TokenId, error: RilErrno, response: RilResponse) {
        let Some(pending) = self.take_pending(token) else {
            debug!(token = token.0, ?error, "discarding completion for retired token");
            return;
        };
        trace!(
            token = token.0,
            request = ?pending.token.kind(),
            ?error,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "request complete"
        );
        (pending.callback)(Completion {
            token: pending.token,
            error,
            response,
        });
    }

    fn on_unsolicited_response(&self, response: Unsolicited) {
        let handler = self
            .unsolicited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(&response),
            None => debug!(?response, "unsolicited response with no subscriber"),
        }
    }
}

// ─── RadioTransport ──────────────────────────────────────────────────────────

pub struct RadioTransport {
    radio: Arc<dyn RadioInterface>,
    shared: Arc<TransportShared>,
}

impl RadioTransport {
    pub fn new(radio: Arc<dyn RadioInterface>) -> Self {
        Self {
            radio,
            shared: Arc::new(TransportShared {
                next_id: AtomicU64::new(1),
                registered: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                unsolicited: Mutex::new(None),
            }),
        }
    }

    /// Register with the radio interface library. Idempotent.
    pub fn init_ril(&self) -> Result<()> {
        if self.shared.registered.load(Ordering::Acquire) {
            return Ok(());
        }
        let env: Arc<dyn RilEnv> = self.shared.clone();
        if !self.radio.init(env) {
            warn!("radio interface library refused registration");
            return Err(CellularError::DeviceError);
        }
        self.shared.registered.store(true, Ordering::Release);
        debug!(version = ?self.radio.version(), "radio interface library registered");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Acquire)
    }

    pub fn set_unsolicited_handler(&self, handler: Option<UnsolicitedHandler>) {
        *self
            .shared
            .unsolicited
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn version(&self) -> Option<String> {
        if !self.is_registered() {
            return None;
        }
        self.radio.version()
    }

    pub fn hard_power(&self, on: bool) -> Result<()> {
        self.radio.set_module_power(on).into_result()
    }

    /// Requests issued and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_pending(&self, token: Token) -> bool {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&token.id())
    }
}

impl Transport for RadioTransport {
    fn send(&self, request: RilRequest, completion: CompletionFn) -> Result<Token> {
        if !self.is_registered() {
            warn!(request = ?request.kind(), "send refused: radio interface not registered");
            return Err(CellularError::DeviceError);
        }
        let state = self.radio.on_state_request();
        if !state.is_available() {
            warn!(request = ?request.kind(), ?state, "send refused: radio unavailable");
            return Err(CellularError::DeviceError);
        }

        let id = TokenId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let token = Token::new(id, request.kind());
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingRequest {
                    token,
                    callback: completion,
                    issued_at: Instant::now(),
                },
            );

        debug!(token = id.0, request = ?token.kind(), "dispatching request");
        self.radio.on_request(id, request);
        Ok(token)
    }

    fn cancel(&self, token: Token) {
        if !self.is_pending(token) {
            return;
        }
        self.radio.on_cancel(token.id());
        // The library may have answered inline; only synthesize when it did not.
        if let Some(pending) = self.shared.take_pending(token.id()) {
            debug!(token = token.id().0, "synthesizing cancelled completion");
            (pending.callback)(Completion {
                token: pending.token,
                error: RilErrno::Cancelled,
                response: RilResponse::Empty,
            });
        }
    }

    fn radio_state(&self) -> RadioState {
        if !self.is_registered() {
            return RadioState::Unavailable;
        }
        self.radio.on_state_request()
    }
}

// ─── Blocking helper ─────────────────────────────────────────────────────────

/// Send `request` and block until its completion is decoded or `timeout`
/// elapses.
///
/// On timeout the waiter walks away; the transport still owns the pending
/// entry and retires it when the library finally answers.
pub fn send_and_wait<T, F>(
    transport: &dyn Transport,
    request: RilRequest,
    timeout: Duration,
    decode: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(RilErrno, RilResponse) -> Result<T> + Send + 'static,
{
    let slot = ResponseSlot::new();
    let writer = slot.clone();
    let token = transport.send(
        request,
        Box::new(move |completion: Completion| {
            writer.fill(decode(completion.error, completion.response));
        }),
    )?;
    match slot.wait(timeout) {
        Some(result) => result,
        None => {
            warn!(
                token = token.id().0,
                request = ?token.kind(),
                timeout_ms = timeout.as_millis() as u64,
                "request timed out"
            );
            Err(CellularError::Timeout)
        }
    }
}
