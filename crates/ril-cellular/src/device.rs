//! # Device manager
//!
//! Owns everything that is shared between connection contexts on one
//! radio: the transport, the device-ready and SIM-ready gates, the context
//! arena and the refcounted network/SMS/information singletons.
//!
//! ```text
//!   set_device_ready ──► RADIO_POWER(on) ─┐
//!                                         ├─► radio on ──► DeviceReady
//!   RADIO_STATE_CHANGED ──────────────────┘
//!
//!   set_sim_ready ──► GET_SIM_STATUS ──► Ready ───────────► SimStatusChanged(Ready)
//!                                   └─► PinNeeded ──► ENTER_SIM_PIN ──► GET_SIM_STATUS …
//! ```
//!
//! Locks here guard only the arena, the refcounts and small bits of state.
//! None is held across a transport call, because the radio may answer
//! inline and re-enter this type from the completion.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use slab::Slab;
use tracing::{debug, info, warn};

use crate::config::{CellularConfig, Credentials, DispatcherMode};
use crate::context::{CellularContext, ContextId, ContextParts, Operation};
use crate::error::{CellularError, Result};
use crate::event::{CellularEvent, Deadlines, EventDispatcher, EventQueue, StatusCallback};
use crate::gate::{wait_with_retries, Gate, GateEntry, GateMode};
use crate::information::CellularInformation;
use crate::network::{CellularNetwork, RegistrationSource};
use crate::ril::{
    send_and_wait, AppState, CardState, RadioState, RadioTransport, RilErrno, RilRequest,
    RilResponse, Transport, Unsolicited,
};
use crate::sms::CellularSms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SimState {
    #[default]
    Unknown,
    PinNeeded,
    Ready,
}

/// Capabilities a caller may ask the device about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellularProperty {
    /// EPS registration reporting.
    CEreg,
    /// Circuit-switched registration reporting.
    CReg,
}

/// Device and SIM preconditions a context waits on before registering.
pub trait ReadinessGate: Send + Sync {
    fn set_device_ready(&self, mode: GateMode) -> Result<()>;
    fn set_sim_ready(&self, mode: GateMode) -> Result<()>;
    fn set_sim_pin(&self, pin: Option<&str>);
    /// Give up a pending device or SIM attempt; blocked callers see `error`.
    fn abandon(&self, stage: Operation, error: CellularError);
}

// ─── Singletons ──────────────────────────────────────────────────────────────

struct RefCounted<T> {
    instance: Option<Arc<T>>,
    refs: usize,
}

impl<T> RefCounted<T> {
    const fn empty() -> Self {
        Self {
            instance: None,
            refs: 0,
        }
    }

    fn open(&mut self, make: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let instance = self.instance.get_or_insert_with(make).clone();
        self.refs += 1;
        instance
    }

    /// Returns `true` when this close destroyed the instance.
    fn close(&mut self) -> bool {
        match self.refs {
            0 => false,
            1 => {
                self.refs = 0;
                self.instance = None;
                true
            }
            _ => {
                self.refs -= 1;
                false
            }
        }
    }
}

struct Singletons {
    network: RefCounted<CellularNetwork>,
    sms: RefCounted<CellularSms>,
    information: RefCounted<CellularInformation>,
}

struct DeviceState {
    sim_state: SimState,
    sim_pin: Option<String>,
    pin_attempted: bool,
    retry_timeouts: Vec<Duration>,
}

// ─── CellularDevice ──────────────────────────────────────────────────────────

pub struct CellularDevice {
    me: Weak<CellularDevice>,
    transport: Arc<RadioTransport>,
    config: CellularConfig,
    queue: EventQueue,
    dispatcher: Mutex<Option<EventDispatcher>>,
    deadlines: Deadlines,
    timer: Mutex<Option<EventDispatcher>>,
    device_ready: Gate,
    sim_ready: Gate,
    state: Mutex<DeviceState>,
    contexts: Mutex<Slab<Arc<CellularContext>>>,
    singletons: Mutex<Singletons>,
    status_cb: Mutex<Option<StatusCallback>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CellularDevice {
    pub fn new(transport: Arc<RadioTransport>, config: CellularConfig) -> anyhow::Result<Arc<Self>> {
        let queue = EventQueue::new(config.event_queue.capacity);
        let dispatcher = match config.event_queue.dispatcher {
            DispatcherMode::Thread => Some(queue.spawn_dispatcher("cellular-events")?),
            DispatcherMode::Manual => None,
        };
        let (deadlines, timer) =
            queue.spawn_deadline_timer("cellular-deadlines", config.event_queue.capacity)?;
        let device = Arc::new_cyclic(|me| CellularDevice {
            me: me.clone(),
            transport: transport.clone(),
            queue,
            dispatcher: Mutex::new(dispatcher),
            deadlines,
            timer: Mutex::new(Some(timer)),
            device_ready: Gate::new("device-ready"),
            sim_ready: Gate::new("sim-ready"),
            state: Mutex::new(DeviceState {
                sim_state: SimState::Unknown,
                sim_pin: config.device.sim_pin.clone(),
                pin_attempted: false,
                retry_timeouts: config.device.retry_timeouts.clone(),
            }),
            contexts: Mutex::new(Slab::new()),
            singletons: Mutex::new(Singletons {
                network: RefCounted::empty(),
                sms: RefCounted::empty(),
                information: RefCounted::empty(),
            }),
            status_cb: Mutex::new(None),
            config,
        });

        let weak = Arc::downgrade(&device);
        transport.set_unsolicited_handler(Some(Arc::new(move |u: &Unsolicited| {
            if let Some(device) = weak.upgrade() {
                device.handle_unsolicited(u);
            }
        })));
        Ok(device)
    }

    pub fn transport(&self) -> &Arc<RadioTransport> {
        &self.transport
    }

    pub fn config(&self) -> &CellularConfig {
        &self.config
    }

    pub fn event_queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Run queued progression tasks on the calling thread.
    pub fn dispatch_events(&self) -> usize {
        self.queue.dispatch_pending()
    }

    /// Device-level callback receiving every broadcast event.
    pub fn attach(&self, callback: Option<StatusCallback>) {
        *lock(&self.status_cb) = callback;
    }

    pub fn version(&self) -> Option<String> {
        self.transport.version()
    }

    // ─── Power ───────────────────────────────────────────────────────────────

    pub fn init_ril(&self) -> Result<()> {
        self.transport.init_ril()
    }

    pub fn hard_power_on(&self) -> Result<()> {
        self.init_ril()?;
        unsupported_is_ok(self.transport.hard_power(true))
    }

    pub fn hard_power_off(&self) -> Result<()> {
        unsupported_is_ok(self.transport.hard_power(false))?;
        self.close_gates();
        Ok(())
    }

    pub fn soft_power_on(&self) -> Result<()> {
        self.lock_and_send_request(RilRequest::RadioPower { on: true }, |err, _| {
            err.into_result().map_err(|_| CellularError::DeviceError)
        })
    }

    pub fn soft_power_off(&self) -> Result<()> {
        self.lock_and_send_request(RilRequest::RadioPower { on: false }, |err, _| {
            err.into_result().map_err(|_| CellularError::DeviceError)
        })?;
        self.close_gates();
        Ok(())
    }

    pub fn is_ready(&self) -> Result<()> {
        if self.transport.radio_state().is_on() {
            Ok(())
        } else {
            Err(CellularError::DeviceError)
        }
    }

    pub fn set_power_save_mode(&self, _periodic_time: u32, _active_time: u32) -> Result<()> {
        Err(CellularError::Unsupported)
    }

    pub fn send_at_command(&self, _command: &str) -> Result<String> {
        Err(CellularError::Unsupported)
    }

    pub fn set_baud_rate(&self, _baud_rate: u32) -> Result<()> {
        Err(CellularError::Unsupported)
    }

    /// Only EPS registration is reported by the radio layer.
    pub fn get_property(&self, key: CellularProperty) -> i32 {
        match key {
            CellularProperty::CEreg => 1,
            CellularProperty::CReg => 0,
        }
    }

    fn close_gates(&self) {
        self.device_ready.reset();
        self.sim_ready.reset();
        let mut st = lock(&self.state);
        st.sim_state = SimState::Unknown;
        st.pin_attempted = false;
    }

    // ─── Requests ────────────────────────────────────────────────────────────

    /// Perform one transport request and block the caller until it is
    /// decoded or the device request timeout expires.
    pub fn lock_and_send_request<T, F>(&self, request: RilRequest, decode: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(RilErrno, RilResponse) -> Result<T> + Send + 'static,
    {
        send_and_wait(
            self.transport.as_ref(),
            request,
            self.config.device.request_timeout,
            decode,
        )
    }

    pub fn set_retry_timeout_array(&self, timeouts_s: &[u16]) {
        lock(&self.state).retry_timeouts = timeouts_s
            .iter()
            .map(|s| Duration::from_secs(u64::from(*s)))
            .collect();
    }

    pub fn retry_timeouts(&self) -> Vec<Duration> {
        lock(&self.state).retry_timeouts.clone()
    }

    pub fn set_pin(&self, pin: Option<&str>) {
        let mut st = lock(&self.state);
        st.sim_pin = pin.map(str::to_string);
        st.pin_attempted = false;
    }

    // ─── SIM ─────────────────────────────────────────────────────────────────

    /// Last SIM state observed, without asking the radio.
    pub fn sim_state(&self) -> SimState {
        lock(&self.state).sim_state
    }

    pub fn get_sim_state(&self) -> Result<SimState> {
        let transport = self.transport.clone();
        let result = self.lock_and_send_request(RilRequest::GetSimStatus, move |err, resp| {
            decode_sim_state(err, &resp, transport.radio_state())
        });
        if let Ok(state) = result {
            lock(&self.state).sim_state = state;
        }
        result
    }

    fn request_sim_status(&self) -> Result<()> {
        let weak = self.me.clone();
        self.transport
            .send(
                RilRequest::GetSimStatus,
                Box::new(move |c| {
                    if let Some(device) = weak.upgrade() {
                        let radio = device.transport.radio_state();
                        device.on_sim_status(decode_sim_state(c.error, &c.response, radio));
                    }
                }),
            )
            .map(|_| ())
    }

    fn on_sim_status(&self, result: Result<SimState>) {
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "SIM status query failed");
                if self.sim_ready.abandon(e) {
                    self.broadcast(&CellularEvent::OperationFailed {
                        operation: Operation::SimReady,
                        error: e,
                    });
                }
                return;
            }
        };

        let changed = {
            let mut st = lock(&self.state);
            let changed = st.sim_state != state;
            st.sim_state = state;
            changed
        };
        debug!(?state, changed, "SIM status");

        match state {
            SimState::Ready => {
                if self.sim_ready.open() {
                    info!("SIM ready");
                    self.broadcast(&CellularEvent::SimStatusChanged(SimState::Ready));
                }
            }
            SimState::PinNeeded | SimState::Unknown => {
                if self.sim_ready.is_open() {
                    self.sim_ready.reset();
                }
                if changed {
                    self.broadcast(&CellularEvent::SimStatusChanged(state));
                }
                if state == SimState::PinNeeded && self.sim_ready.is_pending() {
                    self.enter_pin();
                }
            }
        }
    }

    /// Submit the stored PIN once per attempt. Without one the attempt
    /// fails and the caller must resolve the PIN before retrying.
    fn enter_pin(&self) {
        let pin = {
            let mut st = lock(&self.state);
            if st.pin_attempted {
                // Already submitted; its completion settles the attempt.
                debug!("SIM PIN already submitted for this attempt");
                return;
            }
            st.pin_attempted = true;
            st.sim_pin.clone()
        };
        let Some(pin) = pin else {
            warn!("SIM needs a PIN and none is available");
            self.fail_sim_ready(CellularError::DeviceError);
            return;
        };

        let weak = self.me.clone();
        let sent = self.transport.send(
            RilRequest::EnterSimPin { pin },
            Box::new(move |c| {
                let Some(device) = weak.upgrade() else { return };
                if c.error.is_success() {
                    debug!("SIM PIN accepted");
                    if let Err(e) = device.request_sim_status() {
                        device.fail_sim_ready(e);
                    }
                } else {
                    warn!(error = ?c.error, "SIM PIN rejected");
                    device.fail_sim_ready(CellularError::DeviceError);
                }
            }),
        );
        if let Err(e) = sent {
            self.fail_sim_ready(e);
        }
    }

    fn fail_sim_ready(&self, error: CellularError) {
        if self.sim_ready.abandon(error) {
            self.broadcast(&CellularEvent::OperationFailed {
                operation: Operation::SimReady,
                error,
            });
        }
    }

    // ─── Device readiness ────────────────────────────────────────────────────

    fn request_radio_power(&self) -> Result<()> {
        let weak = self.me.clone();
        self.transport
            .send(
                RilRequest::RadioPower { on: true },
                Box::new(move |c| {
                    if let Some(device) = weak.upgrade() {
                        device.on_radio_power(c.error);
                    }
                }),
            )
            .map(|_| ())
    }

    fn on_radio_power(&self, error: RilErrno) {
        if !error.is_success() {
            warn!(?error, "radio power on failed");
            if self.device_ready.abandon(CellularError::DeviceError) {
                self.broadcast(&CellularEvent::OperationFailed {
                    operation: Operation::DeviceReady,
                    error: CellularError::DeviceError,
                });
            }
            return;
        }
        // Otherwise RADIO_STATE_CHANGED will follow.
        if self.transport.radio_state().is_on() {
            self.mark_device_ready();
        }
    }

    fn mark_device_ready(&self) {
        if self.device_ready.open() {
            info!(radio = ?self.transport.radio_state(), "device ready");
            self.broadcast(&CellularEvent::DeviceReady);
        }
    }

    pub fn is_device_ready(&self) -> bool {
        self.device_ready.is_open()
    }

    pub fn is_sim_ready(&self) -> bool {
        self.sim_ready.is_open()
    }

    fn claim(gate: &Gate, mode: GateMode) -> Option<Result<()>> {
        match gate.begin() {
            GateEntry::Start => None,
            GateEntry::Open => Some(Err(CellularError::Already)),
            GateEntry::InFlight => Some(match mode {
                GateMode::NonBlocking => Err(CellularError::Busy),
                GateMode::Blocking(timeout) => gate.wait_until(Instant::now() + timeout),
            }),
        }
    }

    // ─── Unsolicited ─────────────────────────────────────────────────────────

    fn handle_unsolicited(&self, u: &Unsolicited) {
        match u {
            Unsolicited::RadioStateChanged => {
                let state = self.transport.radio_state();
                debug!(?state, "radio state changed");
                if state.is_on() {
                    if self.device_ready.is_pending() {
                        self.mark_device_ready();
                    }
                } else if self.device_ready.is_open() {
                    warn!(?state, "radio went down");
                    self.close_gates();
                }
            }
            Unsolicited::SimStatusChanged => {
                if self.device_ready.is_open() {
                    if let Err(e) = self.request_sim_status() {
                        debug!(error = %e, "SIM status refresh not sent");
                    }
                }
            }
            Unsolicited::NetworkStateChanged | Unsolicited::SignalStrength(_) => {
                if let Some(network) = self.network_instance() {
                    network.handle_unsolicited(u);
                }
            }
            Unsolicited::DataCallListChanged(calls) => {
                let contexts = self.contexts();
                for ctx in &contexts {
                    let taken: Vec<i32> = contexts
                        .iter()
                        .filter(|other| other.id() != ctx.id())
                        .map(|other| other.cid())
                        .filter(|cid| *cid >= 0)
                        .collect();
                    ctx.handle_data_call_list(calls, &taken);
                }
            }
            Unsolicited::Other { id } => debug!(id, "ignoring unsolicited response"),
        }
    }

    pub(crate) fn broadcast(&self, event: &CellularEvent) {
        let contexts = self.contexts();
        for ctx in contexts {
            ctx.cellular_callback(event);
        }
        let cb = lock(&self.status_cb).clone();
        if let Some(cb) = cb {
            cb(event);
        }
    }

    // ─── Contexts ────────────────────────────────────────────────────────────

    pub fn create_context(&self, credentials: Option<Credentials>) -> Arc<CellularContext> {
        let network = self.open_network();
        let mut settings = self.config.context.clone();
        if let Some(credentials) = credentials {
            settings.credentials = credentials;
        }
        let gate: Weak<dyn ReadinessGate> = self.me.clone();
        let registration: Arc<dyn RegistrationSource> = network;
        let transport: Arc<dyn Transport> = self.transport.clone();

        let mut contexts = lock(&self.contexts);
        let entry = contexts.vacant_entry();
        let id = ContextId(entry.key());
        let ctx = CellularContext::new(
            id,
            ContextParts {
                gate,
                registration,
                transport,
                queue: self.queue.clone(),
                deadlines: self.deadlines.clone(),
                request_timeout: self.config.device.request_timeout,
            },
            settings,
        );
        entry.insert(ctx.clone());
        drop(contexts);

        info!(context = id.0, "context created");
        ctx
    }

    /// Remove `ctx` from the arena. Unknown or `None` contexts are ignored.
    pub fn delete_context(&self, ctx: Option<&Arc<CellularContext>>) {
        let Some(ctx) = ctx else { return };
        let removed = {
            let mut contexts = lock(&self.contexts);
            let key = ctx.id().0;
            match contexts.get(key) {
                Some(existing) if Arc::ptr_eq(existing, ctx) => Some(contexts.remove(key)),
                _ => None,
            }
        };
        let Some(removed) = removed else {
            debug!(context = ctx.id().0, "delete_context: not owned by this device");
            return;
        };
        removed.shutdown();
        self.close_network();
        info!(context = removed.id().0, "context deleted");
    }

    pub fn contexts(&self) -> Vec<Arc<CellularContext>> {
        lock(&self.contexts).iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn context_count(&self) -> usize {
        lock(&self.contexts).len()
    }

    // ─── Sub-interfaces ──────────────────────────────────────────────────────

    pub fn open_network(&self) -> Arc<CellularNetwork> {
        let mut s = lock(&self.singletons);
        s.network.open(|| {
            CellularNetwork::new(
                self.me.clone(),
                self.transport.clone(),
                self.config.device.request_timeout,
            )
        })
    }

    pub fn close_network(&self) {
        if lock(&self.singletons).network.close() {
            debug!("network interface destroyed");
        }
    }

    pub fn network_refs(&self) -> usize {
        lock(&self.singletons).network.refs
    }

    fn network_instance(&self) -> Option<Arc<CellularNetwork>> {
        lock(&self.singletons).network.instance.clone()
    }

    pub fn open_sms(&self) -> Arc<CellularSms> {
        let mut s = lock(&self.singletons);
        s.sms.open(|| {
            Arc::new(CellularSms::new(
                self.transport.clone(),
                self.config.device.request_timeout,
            ))
        })
    }

    pub fn close_sms(&self) {
        if lock(&self.singletons).sms.close() {
            debug!("sms interface destroyed");
        }
    }

    pub fn sms_refs(&self) -> usize {
        lock(&self.singletons).sms.refs
    }

    pub fn open_information(&self) -> Arc<CellularInformation> {
        let mut s = lock(&self.singletons);
        s.information.open(|| {
            Arc::new(CellularInformation::new(
                self.transport.clone(),
                self.config.device.request_timeout,
            ))
        })
    }

    pub fn close_information(&self) {
        if lock(&self.singletons).information.close() {
            debug!("information interface destroyed");
        }
    }

    pub fn information_refs(&self) -> usize {
        lock(&self.singletons).information.refs
    }
}

impl ReadinessGate for CellularDevice {
    fn set_device_ready(&self, mode: GateMode) -> Result<()> {
        if let Some(outcome) = Self::claim(&self.device_ready, mode) {
            return outcome;
        }
        if self.transport.radio_state().is_on() {
            self.mark_device_ready();
            return Ok(());
        }
        info!("powering radio on");
        if let Err(e) = self.request_radio_power() {
            self.device_ready.abandon(e);
            return Err(e);
        }
        match mode {
            GateMode::NonBlocking => Ok(()),
            GateMode::Blocking(timeout) => {
                let schedule = self.retry_timeouts();
                wait_with_retries(&self.device_ready, timeout, &schedule, || {
                    if self.transport.radio_state().is_on() {
                        self.mark_device_ready();
                    }
                })
            }
        }
    }

    fn set_sim_ready(&self, mode: GateMode) -> Result<()> {
        if !self.device_ready.is_open() {
            warn!("SIM readiness requested before device ready");
            return Err(CellularError::DeviceError);
        }
        if let Some(outcome) = Self::claim(&self.sim_ready, mode) {
            return outcome;
        }
        lock(&self.state).pin_attempted = false;
        if let Err(e) = self.request_sim_status() {
            self.sim_ready.abandon(e);
            return Err(e);
        }
        match mode {
            GateMode::NonBlocking => Ok(()),
            GateMode::Blocking(timeout) => {
                let schedule = self.retry_timeouts();
                wait_with_retries(&self.sim_ready, timeout, &schedule, || {
                    if let Err(e) = self.request_sim_status() {
                        debug!(error = %e, "SIM re-poll not sent");
                    }
                })
            }
        }
    }

    fn set_sim_pin(&self, pin: Option<&str>) {
        self.set_pin(pin);
    }

    fn abandon(&self, stage: Operation, error: CellularError) {
        let gate = match stage {
            Operation::DeviceReady => &self.device_ready,
            Operation::SimReady => &self.sim_ready,
            _ => return,
        };
        if gate.abandon(error) {
            debug!(gate = gate.name(), error = %error, "readiness attempt abandoned");
        }
    }
}

impl Drop for CellularDevice {
    fn drop(&mut self) {
        self.transport.set_unsolicited_handler(None);
        if let Some(mut dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.shutdown();
        }
        if let Some(mut timer) = lock(&self.timer).take() {
            timer.shutdown();
        }
    }
}

fn unsupported_is_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(CellularError::Unsupported) => Ok(()),
        other => other,
    }
}

/// Map a `GET_SIM_STATUS` answer plus the current radio state to a
/// [`SimState`].
pub(crate) fn decode_sim_state(
    error: RilErrno,
    response: &RilResponse,
    radio: RadioState,
) -> Result<SimState> {
    if !error.is_success() {
        return Err(CellularError::DeviceError);
    }
    let RilResponse::CardStatus(card) = response else {
        return Err(CellularError::DeviceError);
    };
    if card.card_state != CardState::Present {
        return Err(CellularError::DeviceError);
    }
    if matches!(radio, RadioState::Off | RadioState::Unavailable) {
        return Ok(SimState::Unknown);
    }
    if matches!(card.app_state, AppState::Pin | AppState::Puk) {
        return Ok(SimState::PinNeeded);
    }
    Ok(match radio {
        RadioState::SimReady | RadioState::RuimReady | RadioState::NvReady | RadioState::On => {
            SimState::Ready
        }
        RadioState::SimLockedOrAbsent | RadioState::RuimLockedOrAbsent => SimState::PinNeeded,
        _ => SimState::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ril::{CardStatus, RequestKind};
    use crate::test_util::{fake_device, manual_config, FakeRadio};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn present(app_state: AppState) -> RilResponse {
        RilResponse::CardStatus(CardStatus {
            card_state: CardState::Present,
            app_state,
        })
    }

    #[test]
    fn sim_state_mapping() {
        let ok = RilErrno::Success;
        let resp = present(AppState::Unknown);
        assert_eq!(decode_sim_state(ok, &resp, RadioState::SimReady), Ok(SimState::Ready));
        assert_eq!(decode_sim_state(ok, &resp, RadioState::On), Ok(SimState::Ready));
        assert_eq!(decode_sim_state(ok, &resp, RadioState::Off), Ok(SimState::Unknown));
        assert_eq!(
            decode_sim_state(ok, &resp, RadioState::RuimLockedOrAbsent),
            Ok(SimState::PinNeeded)
        );
        assert_eq!(
            decode_sim_state(ok, &resp, RadioState::from_raw(99)),
            Ok(SimState::Unknown)
        );
        assert_eq!(
            decode_sim_state(ok, &present(AppState::Puk), RadioState::On),
            Ok(SimState::PinNeeded)
        );
    }

    #[test]
    fn sim_state_errors() {
        let absent = RilResponse::CardStatus(CardStatus {
            card_state: CardState::Absent,
            app_state: AppState::Unknown,
        });
        assert_eq!(
            decode_sim_state(RilErrno::Success, &absent, RadioState::SimReady),
            Err(CellularError::DeviceError)
        );
        assert_eq!(
            decode_sim_state(RilErrno::Success, &RilResponse::Empty, RadioState::On),
            Err(CellularError::DeviceError)
        );
        assert_eq!(
            decode_sim_state(RilErrno::GenericFailure, &present(AppState::Ready), RadioState::On),
            Err(CellularError::DeviceError)
        );
    }

    #[test]
    fn get_sim_state_keeps_last_known_on_absent_card() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        radio.respond(RequestKind::GetSimStatus, RilErrno::Success, present(AppState::Ready));
        assert_eq!(device.get_sim_state(), Ok(SimState::Ready));

        radio.respond(
            RequestKind::GetSimStatus,
            RilErrno::Success,
            RilResponse::CardStatus(CardStatus {
                card_state: CardState::Absent,
                app_state: AppState::Unknown,
            }),
        );
        assert_eq!(device.get_sim_state(), Err(CellularError::DeviceError));
        assert_eq!(device.sim_state(), SimState::Ready);
    }

    #[test]
    fn hard_power_treats_unsupported_as_success() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        assert_eq!(device.hard_power_on(), Ok(()));
        assert_eq!(device.hard_power_off(), Ok(()));
    }

    #[test]
    fn hard_power_on_fails_when_library_refuses() {
        let radio = FakeRadio::new();
        radio.refuse_init(true);
        let transport = Arc::new(RadioTransport::new(radio.clone()));
        let device = CellularDevice::new(transport, manual_config()).unwrap();
        assert_eq!(device.hard_power_on(), Err(CellularError::DeviceError));
    }

    #[test]
    fn soft_power_maps_failures_to_device_error() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        assert_eq!(device.soft_power_on(), Ok(()));
        radio.respond(RequestKind::RadioPower, RilErrno::RequestNotSupported, RilResponse::Empty);
        assert_eq!(device.soft_power_off(), Err(CellularError::DeviceError));
        radio.set_radio_state(RadioState::Unavailable);
        assert_eq!(device.soft_power_on(), Err(CellularError::DeviceError));
    }

    #[test]
    fn is_ready_follows_radio_power() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        radio.set_radio_state(RadioState::Off);
        assert_eq!(device.is_ready(), Err(CellularError::DeviceError));
        radio.set_radio_state(RadioState::On);
        assert_eq!(device.is_ready(), Ok(()));
    }

    #[test]
    fn device_ready_gate_is_idempotent() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        device.attach(Some(Arc::new(move |e: &CellularEvent| {
            if *e == CellularEvent::DeviceReady {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })));

        radio.set_radio_state(RadioState::Off);
        let mode = GateMode::Blocking(Duration::from_secs(1));
        assert_eq!(device.set_device_ready(mode), Ok(()));
        assert_eq!(device.set_device_ready(mode), Err(CellularError::Already));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(radio.count_of(RequestKind::RadioPower), 1);
    }

    #[test]
    fn device_ready_non_blocking_reports_busy_while_outstanding() {
        let radio = FakeRadio::new();
        radio.set_radio_state(RadioState::Off);
        radio.hold_completions(true);
        let device = fake_device(&radio, manual_config());

        assert_eq!(device.set_device_ready(GateMode::NonBlocking), Ok(()));
        assert_eq!(
            device.set_device_ready(GateMode::NonBlocking),
            Err(CellularError::Busy)
        );
        radio.release_held();
        assert!(device.is_device_ready());
        assert_eq!(
            device.set_device_ready(GateMode::NonBlocking),
            Err(CellularError::Already)
        );
    }

    #[test]
    fn device_ready_times_out_when_radio_never_answers() {
        let radio = FakeRadio::new();
        radio.set_radio_state(RadioState::Off);
        radio.hold_completions(true);
        let device = fake_device(&radio, manual_config());
        device.set_retry_timeout_array(&[]);
        assert_eq!(
            device.set_device_ready(GateMode::Blocking(Duration::from_millis(30))),
            Err(CellularError::Timeout)
        );
        assert!(!device.is_device_ready());
    }

    #[test]
    fn device_ready_refused_send_is_device_error() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        radio.set_radio_state(RadioState::Unavailable);
        assert_eq!(
            device.set_device_ready(GateMode::Blocking(Duration::from_secs(1))),
            Err(CellularError::DeviceError)
        );
    }

    #[test]
    fn sim_ready_requires_device_ready() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        assert_eq!(
            device.set_sim_ready(GateMode::NonBlocking),
            Err(CellularError::DeviceError)
        );
    }

    #[test]
    fn sim_ready_enters_configured_pin() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        let mode = GateMode::Blocking(Duration::from_secs(1));
        device.set_device_ready(mode).unwrap();

        radio.respond_once(RequestKind::GetSimStatus, RilErrno::Success, present(AppState::Pin));
        radio.respond(RequestKind::GetSimStatus, RilErrno::Success, present(AppState::Ready));
        device.set_pin(Some("1234"));
        assert_eq!(device.set_sim_ready(mode), Ok(()));
        assert_eq!(radio.count_of(RequestKind::EnterSimPin), 1);
        assert_eq!(device.set_sim_ready(mode), Err(CellularError::Already));
    }

    #[test]
    fn sim_ready_without_pin_fails() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        let mode = GateMode::Blocking(Duration::from_secs(1));
        device.set_device_ready(mode).unwrap();
        radio.respond(RequestKind::GetSimStatus, RilErrno::Success, present(AppState::Pin));
        assert_eq!(device.set_sim_ready(mode), Err(CellularError::DeviceError));
        assert_eq!(device.sim_state(), SimState::PinNeeded);
    }

    #[test]
    fn radio_loss_closes_gates() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        let mode = GateMode::Blocking(Duration::from_secs(1));
        device.set_device_ready(mode).unwrap();
        device.set_sim_ready(mode).unwrap();
        radio.set_radio_state(RadioState::Off);
        radio.push_unsolicited(Unsolicited::RadioStateChanged);
        assert!(!device.is_device_ready());
        assert!(!device.is_sim_ready());
        assert_eq!(device.sim_state(), SimState::Unknown);
    }

    #[test]
    fn singleton_refcounts() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        let first = device.open_network();
        for _ in 0..2 {
            assert!(Arc::ptr_eq(&first, &device.open_network()));
        }
        assert_eq!(device.network_refs(), 3);
        device.close_network();
        device.close_network();
        assert_eq!(device.network_refs(), 1);
        assert!(device.network_instance().is_some());
        device.close_network();
        assert_eq!(device.network_refs(), 0);
        assert!(device.network_instance().is_none());
        device.close_network();
        assert_eq!(device.network_refs(), 0);

        let info = device.open_information();
        device.close_information();
        device.close_information();
        assert_eq!(device.information_refs(), 0);
        let again = device.open_information();
        assert!(!Arc::ptr_eq(&info, &again));

        device.open_sms();
        assert_eq!(device.sms_refs(), 1);
        device.close_sms();
        assert_eq!(device.sms_refs(), 0);
    }

    #[test]
    fn delete_context_from_any_position() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        let a = device.create_context(None);
        let b = device.create_context(None);
        let c = device.create_context(None);
        let d = device.create_context(None);
        assert_eq!(device.context_count(), 4);
        assert_eq!(device.network_refs(), 4);

        device.delete_context(Some(&b));
        device.delete_context(Some(&d));
        device.delete_context(Some(&a));
        assert_eq!(device.context_count(), 1);
        assert!(Arc::ptr_eq(&device.contexts()[0], &c));

        device.delete_context(Some(&a));
        device.delete_context(None);
        assert_eq!(device.context_count(), 1);

        let other = fake_device(&FakeRadio::new(), manual_config());
        let foreign = other.create_context(None);
        device.delete_context(Some(&foreign));
        assert_eq!(device.context_count(), 1);

        device.delete_context(Some(&c));
        assert_eq!(device.context_count(), 0);
        assert_eq!(device.network_refs(), 0);
    }

    #[test]
    fn unsupported_operations() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        assert_eq!(device.set_power_save_mode(0, 0), Err(CellularError::Unsupported));
        assert_eq!(device.send_at_command("AT"), Err(CellularError::Unsupported));
        assert_eq!(device.set_baud_rate(115200), Err(CellularError::Unsupported));
    }

    #[test]
    fn only_eps_registration_is_a_property() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        assert_eq!(device.get_property(CellularProperty::CEreg), 1);
        assert_eq!(device.get_property(CellularProperty::CReg), 0);
    }

    #[test]
    fn retry_schedule_round_trip() {
        let radio = FakeRadio::new();
        let device = fake_device(&radio, manual_config());
        device.set_retry_timeout_array(&[1, 5]);
        assert_eq!(
            device.retry_timeouts(),
            vec![Duration::from_secs(1), Duration::from_secs(5)]
        );
        assert_eq!(device.version().as_deref(), Some("fake-ril 1.0"));
    }
}
