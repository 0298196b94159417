//! # Connection context
//!
//! Drives one data connection through a fixed ladder of stages:
//!
//! ```text
//!   Invalid ─► DeviceReady ─► SimReady ─► Register ─► Attach ─► Connect
//!      ▲                                                           │
//!      └──────────────────────── disconnect() ─────────────────────┘
//! ```
//!
//! Each `connect`-family call raises the target stage and walks the current
//! stage up to it, never skipping a rung. In blocking mode the calling
//! thread parks on each stage's gate for that stage's budget. In
//! non-blocking mode the walk runs as tasks on the device's event queue and
//! resumes whenever a broadcast event reports that the awaited stage is
//! done.
//!
//! Data-call-list notifications are applied as a plain overwrite of the
//! bearer state, keyed by cid, whatever else is in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ContextConfig, Credentials};
use crate::device::{ReadinessGate, SimState};
use crate::error::{CellularError, Result};
use crate::event::{CellularEvent, Deadlines, EventQueue, StatusCallback};
use crate::gate::GateMode;
use crate::netif::{InterfaceConfig, NetworkStack};
use crate::network::{AttachStatus, RegistrationSource};
use crate::pdp::{PdpContextParams, PdpType, HOST_NETMASK};
use crate::ril::{
    send_and_wait, AuthType, Completion, DataCallResponse, DataCallSetup, DeactivateReason,
    InitialAttachApn, RilErrno, RilRequest, RilResponse, Token, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub enum Operation {
    #[default]
    Invalid,
    DeviceReady,
    SimReady,
    Register,
    Attach,
    Connect,
}

impl Operation {
    pub fn next(self) -> Option<Operation> {
        match self {
            Operation::Invalid => Some(Operation::DeviceReady),
            Operation::DeviceReady => Some(Operation::SimReady),
            Operation::SimReady => Some(Operation::Register),
            Operation::Register => Some(Operation::Attach),
            Operation::Attach => Some(Operation::Connect),
            Operation::Connect => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Bearer up without routable network parameters.
    LocalUp,
}

impl ConnectionStatus {
    pub fn is_up(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::LocalUp)
    }
}

/// Arena key of a context within its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub usize);

/// Collaborators a context is wired to at creation.
pub struct ContextParts {
    pub gate: Weak<dyn ReadinessGate>,
    pub registration: Arc<dyn RegistrationSource>,
    pub transport: Arc<dyn Transport>,
    pub queue: EventQueue,
    pub deadlines: Deadlines,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Idle,
    /// A continuation task sits on the event queue.
    Scheduled,
    /// The stage's request is out; its event will resume us.
    Awaiting(Operation),
}

struct ContextState {
    settings: ContextConfig,
    current: Operation,
    target: Operation,
    status: ConnectionStatus,
    cid: i32,
    bearer: Option<DataCallResponse>,
    progress: Progress,
    /// Bumped whenever a progression run is abandoned, so late tasks and
    /// completions from the old run recognise themselves as stale.
    generation: u64,
    setup_token: Option<Token>,
    status_cb: Option<StatusCallback>,
    stack: Option<Arc<dyn NetworkStack>>,
    interface: Option<String>,
}

enum LinkChange {
    Up(InterfaceConfig),
    Down(String),
}

pub struct CellularContext {
    id: ContextId,
    me: Weak<CellularContext>,
    gate: Weak<dyn ReadinessGate>,
    registration: Arc<dyn RegistrationSource>,
    transport: Arc<dyn Transport>,
    queue: EventQueue,
    deadlines: Deadlines,
    request_timeout: Duration,
    state: Mutex<ContextState>,
}

impl CellularContext {
    pub fn new(id: ContextId, parts: ContextParts, settings: ContextConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| CellularContext {
            id,
            me: me.clone(),
            gate: parts.gate,
            registration: parts.registration,
            transport: parts.transport,
            queue: parts.queue,
            deadlines: parts.deadlines,
            request_timeout: parts.request_timeout,
            state: Mutex::new(ContextState {
                settings,
                current: Operation::Invalid,
                target: Operation::Invalid,
                status: ConnectionStatus::Disconnected,
                cid: -1,
                bearer: None,
                progress: Progress::Idle,
                generation: 0,
                setup_token: None,
                status_cb: None,
                stack: None,
                interface: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    // ─── Settings ────────────────────────────────────────────────────────────

    pub fn set_blocking(&self, blocking: bool) {
        self.lock().settings.blocking = blocking;
    }

    pub fn is_blocking(&self) -> bool {
        self.lock().settings.blocking
    }

    /// Application callback; receives every device broadcast plus this
    /// context's own connection status changes.
    pub fn attach(&self, callback: Option<StatusCallback>) {
        self.lock().status_cb = callback;
    }

    pub fn set_network_stack(&self, stack: Option<Arc<dyn NetworkStack>>) {
        self.lock().stack = stack;
    }

    pub fn set_credentials(&self, apn: Option<&str>, username: Option<&str>, password: Option<&str>) {
        self.lock().settings.credentials = Credentials::new(apn, username, password);
    }

    pub fn credentials(&self) -> Credentials {
        self.lock().settings.credentials.clone()
    }

    pub fn set_sim_pin(&self, pin: Option<&str>) {
        if let Some(gate) = self.gate.upgrade() {
            gate.set_sim_pin(pin);
        }
    }

    pub fn set_plmn(&self, plmn: Option<&str>) {
        self.lock().settings.plmn = plmn.map(str::to_string);
    }

    pub fn plmn(&self) -> Option<String> {
        self.lock().settings.plmn.clone()
    }

    pub fn set_pdp_type(&self, pdp_type: PdpType) {
        self.lock().settings.pdp_type = pdp_type;
    }

    pub fn pdp_type(&self) -> PdpType {
        self.lock().settings.pdp_type
    }

    // ─── Stage entry points ──────────────────────────────────────────────────

    pub fn set_device_ready(&self) -> Result<()> {
        self.start(Operation::DeviceReady)
    }

    pub fn set_sim_ready(&self) -> Result<()> {
        self.start(Operation::SimReady)
    }

    pub fn register_to_network(&self) -> Result<()> {
        self.start(Operation::Register)
    }

    pub fn attach_to_network(&self) -> Result<()> {
        self.start(Operation::Attach)
    }

    pub fn connect(&self) -> Result<()> {
        self.start(Operation::Connect)
    }

    pub fn connect_with(
        &self,
        sim_pin: Option<&str>,
        apn: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        if sim_pin.is_some() {
            self.set_sim_pin(sim_pin);
        }
        self.set_credentials(apn, username, password);
        self.connect()
    }

    fn start(&self, target: Operation) -> Result<()> {
        let blocking = {
            let mut st = self.lock();
            if target == Operation::Connect && st.status.is_up() {
                return Err(CellularError::IsConnected);
            }
            if st.progress != Progress::Idle {
                return Err(CellularError::Busy);
            }
            if st.current >= target {
                return Err(CellularError::Already);
            }
            st.target = target;
            if !st.settings.blocking {
                st.progress = Progress::Scheduled;
                // Deadlines left over from an earlier run must not match.
                st.generation += 1;
            }
            st.settings.blocking
        };
        debug!(context = self.id.0, ?target, blocking, "starting progression");

        if blocking {
            return self.run_blocking(target);
        }
        let generation = self.lock().generation;
        if let Err(e) = self.post_continue(generation) {
            self.lock().progress = Progress::Idle;
            return Err(e);
        }
        Ok(())
    }

    fn stage_timeout(settings: &ContextConfig, stage: Operation) -> Duration {
        let t = &settings.timeouts;
        match stage {
            Operation::DeviceReady => t.device,
            Operation::SimReady => t.sim,
            Operation::Register => t.registration,
            Operation::Attach => t.attach,
            Operation::Connect | Operation::Invalid => t.connect,
        }
    }

    fn run_stage(&self, stage: Operation, mode: GateMode) -> Result<()> {
        match stage {
            Operation::DeviceReady => self.readiness()?.set_device_ready(mode),
            Operation::SimReady => self.readiness()?.set_sim_ready(mode),
            Operation::Register => {
                let apn = self.initial_attach_apn();
                self.registration.register_to_network(&apn, mode)
            }
            Operation::Attach => self.registration.attach_to_network(mode),
            Operation::Invalid | Operation::Connect => Ok(()),
        }
    }

    fn readiness(&self) -> Result<Arc<dyn ReadinessGate>> {
        self.gate.upgrade().ok_or(CellularError::DeviceError)
    }

    fn advance_to(&self, stage: Operation) {
        let mut st = self.lock();
        if stage > st.current && stage <= st.target {
            st.current = stage;
        }
    }

    // ─── Blocking walk ───────────────────────────────────────────────────────

    fn run_blocking(&self, target: Operation) -> Result<()> {
        loop {
            let (stage, timeout) = {
                let st = self.lock();
                match st.current.next() {
                    Some(stage) if stage <= target => {
                        (stage, Self::stage_timeout(&st.settings, stage))
                    }
                    _ => return Ok(()),
                }
            };
            if stage == Operation::Connect {
                return self.setup_blocking(timeout);
            }
            match self.run_stage(stage, GateMode::Blocking(timeout)) {
                Ok(()) | Err(CellularError::Already) => self.advance_to(stage),
                Err(e) => {
                    warn!(context = self.id.0, ?stage, error = %e, "stage failed");
                    return Err(e);
                }
            }
        }
    }

    fn setup_blocking(&self, timeout: Duration) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting);
        let request = self.data_call_setup();
        match send_and_wait(self.transport.as_ref(), request, timeout, decode_setup) {
            Ok(call) => {
                self.on_bearer_up(call);
                Ok(())
            }
            Err(e) => {
                warn!(context = self.id.0, error = %e, "data call setup failed");
                self.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    // ─── Non-blocking walk ───────────────────────────────────────────────────

    fn post_continue(&self, generation: u64) -> Result<()> {
        let weak = self.me.clone();
        self.queue.post(Box::new(move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.continue_progress(generation);
            }
        }))
    }

    fn continue_progress(&self, generation: u64) {
        loop {
            let (stage, budget) = {
                let mut st = self.lock();
                if st.generation != generation || st.progress != Progress::Scheduled {
                    return;
                }
                match st.current.next() {
                    Some(stage) if stage <= st.target => {
                        st.progress = Progress::Awaiting(stage);
                        (stage, Self::stage_timeout(&st.settings, stage))
                    }
                    _ => {
                        st.progress = Progress::Idle;
                        return;
                    }
                }
            };

            if let Err(e) = self.arm_deadline(generation, stage, budget) {
                self.fail_progress(generation, stage, e, true);
                return;
            }
            if stage == Operation::Connect {
                self.start_setup(generation);
                return;
            }
            match self.run_stage(stage, GateMode::NonBlocking) {
                // The stage's event advances us, possibly already has.
                Ok(()) | Err(CellularError::Busy) => return,
                Err(CellularError::Already) => {
                    let mut st = self.lock();
                    if st.generation != generation || st.progress != Progress::Awaiting(stage) {
                        return;
                    }
                    if stage > st.current {
                        st.current = stage;
                    }
                    st.progress = Progress::Scheduled;
                }
                Err(e) => {
                    self.fail_progress(generation, stage, e, true);
                    return;
                }
            }
        }
    }

    /// Each awaited stage gets its own budget, re-armed per stage.
    fn arm_deadline(&self, generation: u64, stage: Operation, budget: Duration) -> Result<()> {
        let weak = self.me.clone();
        self.deadlines.schedule(
            budget,
            Box::new(move || {
                if let Some(ctx) = weak.upgrade() {
                    ctx.on_stage_deadline(generation, stage);
                }
            }),
        )
    }

    fn on_stage_deadline(&self, generation: u64, stage: Operation) {
        let token = {
            let mut st = self.lock();
            if st.generation != generation || st.progress != Progress::Awaiting(stage) {
                return;
            }
            st.setup_token.take()
        };
        match stage {
            Operation::DeviceReady | Operation::SimReady => {
                if let Ok(gate) = self.readiness() {
                    gate.abandon(stage, CellularError::Timeout);
                }
            }
            Operation::Register | Operation::Attach => {
                self.registration.abandon(stage, CellularError::Timeout)
            }
            Operation::Invalid | Operation::Connect => {}
        }
        self.fail_progress(generation, stage, CellularError::Timeout, true);
        // The synthesized completion finds the run already over.
        if let Some(token) = token {
            self.transport.cancel(token);
        }
    }

    fn start_setup(&self, generation: u64) {
        self.set_status(ConnectionStatus::Connecting);
        let weak = self.me.clone();
        let sent = self.transport.send(
            self.data_call_setup(),
            Box::new(move |c: Completion| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.on_setup_complete(generation, c);
                }
            }),
        );
        match sent {
            Ok(token) => {
                let mut st = self.lock();
                if st.generation == generation
                    && st.progress == Progress::Awaiting(Operation::Connect)
                {
                    st.setup_token = Some(token);
                }
            }
            Err(e) => self.fail_progress(generation, Operation::Connect, e, true),
        }
    }

    fn on_setup_complete(&self, generation: u64, completion: Completion) {
        match decode_setup(completion.error, completion.response) {
            Ok(call) => {
                {
                    let mut st = self.lock();
                    if st.generation != generation
                        || st.progress != Progress::Awaiting(Operation::Connect)
                    {
                        debug!(context = self.id.0, "discarding stale setup completion");
                        return;
                    }
                    st.progress = Progress::Idle;
                    st.setup_token = None;
                }
                self.on_bearer_up(call);
            }
            Err(e) => self.fail_progress(generation, Operation::Connect, e, true),
        }
    }

    /// End the current non-blocking run. `notify` reports the failure to the
    /// application; failures that arrived as a broadcast were already seen.
    fn fail_progress(&self, generation: u64, stage: Operation, error: CellularError, notify: bool) {
        let cb = {
            let mut st = self.lock();
            if st.generation != generation || st.progress == Progress::Idle {
                return;
            }
            st.progress = Progress::Idle;
            st.setup_token = None;
            st.status_cb.clone()
        };
        warn!(context = self.id.0, ?stage, error = %error, "connection progression failed");
        if notify {
            if let Some(cb) = cb {
                cb(&CellularEvent::OperationFailed {
                    operation: stage,
                    error,
                });
            }
        }
        if stage == Operation::Connect {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Entry point for every device broadcast.
    pub(crate) fn cellular_callback(&self, event: &CellularEvent) {
        let cb = self.lock().status_cb.clone();
        if let Some(cb) = cb {
            cb(event);
        }

        let completed = match event {
            CellularEvent::DeviceReady => Operation::DeviceReady,
            CellularEvent::SimStatusChanged(SimState::Ready) => Operation::SimReady,
            CellularEvent::RegistrationStatusChanged(s) if s.is_registered() => {
                Operation::Register
            }
            CellularEvent::AttachStatusChanged(AttachStatus::Attached) => Operation::Attach,
            CellularEvent::OperationFailed { operation, error } => {
                let generation = {
                    let st = self.lock();
                    if st.progress != Progress::Awaiting(*operation) {
                        return;
                    }
                    st.generation
                };
                self.fail_progress(generation, *operation, *error, false);
                return;
            }
            _ => return,
        };

        let generation = {
            let mut st = self.lock();
            if st.progress != Progress::Awaiting(completed) {
                return;
            }
            if completed > st.current {
                st.current = completed;
            }
            st.progress = Progress::Scheduled;
            st.generation
        };
        debug!(context = self.id.0, stage = ?completed, "stage complete");
        if let Err(e) = self.post_continue(generation) {
            let next = completed.next().unwrap_or(completed);
            self.fail_progress(generation, next, e, true);
        }
    }

    // ─── Bearer state ────────────────────────────────────────────────────────

    fn on_bearer_up(&self, call: DataCallResponse) {
        let status = if call.is_routable() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::LocalUp
        };
        {
            let mut st = self.lock();
            st.current = Operation::Connect;
            st.cid = call.cid;
            st.bearer = Some(call);
        }
        self.set_status(status);
    }

    /// Apply a data-call-list notification. `taken` holds the cids other
    /// contexts already own.
    pub(crate) fn handle_data_call_list(&self, calls: &[DataCallResponse], taken: &[i32]) {
        let update = {
            let mut st = self.lock();
            let cid = st.cid;
            // Unassigned contexts adopt the first live bearer nobody owns.
            let mine = if cid >= 0 {
                calls.iter().find(|c| c.cid == cid)
            } else {
                calls.iter().find(|c| c.is_up() && !taken.contains(&c.cid))
            };
            match mine {
                Some(call) if call.is_up() => {
                    let status = if call.is_routable() {
                        ConnectionStatus::Connected
                    } else {
                        ConnectionStatus::LocalUp
                    };
                    st.cid = call.cid;
                    st.bearer = Some(call.clone());
                    Some(status)
                }
                _ if cid >= 0 || st.status.is_up() => {
                    st.cid = -1;
                    st.bearer = None;
                    if st.current == Operation::Connect {
                        st.current = Operation::Attach;
                    }
                    Some(ConnectionStatus::Disconnected)
                }
                _ => None,
            }
        };
        if let Some(status) = update {
            self.set_status(status);
        }
    }

    /// Record `status`, drive the network stack across up/down edges and
    /// tell the application. No-op when nothing changed.
    fn set_status(&self, status: ConnectionStatus) {
        let (cb, stack, change) = {
            let mut st = self.lock();
            let previous = st.status;
            if previous == status {
                return;
            }
            st.status = status;
            let change = match (previous.is_up(), status.is_up()) {
                (false, true) => st
                    .bearer
                    .as_ref()
                    .map(|b| LinkChange::Up(InterfaceConfig::from_data_call(b))),
                (true, false) => st.interface.take().map(LinkChange::Down),
                _ => None,
            };
            (st.status_cb.clone(), st.stack.clone(), change)
        };
        info!(context = self.id.0, ?status, "connection status changed");

        if let (Some(stack), Some(change)) = (stack, change) {
            match change {
                LinkChange::Up(config) => match stack.bring_up(&config) {
                    Ok(()) => self.lock().interface = Some(config.name),
                    Err(e) => warn!(
                        context = self.id.0,
                        interface = %config.name,
                        error = %e,
                        "network interface bring-up failed"
                    ),
                },
                LinkChange::Down(name) => stack.bring_down(&name),
            }
        }
        if let Some(cb) = cb {
            cb(&CellularEvent::ConnectionStatusChanged(status));
        }
    }

    // ─── Disconnect ──────────────────────────────────────────────────────────

    /// Abandon any outstanding progression and cancel an in-flight setup.
    fn abort_progress(&self) {
        let token = {
            let mut st = self.lock();
            if st.progress != Progress::Idle {
                st.progress = Progress::Idle;
                st.generation += 1;
            }
            st.setup_token.take()
        };
        if let Some(token) = token {
            debug!(context = self.id.0, token = token.id().0, "cancelling data call setup");
            self.transport.cancel(token);
        }
    }

    pub fn disconnect(&self) -> Result<()> {
        self.abort_progress();
        let (cid, up) = {
            let st = self.lock();
            (st.cid, st.status.is_up())
        };
        if !up || cid < 0 {
            self.set_status(ConnectionStatus::Disconnected);
            return Ok(());
        }

        send_and_wait(
            self.transport.as_ref(),
            RilRequest::DeactivateDataCall {
                cid,
                reason: DeactivateReason::NoReason,
            },
            self.request_timeout,
            |err, _| err.into_result().map_err(|_| CellularError::DeviceError),
        )?;

        {
            let mut st = self.lock();
            st.current = Operation::Invalid;
            st.target = Operation::Invalid;
            st.cid = -1;
            st.bearer = None;
        }
        self.set_status(ConnectionStatus::Disconnected);
        info!(context = self.id.0, cid, "disconnected");
        Ok(())
    }

    /// Called by the device when the context leaves its arena.
    pub(crate) fn shutdown(&self) {
        self.abort_progress();
        let mut st = self.lock();
        st.status_cb = None;
        st.stack = None;
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.lock().status.is_up()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn current_operation(&self) -> Operation {
        self.lock().current
    }

    pub fn target_operation(&self) -> Operation {
        self.lock().target
    }

    pub fn cid(&self) -> i32 {
        self.lock().cid
    }

    fn interface_config(&self) -> Option<InterfaceConfig> {
        self.lock().bearer.as_ref().map(InterfaceConfig::from_data_call)
    }

    pub fn ip_address(&self) -> Option<String> {
        self.interface_config()
            .map(|c| c.address)
            .filter(|a| !a.is_empty())
    }

    pub fn interface_name(&self) -> Option<String> {
        self.interface_config()
            .map(|c| c.name)
            .filter(|n| !n.is_empty())
    }

    pub fn gateway(&self) -> Option<String> {
        self.interface_config()
            .map(|c| c.gateway)
            .filter(|g| !g.is_empty())
    }

    pub fn netmask(&self) -> String {
        self.interface_config()
            .map(|c| c.netmask)
            .unwrap_or_else(|| HOST_NETMASK.to_string())
    }

    pub fn dns_servers(&self) -> Vec<String> {
        self.interface_config().map(|c| c.dns).unwrap_or_default()
    }

    /// Serving PLMN rate control as (exception reports allowed, uplink time
    /// unit, maximum uplink rate).
    pub fn get_rate_control(&self) -> Result<(bool, u8, u32)> {
        Err(CellularError::Unsupported)
    }

    pub fn get_apn_backoff_timer(&self) -> Result<Duration> {
        Err(CellularError::Unsupported)
    }

    pub fn get_pdp_context_params(&self) -> Result<Vec<PdpContextParams>> {
        let calls = send_and_wait(
            self.transport.as_ref(),
            RilRequest::DataCallList,
            self.request_timeout,
            |err, resp| {
                err.into_result().map_err(|_| CellularError::DeviceError)?;
                match resp {
                    RilResponse::DataCallList(calls) => Ok(calls),
                    RilResponse::Empty => Ok(Vec::new()),
                    _ => Err(CellularError::DeviceError),
                }
            },
        )?;

        let st = self.lock();
        let apn = st.settings.credentials.apn.clone().unwrap_or_default();
        if calls.is_empty() {
            let own = match &st.bearer {
                Some(bearer) => PdpContextParams::from_data_call(&apn, bearer),
                None => PdpContextParams {
                    apn,
                    cid: st.cid,
                    bearer_id: st.cid,
                    ..PdpContextParams::default()
                },
            };
            return Ok(vec![own]);
        }
        Ok(calls
            .iter()
            .map(|call| PdpContextParams::from_data_call(&apn, call))
            .collect())
    }

    // ─── Request payloads ────────────────────────────────────────────────────

    fn auth_type(credentials: &Credentials) -> AuthType {
        if credentials.username.is_some() || credentials.password.is_some() {
            AuthType::PapOrChap
        } else {
            AuthType::None
        }
    }

    fn initial_attach_apn(&self) -> InitialAttachApn {
        let st = self.lock();
        let c = &st.settings.credentials;
        InitialAttachApn {
            apn: c.apn.clone().unwrap_or_default(),
            protocol: st.settings.pdp_type.as_ril_str().to_string(),
            auth: Self::auth_type(c),
            username: c.username.clone().unwrap_or_default(),
            password: c.password.clone().unwrap_or_default(),
        }
    }

    fn data_call_setup(&self) -> RilRequest {
        let technology = self.registration.data_technology();
        let st = self.lock();
        let c = &st.settings.credentials;
        RilRequest::SetupDataCall(DataCallSetup {
            radio_technology: technology.code() + 2,
            profile: 0,
            apn: c.apn.clone().unwrap_or_default(),
            username: c.username.clone().unwrap_or_default(),
            password: c.password.clone().unwrap_or_default(),
            auth: Self::auth_type(c),
            protocol: st.settings.pdp_type.as_ril_str().to_string(),
        })
    }
}

fn decode_setup(error: RilErrno, response: RilResponse) -> Result<DataCallResponse> {
    error.into_result().map_err(|_| CellularError::DeviceError)?;
    match response {
        RilResponse::DataCall(call) if call.is_up() => Ok(call),
        RilResponse::DataCall(call) => {
            warn!(status = call.status, active = call.active, "data call rejected");
            Err(CellularError::DeviceError)
        }
        _ => Err(CellularError::DeviceError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CellularDevice;
    use crate::network::RegistrationStatus;
    use crate::ril::{CardState, CardStatus, AppState, RadioState, RequestKind};
    use crate::test_util::{
        fake_device, manual_config, recorder, registration_strings, up_call, FakeRadio,
    };
    use crossbeam_channel::Receiver;

    fn setup(radio: &Arc<FakeRadio>) -> (Arc<CellularDevice>, Arc<CellularContext>, Receiver<CellularEvent>) {
        let device = fake_device(radio, manual_config());
        let ctx = device.create_context(None);
        let (cb, events) = recorder();
        ctx.attach(Some(cb));
        (device, ctx, events)
    }

    fn full_ladder() -> Vec<CellularEvent> {
        vec![
            CellularEvent::DeviceReady,
            CellularEvent::SimStatusChanged(SimState::Ready),
            CellularEvent::RegistrationStatusChanged(RegistrationStatus::RegisteredHomeNetwork),
            CellularEvent::AttachStatusChanged(AttachStatus::Attached),
            CellularEvent::ConnectionStatusChanged(ConnectionStatus::Connecting),
            CellularEvent::ConnectionStatusChanged(ConnectionStatus::Connected),
        ]
    }

    #[test]
    fn operations_are_ordered() {
        assert!(Operation::Invalid < Operation::DeviceReady);
        assert!(Operation::Attach < Operation::Connect);
        assert_eq!(Operation::Register.next(), Some(Operation::Attach));
        assert_eq!(Operation::Connect.next(), None);
    }

    #[test]
    fn blocking_connect_walks_every_stage() {
        let radio = FakeRadio::new();
        radio.set_radio_state(RadioState::Off);
        let (_device, ctx, events) = setup(&radio);

        assert_eq!(ctx.connect(), Ok(()));
        assert_eq!(events.try_iter().collect::<Vec<_>>(), full_ladder());
        assert_eq!(ctx.current_operation(), Operation::Connect);
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
        assert_eq!(ctx.cid(), 0);
        assert_eq!(ctx.ip_address().as_deref(), Some("10.0.0.1"));
        assert_eq!(ctx.interface_name().as_deref(), Some("ifname0"));

        assert_eq!(ctx.connect(), Err(CellularError::IsConnected));
        assert_eq!(ctx.attach_to_network(), Err(CellularError::Already));
        assert_eq!(radio.count_of(RequestKind::RadioPower), 1);
        assert_eq!(radio.count_of(RequestKind::SetupDataCall), 1);
    }

    #[test]
    fn stages_stop_at_target() {
        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        assert_eq!(ctx.register_to_network(), Ok(()));
        assert_eq!(ctx.current_operation(), Operation::Register);
        assert_eq!(ctx.target_operation(), Operation::Register);
        assert_eq!(ctx.set_sim_ready(), Err(CellularError::Already));
        assert_eq!(radio.count_of(RequestKind::SetupDataCall), 0);
        assert!(!ctx.is_connected());
    }

    #[test]
    fn non_blocking_connect_runs_on_the_queue() {
        let radio = FakeRadio::new();
        let (device, ctx, events) = setup(&radio);
        ctx.set_blocking(false);

        assert_eq!(ctx.connect(), Ok(()));
        assert_eq!(ctx.connect(), Err(CellularError::Busy));
        assert!(events.try_recv().is_err());

        device.dispatch_events();
        assert_eq!(events.try_iter().collect::<Vec<_>>(), full_ladder());
        assert_eq!(ctx.connect(), Err(CellularError::IsConnected));
        assert_eq!(ctx.register_to_network(), Err(CellularError::Already));
    }

    #[test]
    fn full_queue_is_no_memory_and_not_sticky() {
        let radio = FakeRadio::new();
        let mut config = manual_config();
        config.event_queue.capacity = 0;
        let device = fake_device(&radio, config);
        let ctx = device.create_context(None);
        ctx.set_blocking(false);
        assert_eq!(ctx.connect(), Err(CellularError::NoMemory));
        assert_eq!(ctx.connect(), Err(CellularError::NoMemory));
    }

    #[test]
    fn failed_stage_keeps_earlier_progress() {
        let radio = FakeRadio::new();
        radio.set_radio_state(RadioState::Off);
        let (_device, ctx, _events) = setup(&radio);
        let absent = RilResponse::CardStatus(CardStatus {
            card_state: CardState::Absent,
            app_state: AppState::Unknown,
        });
        radio.respond(RequestKind::GetSimStatus, RilErrno::Success, absent);

        assert_eq!(ctx.connect(), Err(CellularError::DeviceError));
        assert_eq!(ctx.current_operation(), Operation::DeviceReady);

        radio.respond(
            RequestKind::GetSimStatus,
            RilErrno::Success,
            RilResponse::CardStatus(CardStatus {
                card_state: CardState::Present,
                app_state: AppState::Ready,
            }),
        );
        assert_eq!(ctx.connect(), Ok(()));
        assert_eq!(radio.count_of(RequestKind::RadioPower), 1);
    }

    #[test]
    fn registration_timeout_aborts_blocking_connect() {
        let radio = FakeRadio::new();
        radio.respond(
            RequestKind::DataRegistrationState,
            RilErrno::Success,
            RilResponse::Strings(registration_strings("2", "14")),
        );
        let mut config = manual_config();
        config.context.timeouts.registration = Duration::from_millis(40);
        let device = fake_device(&radio, config);
        let ctx = device.create_context(None);
        assert_eq!(ctx.connect(), Err(CellularError::Timeout));
        assert_eq!(ctx.current_operation(), Operation::SimReady);
    }

    #[test]
    fn non_blocking_failure_is_reported_and_releases_progression() {
        let radio = FakeRadio::new();
        radio.set_radio_state(RadioState::Unavailable);
        let (device, ctx, events) = setup(&radio);
        ctx.set_blocking(false);

        assert_eq!(ctx.connect(), Ok(()));
        device.dispatch_events();
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![CellularEvent::OperationFailed {
                operation: Operation::DeviceReady,
                error: CellularError::DeviceError,
            }]
        );
        assert_eq!(ctx.current_operation(), Operation::Invalid);

        radio.set_radio_state(RadioState::On);
        assert_eq!(ctx.connect(), Ok(()));
        device.dispatch_events();
        assert!(ctx.is_connected());
    }

    #[test]
    fn rejected_setup_reports_disconnected() {
        let radio = FakeRadio::new();
        radio.respond(
            RequestKind::SetupDataCall,
            RilErrno::Success,
            RilResponse::DataCall(DataCallResponse {
                status: 33,
                ..up_call(0)
            }),
        );
        let (_device, ctx, events) = setup(&radio);
        assert_eq!(ctx.connect(), Err(CellularError::DeviceError));
        let got: Vec<_> = events.try_iter().collect();
        assert_eq!(
            &got[got.len() - 2..],
            &[
                CellularEvent::ConnectionStatusChanged(ConnectionStatus::Connecting),
                CellularEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected),
            ]
        );
        assert_eq!(ctx.current_operation(), Operation::Attach);
        assert_eq!(ctx.cid(), -1);
    }

    #[test]
    fn link_down_setup_answer_is_rejected() {
        let radio = FakeRadio::new();
        radio.respond(
            RequestKind::SetupDataCall,
            RilErrno::Success,
            RilResponse::DataCall(DataCallResponse {
                active: 1,
                ..up_call(0)
            }),
        );
        let (_device, ctx, _events) = setup(&radio);
        assert_eq!(ctx.connect(), Err(CellularError::DeviceError));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);

        // The same bearer reported by the radio does not flip anything.
        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![
            DataCallResponse {
                active: 1,
                ..up_call(0)
            },
        ]));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(ctx.cid(), -1);
    }

    #[test]
    fn non_blocking_stage_over_budget_times_out_and_releases() {
        let radio = FakeRadio::new();
        radio.respond(
            RequestKind::DataRegistrationState,
            RilErrno::Success,
            RilResponse::Strings(registration_strings("3", "14")),
        );
        let mut config = manual_config();
        config.context.timeouts.registration = Duration::from_millis(40);
        let device = fake_device(&radio, config);
        let ctx = device.create_context(None);
        let (cb, events) = recorder();
        ctx.attach(Some(cb));
        ctx.set_blocking(false);

        assert_eq!(ctx.connect(), Ok(()));
        let failure = CellularEvent::OperationFailed {
            operation: Operation::Register,
            error: CellularError::Timeout,
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while !seen.contains(&failure) && std::time::Instant::now() < deadline {
            device.dispatch_events();
            seen.extend(events.try_iter());
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(seen.contains(&failure), "events: {seen:?}");
        assert_eq!(ctx.current_operation(), Operation::SimReady);

        // The run is over, so the next call is accepted and can finish.
        radio.respond(
            RequestKind::DataRegistrationState,
            RilErrno::Success,
            RilResponse::Strings(registration_strings("1", "14")),
        );
        assert_eq!(ctx.connect(), Ok(()));
        device.dispatch_events();
        assert!(ctx.is_connected());
    }

    #[test]
    fn bearer_without_gateway_is_local_up() {
        let radio = FakeRadio::new();
        radio.respond(
            RequestKind::SetupDataCall,
            RilErrno::Success,
            RilResponse::DataCall(DataCallResponse {
                gateways: String::new(),
                ..up_call(4)
            }),
        );
        let (_device, ctx, _events) = setup(&radio);
        assert_eq!(ctx.connect(), Ok(()));
        assert_eq!(ctx.connection_status(), ConnectionStatus::LocalUp);
        assert!(ctx.is_connected());
        assert_eq!(ctx.gateway(), None);
    }

    #[test]
    fn disconnect_failure_leaves_connection_up() {
        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        ctx.connect().unwrap();

        radio.respond_once(
            RequestKind::DeactivateDataCall,
            RilErrno::GenericFailure,
            RilResponse::Empty,
        );
        assert_eq!(ctx.disconnect(), Err(CellularError::DeviceError));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
        assert_eq!(ctx.current_operation(), Operation::Connect);

        assert_eq!(ctx.disconnect(), Ok(()));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(ctx.current_operation(), Operation::Invalid);
        assert_eq!(ctx.cid(), -1);
        assert_eq!(ctx.disconnect(), Ok(()));
        assert_eq!(radio.count_of(RequestKind::DeactivateDataCall), 2);
    }

    #[test]
    fn unsolicited_bearer_up_without_connect() {
        let radio = FakeRadio::new();
        let (_device, ctx, events) = setup(&radio);
        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![up_call(3)]));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Connected);
        assert_eq!(ctx.cid(), 3);
        assert_eq!(ctx.current_operation(), Operation::Invalid);

        // Same report again changes nothing.
        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![up_call(3)]));
        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![]));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(ctx.cid(), -1);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                CellularEvent::ConnectionStatusChanged(ConnectionStatus::Connected),
                CellularEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected),
            ]
        );
    }

    #[test]
    fn idle_context_leaves_sibling_bearer_alone() {
        let radio = FakeRadio::new();
        let (device, owner, _events) = setup(&radio);
        owner.connect().unwrap();
        let idle = device.create_context(None);

        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![up_call(0)]));
        assert_eq!(owner.cid(), 0);
        assert_eq!(idle.cid(), -1);
        assert_eq!(idle.connection_status(), ConnectionStatus::Disconnected);

        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![
            up_call(0),
            up_call(1),
        ]));
        assert_eq!(idle.cid(), 1);
        assert!(idle.is_connected());
    }

    #[test]
    fn dropped_bearer_falls_back_to_attach() {
        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        ctx.connect().unwrap();
        radio.push_unsolicited(crate::ril::Unsolicited::DataCallListChanged(vec![]));
        assert_eq!(ctx.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(ctx.current_operation(), Operation::Attach);
        assert_eq!(ctx.connect(), Ok(()));
        assert!(ctx.is_connected());
    }

    #[test]
    fn pdp_params_from_radio_or_own_state() {
        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        ctx.set_credentials(Some("internet"), None, None);

        let own = ctx.get_pdp_context_params().unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].apn, "internet");
        assert_eq!(own[0].cid, -1);
        assert_eq!(own[0].local_subnet_mask, "255.255.255.255");
        assert_eq!(own[0].ipv4_mtu, -1);

        radio.respond(
            RequestKind::DataCallList,
            RilErrno::Success,
            RilResponse::DataCallList(vec![up_call(0), up_call(1)]),
        );
        let listed = ctx.get_pdp_context_params().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].cid, 1);
        assert_eq!(listed[1].bearer_id, 1);
        assert_eq!(listed[1].local_addr, "10.0.0.2");
        assert_eq!(listed[1].dns_primary_addr, "8.8.8.8");

        radio.respond(RequestKind::DataCallList, RilErrno::GenericFailure, RilResponse::Empty);
        assert_eq!(ctx.get_pdp_context_params(), Err(CellularError::DeviceError));
    }

    #[test]
    fn rate_control_and_backoff_are_unsupported() {
        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        assert_eq!(ctx.get_rate_control(), Err(CellularError::Unsupported));
        assert_eq!(ctx.get_apn_backoff_timer(), Err(CellularError::Unsupported));
    }

    #[test]
    fn network_stack_follows_connection() {
        struct Recording(Mutex<Vec<String>>);
        impl NetworkStack for Recording {
            fn bring_up(&self, config: &InterfaceConfig) -> Result<()> {
                self.0.lock().unwrap().push(format!("up {}", config.name));
                Ok(())
            }
            fn bring_down(&self, name: &str) {
                self.0.lock().unwrap().push(format!("down {name}"));
            }
        }

        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        let stack = Arc::new(Recording(Mutex::new(Vec::new())));
        ctx.set_network_stack(Some(stack.clone()));
        ctx.connect().unwrap();
        ctx.disconnect().unwrap();
        assert_eq!(*stack.0.lock().unwrap(), vec!["up ifname0", "down ifname0"]);
    }

    #[test]
    fn deleting_context_cancels_setup() {
        let radio = FakeRadio::new();
        let (device, ctx, events) = setup(&radio);
        ctx.attach_to_network().unwrap();
        events.try_iter().for_each(drop);

        ctx.set_blocking(false);
        radio.hold_completions(true);
        assert_eq!(ctx.connect(), Ok(()));
        device.dispatch_events();
        assert_eq!(device.transport().pending_count(), 1);

        device.delete_context(Some(&ctx));
        assert_eq!(device.transport().pending_count(), 0);
        assert_eq!(radio.cancelled().len(), 1);
        radio.release_held();
        assert!(!ctx.is_connected());
    }

    #[test]
    fn connect_with_stores_credentials() {
        let radio = FakeRadio::new();
        let (_device, ctx, _events) = setup(&radio);
        ctx.set_pdp_type(PdpType::Ipv4v6);
        assert_eq!(ctx.connect_with(Some("1234"), Some("apn"), Some("u"), Some("p")), Ok(()));
        let creds = ctx.credentials();
        assert_eq!(creds.apn.as_deref(), Some("apn"));
        assert_eq!(creds.username.as_deref(), Some("u"));

        let setup_request = radio
            .requests()
            .into_iter()
            .find_map(|r| match r {
                RilRequest::SetupDataCall(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(setup_request.apn, "apn");
        assert_eq!(setup_request.protocol, "IPV4V6");
        assert_eq!(setup_request.auth, AuthType::PapOrChap);
        assert_eq!(setup_request.radio_technology, 16);
    }
}
