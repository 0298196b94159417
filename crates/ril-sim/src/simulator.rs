//! # RIL simulator
//!
//! A [`RadioInterface`] backed by an in-memory model. Every request is
//! applied to the model under its lock, then the answer and any follow-up
//! notifications are handed to the environment as one batch:
//!
//! ```text
//!  on_request ──► model.apply ──► [Complete, Unsolicited..] ──► inline
//!                                                          └──► worker (latency)
//! ```
//!
//! Follow-ups always trail their completion. Batches are never delivered
//! with the model lock held, so the connection manager may issue new
//! requests from inside its callbacks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ril_cellular::ril::{
    AppState, CardState, CardStatus, DataCallResponse, InitialAttachApn, RadioInterface,
    RadioState, RequestKind, RilEnv, RilErrno, RilRequest, RilResponse, SmsResponse, TokenId,
    Unsolicited,
};
use tracing::{debug, info, trace, warn};

use crate::config::{DeliveryMode, SimConfig};

const DELIVERY_QUEUE_CAPACITY: usize = 1024;

type EnvSlot = Arc<Mutex<Option<Arc<dyn RilEnv>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One message towards the environment.
#[derive(Debug, Clone)]
enum Outbound {
    Complete {
        token: TokenId,
        error: RilErrno,
        response: RilResponse,
    },
    Notify(Unsolicited),
}

type Batch = Vec<Outbound>;

struct Reply {
    error: RilErrno,
    response: RilResponse,
    follow_up: Vec<Unsolicited>,
}

impl Reply {
    fn ok(response: RilResponse) -> Self {
        Self {
            error: RilErrno::Success,
            response,
            follow_up: Vec::new(),
        }
    }

    fn fail(error: RilErrno) -> Self {
        Self {
            error,
            response: RilResponse::Empty,
            follow_up: Vec::new(),
        }
    }

    fn then(mut self, u: Unsolicited) -> Self {
        self.follow_up.push(u);
        self
    }

    fn into_batch(self, token: TokenId) -> Batch {
        let mut batch = Vec::with_capacity(1 + self.follow_up.len());
        batch.push(Outbound::Complete {
            token,
            error: self.error,
            response: self.response,
        });
        batch.extend(self.follow_up.into_iter().map(Outbound::Notify));
        batch
    }
}

struct Held {
    token: TokenId,
    batch: Batch,
}

// ─── Model ───────────────────────────────────────────────────────────────────

struct Model {
    radio: RadioState,
    sim_locked: bool,
    registration_status: i32,
    attach_apn: Option<InitialAttachApn>,
    calls: BTreeMap<i32, DataCallResponse>,
    next_cid: i32,
    next_message_ref: i32,
    failures: HashMap<RequestKind, RilErrno>,
    hold: bool,
    held: Vec<Held>,
    refuse_init: bool,
    requests: Vec<RequestKind>,
}

impl Model {
    fn new(config: &SimConfig) -> Self {
        Self {
            radio: RadioState::Off,
            sim_locked: config.sim.pin.is_some(),
            registration_status: config.network.registration_status,
            attach_apn: None,
            calls: BTreeMap::new(),
            next_cid: 0,
            next_message_ref: 1,
            failures: HashMap::new(),
            hold: false,
            held: Vec::new(),
            refuse_init: false,
            requests: Vec::new(),
        }
    }

    fn powered(&self) -> bool {
        self.radio == RadioState::On
    }

    fn camped(&self, config: &SimConfig) -> bool {
        self.powered() && self.attach_apn.is_some() && config.sim.present && !self.sim_locked
    }

    fn registered(&self, config: &SimConfig) -> bool {
        self.camped(config) && matches!(self.registration_status, 1 | 5)
    }

    fn call_list(&self) -> Vec<DataCallResponse> {
        self.calls.values().cloned().collect()
    }

    fn app_state(&self, config: &SimConfig) -> AppState {
        if !config.sim.present {
            AppState::Unknown
        } else if self.sim_locked {
            AppState::Pin
        } else if self.powered() {
            AppState::Ready
        } else {
            AppState::Detected
        }
    }

    fn registration_strings(&self, config: &SimConfig) -> Vec<Option<String>> {
        let status = if !self.powered() {
            "0".to_string()
        } else if self.camped(config) {
            self.registration_status.to_string()
        } else {
            "2".to_string()
        };
        let mut fields = vec![None; 11];
        fields[0] = Some(status);
        fields[1] = Some("0x00FF".to_string());
        fields[2] = Some("0x0001".to_string());
        fields[3] = Some(config.network.technology.clone());
        fields[5] = Some("1".to_string());
        fields
    }

    fn apply(&mut self, config: &SimConfig, request: RilRequest) -> Reply {
        match request {
            RilRequest::RadioPower { on: true } => {
                self.radio = RadioState::On;
                Reply::ok(RilResponse::Empty)
                    .then(Unsolicited::RadioStateChanged)
                    .then(Unsolicited::SimStatusChanged)
            }
            RilRequest::RadioPower { on: false } => {
                self.radio = RadioState::Off;
                let reply = Reply::ok(RilResponse::Empty).then(Unsolicited::RadioStateChanged);
                if self.calls.is_empty() {
                    reply
                } else {
                    self.calls.clear();
                    reply.then(Unsolicited::DataCallListChanged(Vec::new()))
                }
            }
            RilRequest::GetSimStatus => Reply::ok(RilResponse::CardStatus(CardStatus {
                card_state: if config.sim.present {
                    CardState::Present
                } else {
                    CardState::Absent
                },
                app_state: self.app_state(config),
            })),
            RilRequest::EnterSimPin { pin } => {
                if !config.sim.present {
                    return Reply::fail(RilErrno::SimAbsent);
                }
                match config.sim.pin.as_deref() {
                    Some(expected) if expected == pin => {
                        self.sim_locked = false;
                        info!("SIM unlocked");
                        Reply::ok(RilResponse::Empty).then(Unsolicited::SimStatusChanged)
                    }
                    Some(_) => Reply::fail(RilErrno::PasswordIncorrect),
                    None => Reply::ok(RilResponse::Empty),
                }
            }
            RilRequest::GetImsi => {
                if config.sim.present {
                    Reply::ok(RilResponse::Text(config.sim.imsi.clone()))
                } else {
                    Reply::fail(RilErrno::SimAbsent)
                }
            }
            RilRequest::GetImei => Reply::ok(RilResponse::Text(config.sim.imei.clone())),
            RilRequest::SignalStrength => {
                Reply::ok(RilResponse::SignalStrength(config.network.signal))
            }
            RilRequest::DataRegistrationState => {
                Reply::ok(RilResponse::Strings(self.registration_strings(config)))
            }
            RilRequest::SetInitialAttachApn(apn) => {
                debug!(apn = %apn.apn, protocol = %apn.protocol, "initial attach APN set");
                self.attach_apn = Some(apn);
                Reply::ok(RilResponse::Empty).then(Unsolicited::NetworkStateChanged)
            }
            RilRequest::SetupDataCall(setup) => {
                if !self.registered(config) {
                    debug!(apn = %setup.apn, "data call refused: not registered");
                    return Reply::fail(RilErrno::GenericFailure);
                }
                let cid = self.next_cid;
                self.next_cid += 1;
                let call = active_call(cid);
                info!(cid, apn = %setup.apn, "data call up");
                self.calls.insert(cid, call.clone());
                Reply::ok(RilResponse::DataCall(call))
                    .then(Unsolicited::DataCallListChanged(self.call_list()))
            }
            RilRequest::DataCallList => Reply::ok(RilResponse::DataCallList(self.call_list())),
            RilRequest::DeactivateDataCall { cid, reason } => {
                if self.calls.remove(&cid).is_none() {
                    debug!(cid, "deactivate for unknown cid");
                    return Reply::fail(RilErrno::GenericFailure);
                }
                info!(cid, ?reason, "data call down");
                Reply::ok(RilResponse::Empty)
                    .then(Unsolicited::DataCallListChanged(self.call_list()))
            }
            RilRequest::QueryNetworkSelectionMode => Reply::ok(RilResponse::Ints(vec![0])),
            RilRequest::BasebandVersion => {
                Reply::ok(RilResponse::Text(config.baseband_version.clone()))
            }
            RilRequest::SendSms { .. } => {
                let message_ref = self.next_message_ref;
                self.next_message_ref += 1;
                Reply::ok(RilResponse::Sms(SmsResponse {
                    message_ref,
                    ack_pdu: None,
                    error_code: -1,
                }))
            }
        }
    }
}

/// Bearer the simulated network hands out for `cid`.
pub fn active_call(cid: i32) -> DataCallResponse {
    DataCallResponse {
        status: 0,
        suggested_retry_time: -1,
        cid,
        active: DataCallResponse::ACTIVE_UP,
        protocol: "IP".to_string(),
        ifname: format!("ifname{cid}"),
        addresses: format!("10.0.0.{}", cid + 1),
        dnses: "8.8.8.8".to_string(),
        gateways: "10.0.0.99".to_string(),
        pcscf: String::new(),
        mtu: 1500,
    }
}

// ─── Delivery ────────────────────────────────────────────────────────────────

fn deliver(env: &EnvSlot, batch: Batch) {
    let Some(env) = lock(env).clone() else {
        debug!(len = batch.len(), "no environment registered, dropping batch");
        return;
    };
    for out in batch {
        match out {
            Outbound::Complete {
                token,
                error,
                response,
            } => {
                trace!(token = token.0, ?error, "completing request");
                env.on_request_complete(token, error, response);
            }
            Outbound::Notify(u) => env.on_unsolicited_response(u),
        }
    }
}

/// Delivers batches from a named thread after a fixed latency.
struct DeliveryWorker {
    tx: Sender<Batch>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeliveryWorker {
    fn spawn(env: EnvSlot, latency: Duration) -> anyhow::Result<Self> {
        let (tx, rx) = bounded(DELIVERY_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("ril-sim-delivery".into())
            .spawn(move || delivery_worker(rx, env, latency, flag))?;
        Ok(Self {
            tx,
            shutdown,
            handle: Some(handle),
        })
    }

    fn send(&self, batch: Batch) {
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("delivery queue full, dropping batch"),
            Err(TrySendError::Disconnected(_)) => debug!("delivery worker gone"),
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // The last reference may be released by a callback running on
            // the worker itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn delivery_worker(rx: Receiver<Batch>, env: EnvSlot, latency: Duration, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(batch) => {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                deliver(&env, batch);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("delivery worker stopped");
}

// ─── RilSimulator ────────────────────────────────────────────────────────────

pub struct RilSimulator {
    config: SimConfig,
    env: EnvSlot,
    model: Mutex<Model>,
    worker: Option<DeliveryWorker>,
}

impl RilSimulator {
    pub fn new(config: SimConfig) -> anyhow::Result<Arc<Self>> {
        let env: EnvSlot = Arc::new(Mutex::new(None));
        let worker = match config.delivery {
            DeliveryMode::Inline => None,
            DeliveryMode::Worker { latency } => Some(DeliveryWorker::spawn(env.clone(), latency)?),
        };
        Ok(Arc::new(Self {
            model: Mutex::new(Model::new(&config)),
            config,
            env,
            worker,
        }))
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn model(&self) -> MutexGuard<'_, Model> {
        lock(&self.model)
    }

    fn dispatch(&self, batch: Batch) {
        match &self.worker {
            Some(worker) => worker.send(batch),
            None => deliver(&self.env, batch),
        }
    }

    // ─── Hooks ───────────────────────────────────────────────────────────────

    /// Answer the next `kind` request with `error`, leaving the model alone.
    pub fn fail_next(&self, kind: RequestKind, error: RilErrno) {
        self.model().failures.insert(kind, error);
    }

    /// While set, answers are parked until [`release_held`](Self::release_held).
    pub fn hold_completions(&self, hold: bool) {
        self.model().hold = hold;
    }

    pub fn held_count(&self) -> usize {
        self.model().held.len()
    }

    pub fn release_held(&self) {
        let held = std::mem::take(&mut self.model().held);
        for h in held {
            self.dispatch(h.batch);
        }
    }

    /// Drop an active call as the network would.
    pub fn drop_data_call(&self, cid: i32) -> bool {
        let calls = {
            let mut model = self.model();
            if model.calls.remove(&cid).is_none() {
                return false;
            }
            model.call_list()
        };
        info!(cid, "network dropped data call");
        self.dispatch(vec![Outbound::Notify(Unsolicited::DataCallListChanged(calls))]);
        true
    }

    pub fn inject(&self, u: Unsolicited) {
        self.dispatch(vec![Outbound::Notify(u)]);
    }

    /// Change the registration code the network reports and announce it.
    pub fn set_registration_status(&self, code: i32) {
        self.model().registration_status = code;
        self.dispatch(vec![Outbound::Notify(Unsolicited::NetworkStateChanged)]);
    }

    pub fn refuse_init(&self, refuse: bool) {
        self.model().refuse_init = refuse;
    }

    pub fn active_calls(&self) -> Vec<DataCallResponse> {
        self.model().call_list()
    }

    pub fn is_sim_locked(&self) -> bool {
        self.model().sim_locked
    }

    pub fn count_of(&self, kind: RequestKind) -> usize {
        self.model().requests.iter().filter(|k| **k == kind).count()
    }
}

impl RadioInterface for RilSimulator {
    fn init(&self, env: Arc<dyn RilEnv>) -> bool {
        if self.model().refuse_init {
            warn!("simulator refusing registration");
            return false;
        }
        *lock(&self.env) = Some(env);
        info!(version = %self.config.baseband_version, "simulator registered");
        self.dispatch(vec![
            Outbound::Notify(Unsolicited::RadioStateChanged),
            Outbound::Notify(Unsolicited::SimStatusChanged),
        ]);
        true
    }

    fn on_request(&self, token: TokenId, request: RilRequest) {
        let batch = {
            let mut model = self.model();
            let kind = request.kind();
            model.requests.push(kind);
            let reply = match model.failures.remove(&kind) {
                Some(error) => {
                    debug!(token = token.0, ?kind, ?error, "injected failure");
                    Reply::fail(error)
                }
                None => model.apply(&self.config, request),
            };
            let batch = reply.into_batch(token);
            if model.hold {
                trace!(token = token.0, ?kind, "holding completion");
                model.held.push(Held { token, batch });
                return;
            }
            batch
        };
        self.dispatch(batch);
    }

    fn on_state_request(&self) -> RadioState {
        self.model().radio
    }

    fn on_cancel(&self, token: TokenId) {
        let held = {
            let mut model = self.model();
            let Some(pos) = model.held.iter().position(|h| h.token == token) else {
                return;
            };
            let held = model.held.remove(pos);
            // A cancelled setup never reached the caller; retract its call.
            if let Some(Outbound::Complete {
                response: RilResponse::DataCall(call),
                ..
            }) = held.batch.first()
            {
                model.calls.remove(&call.cid);
            }
            held
        };
        debug!(token = held.token.0, "cancelling held request");
        self.dispatch(vec![Outbound::Complete {
            token,
            error: RilErrno::Cancelled,
            response: RilResponse::Empty,
        }]);
    }

    fn version(&self) -> Option<String> {
        Some(self.config.baseband_version.clone())
    }
}
