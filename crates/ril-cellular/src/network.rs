//! # Network registration
//!
//! Tracks registration, attach and signal quality for one device and
//! provides the register/attach stages a context walks through.
//!
//! Registration starts with `SET_INITIAL_ATTACH_APN`; after that the radio
//! searches on its own and we learn the outcome by polling
//! `DATA_REGISTRATION_STATE`, either when the attach APN request completes,
//! when the radio pushes a network-state change, or on the retry schedule
//! while a blocking caller waits. Attach is derived from data registration.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::Operation;
use crate::device::CellularDevice;
use crate::error::{CellularError, Result};
use crate::event::{CellularEvent, StatusCallback};
use crate::gate::{wait_with_retries, Gate, GateEntry, GateMode};
use crate::ril::{
    send_and_wait, InitialAttachApn, RilErrno, RilRequest, RilResponse, SignalStrength,
    Transport, Unsolicited,
};

// ─── Radio access technology ─────────────────────────────────────────────────

/// Portable radio access technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum RadioAccessTechnology {
    #[default]
    Unknown,
    Gsm,
    GsmCompact,
    Utran,
    Egprs,
    Hsdpa,
    Hsupa,
    HsdpaHsupa,
    EUtran,
    CatM1,
    Nb1,
}

/// Technology codes as the radio interface library numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RilRadioTechnology {
    Unknown,
    Gprs,
    Edge,
    Umts,
    Hsdpa,
    Hsupa,
    Hspa,
    Lte,
    Gsm,
    Other(i32),
}

impl RilRadioTechnology {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => RilRadioTechnology::Unknown,
            1 => RilRadioTechnology::Gprs,
            2 => RilRadioTechnology::Edge,
            3 => RilRadioTechnology::Umts,
            9 => RilRadioTechnology::Hsdpa,
            10 => RilRadioTechnology::Hsupa,
            11 => RilRadioTechnology::Hspa,
            14 => RilRadioTechnology::Lte,
            16 => RilRadioTechnology::Gsm,
            other => RilRadioTechnology::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            RilRadioTechnology::Unknown => 0,
            RilRadioTechnology::Gprs => 1,
            RilRadioTechnology::Edge => 2,
            RilRadioTechnology::Umts => 3,
            RilRadioTechnology::Hsdpa => 9,
            RilRadioTechnology::Hsupa => 10,
            RilRadioTechnology::Hspa => 11,
            RilRadioTechnology::Lte => 14,
            RilRadioTechnology::Gsm => 16,
            RilRadioTechnology::Other(code) => code,
        }
    }
}

impl RadioAccessTechnology {
    /// Anything without a GSM/UMTS counterpart goes out as LTE.
    pub fn to_ril(self) -> RilRadioTechnology {
        match self {
            RadioAccessTechnology::Gsm => RilRadioTechnology::Gsm,
            RadioAccessTechnology::Utran => RilRadioTechnology::Umts,
            RadioAccessTechnology::Egprs => RilRadioTechnology::Edge,
            RadioAccessTechnology::Hsdpa => RilRadioTechnology::Hsdpa,
            RadioAccessTechnology::Hsupa => RilRadioTechnology::Hsupa,
            RadioAccessTechnology::HsdpaHsupa => RilRadioTechnology::Hspa,
            _ => RilRadioTechnology::Lte,
        }
    }

    /// Technology code from a registration report. Codes outside the GSM
    /// and UMTS families fold onto NB1.
    pub fn from_ril_code(code: i32) -> Self {
        match code {
            0 => RadioAccessTechnology::Unknown,
            1 => RadioAccessTechnology::Egprs,
            3 => RadioAccessTechnology::Utran,
            9 => RadioAccessTechnology::Hsdpa,
            10 => RadioAccessTechnology::Hsupa,
            11 => RadioAccessTechnology::HsdpaHsupa,
            _ => RadioAccessTechnology::Nb1,
        }
    }
}

// ─── Status types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum RegistrationStatus {
    #[default]
    StatusNotAvailable,
    NotRegistered,
    RegisteredHomeNetwork,
    SearchingNetwork,
    RegistrationDenied,
    Unknown,
    RegisteredRoaming,
}

impl RegistrationStatus {
    pub fn from_code(code: i32) -> Self {
        // 10..=14 are the emergency-only variants of 0..=4.
        let base = if (10..=14).contains(&code) && code != 11 {
            code - 10
        } else {
            code
        };
        match base {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::RegisteredHomeNetwork,
            2 => RegistrationStatus::SearchingNetwork,
            3 => RegistrationStatus::RegistrationDenied,
            4 => RegistrationStatus::Unknown,
            5 => RegistrationStatus::RegisteredRoaming,
            _ => RegistrationStatus::StatusNotAvailable,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHomeNetwork | RegistrationStatus::RegisteredRoaming
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum AttachStatus {
    #[default]
    Detached,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    Automatic,
    Manual,
}

/// Which registration report an URC subscription refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationType {
    /// `+CREG`
    CircuitSwitched,
    /// `+CGREG`
    Gprs,
    /// `+CEREG`
    Eps,
}

/// Received signal strength in dBm and bit error rate; -1 is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SignalQuality {
    pub rssi: i32,
    pub ber: i32,
}

impl Default for SignalQuality {
    fn default() -> Self {
        Self { rssi: -1, ber: -1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationParams {
    pub status: RegistrationStatus,
    pub act: RadioAccessTechnology,
    pub lac: i32,
    pub cell_id: i32,
    pub reject_cause: i32,
    pub max_data_calls: i32,
    pub tac: i32,
    pub physical_cell_id: i32,
    pub eutran_cell_id: i32,
    pub csg_id: i32,
    pub timing_advance: i32,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            status: RegistrationStatus::StatusNotAvailable,
            act: RadioAccessTechnology::Unknown,
            lac: -1,
            cell_id: -1,
            reject_cause: -1,
            max_data_calls: -1,
            tac: -1,
            physical_cell_id: -1,
            eutran_cell_id: -1,
            csg_id: -1,
            timing_advance: -1,
        }
    }
}

impl RegistrationParams {
    /// Parse the eleven-string `DATA_REGISTRATION_STATE` answer. Missing or
    /// malformed fields stay at their defaults.
    pub fn from_strings(fields: &[Option<String>]) -> Self {
        let field = |i: usize| fields.get(i).and_then(|f| f.as_deref());
        let num = |i: usize| field(i).and_then(parse_number).unwrap_or(-1);
        let hex = |i: usize| field(i).and_then(parse_hex).unwrap_or(-1);
        Self {
            status: field(0)
                .and_then(parse_number)
                .map(RegistrationStatus::from_code)
                .unwrap_or_default(),
            lac: hex(1),
            cell_id: hex(2),
            act: field(3)
                .and_then(parse_number)
                .map(RadioAccessTechnology::from_ril_code)
                .unwrap_or_default(),
            reject_cause: num(4),
            max_data_calls: num(5),
            tac: num(6),
            physical_cell_id: num(7),
            eutran_cell_id: num(8),
            csg_id: num(9),
            timing_advance: num(10),
        }
    }
}

fn parse_number(s: &str) -> Option<i32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_hex(s: &str) -> Option<i32> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    i32::from_str_radix(digits, 16).ok()
}

/// `raw` in 0..=31 maps to dBm; 99 means no signal and reports 0.
fn rssi_from_raw(raw: i32) -> Result<i32> {
    match raw {
        0..=31 => Ok(-113 + 2 * raw),
        99 => Ok(0),
        _ => Err(CellularError::DeviceError),
    }
}

pub(crate) fn decode_signal(
    strength: &SignalStrength,
    rat: RilRadioTechnology,
) -> Result<SignalQuality> {
    if rat == RilRadioTechnology::Lte {
        return Ok(SignalQuality {
            rssi: rssi_from_raw(strength.lte.signal_strength)?,
            ber: -1,
        });
    }
    let rssi = rssi_from_raw(strength.gw.signal_strength)?;
    let ber = strength.gw.bit_error_rate;
    if !(0..=99).contains(&ber) {
        return Err(CellularError::DeviceError);
    }
    Ok(SignalQuality { rssi, ber })
}

fn decode_registration(error: RilErrno, response: RilResponse) -> Result<RegistrationParams> {
    error.into_result().map_err(|_| CellularError::DeviceError)?;
    match response {
        RilResponse::Strings(fields) => Ok(RegistrationParams::from_strings(&fields)),
        _ => Err(CellularError::DeviceError),
    }
}

// ─── RegistrationSource ──────────────────────────────────────────────────────

/// Register/attach stages a context walks through.
pub trait RegistrationSource: Send + Sync {
    fn register_to_network(&self, apn: &InitialAttachApn, mode: GateMode) -> Result<()>;
    fn attach_to_network(&self, mode: GateMode) -> Result<()>;
    /// Give up a pending register or attach attempt; blocked callers see
    /// `error`.
    fn abandon(&self, stage: Operation, error: CellularError);
    /// Native technology a data call should be set up on.
    fn data_technology(&self) -> RilRadioTechnology;
}

// ─── CellularNetwork ─────────────────────────────────────────────────────────

struct NetworkState {
    rat: RadioAccessTechnology,
    registration: RegistrationParams,
    attach: AttachStatus,
    signal: SignalQuality,
    status_cb: Option<StatusCallback>,
}

pub struct CellularNetwork {
    me: Weak<CellularNetwork>,
    device: Weak<CellularDevice>,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    registration_gate: Gate,
    attach_gate: Gate,
    state: Mutex<NetworkState>,
}

impl CellularNetwork {
    pub fn new(
        device: Weak<CellularDevice>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| CellularNetwork {
            me: me.clone(),
            device,
            transport,
            request_timeout,
            registration_gate: Gate::new("registration"),
            attach_gate: Gate::new("attach"),
            state: Mutex::new(NetworkState {
                rat: RadioAccessTechnology::Unknown,
                registration: RegistrationParams::default(),
                attach: AttachStatus::Detached,
                signal: SignalQuality::default(),
                status_cb: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, callback: Option<StatusCallback>) {
        self.lock().status_cb = callback;
    }

    pub fn set_access_technology(&self, rat: RadioAccessTechnology) -> Result<()> {
        self.lock().rat = rat;
        debug!(?rat, native = rat.to_ril().code(), "access technology set");
        Ok(())
    }

    pub fn access_technology(&self) -> RadioAccessTechnology {
        self.lock().rat
    }

    pub fn ril_radio_technology(&self) -> RilRadioTechnology {
        self.lock().rat.to_ril()
    }

    pub fn get_registration_params(&self) -> Result<RegistrationParams> {
        let params = send_and_wait(
            self.transport.as_ref(),
            RilRequest::DataRegistrationState,
            self.request_timeout,
            decode_registration,
        )?;
        self.apply_registration(params.clone());
        Ok(params)
    }

    /// Last registration report, without asking the radio.
    pub fn registration_params(&self) -> RegistrationParams {
        self.lock().registration.clone()
    }

    pub fn get_signal_quality(&self) -> Result<SignalQuality> {
        let rat = self.ril_radio_technology();
        let quality = send_and_wait(
            self.transport.as_ref(),
            RilRequest::SignalStrength,
            self.request_timeout,
            move |err, resp| {
                err.into_result().map_err(|_| CellularError::DeviceError)?;
                match resp {
                    RilResponse::SignalStrength(s) => decode_signal(&s, rat),
                    _ => Err(CellularError::DeviceError),
                }
            },
        )?;
        self.lock().signal = quality;
        Ok(quality)
    }

    pub fn signal_quality(&self) -> SignalQuality {
        self.lock().signal
    }

    pub fn get_attach(&self) -> AttachStatus {
        self.lock().attach
    }

    pub fn detach(&self) -> Result<()> {
        Err(CellularError::Unsupported)
    }

    pub fn scan_plmn(&self) -> Result<Vec<String>> {
        Err(CellularError::Unsupported)
    }

    pub fn set_ciot_optimization_config(&self, _supported: u8) -> Result<()> {
        Err(CellularError::Unsupported)
    }

    pub fn get_operator_names(&self) -> Result<Vec<String>> {
        Err(CellularError::Unsupported)
    }

    pub fn get_ciot_ue_optimization_config(&self) -> Result<(u8, u8)> {
        Err(CellularError::Unsupported)
    }

    pub fn get_ciot_network_optimization_config(&self) -> Result<u8> {
        Err(CellularError::Unsupported)
    }

    /// Last 3GPP cause reported by the modem; the radio layer never exposes one.
    pub fn get_3gpp_error(&self) -> Result<i32> {
        Err(CellularError::Unsupported)
    }

    pub fn get_operator_params(&self) -> Result<String> {
        Err(CellularError::Unsupported)
    }

    pub fn set_receive_period(
        &self,
        _mode: u8,
        _act: RadioAccessTechnology,
        _edrx_value: u8,
    ) -> Result<()> {
        Err(CellularError::Unsupported)
    }

    /// Whether the radio lists a live data call, `cid` narrowing the match.
    /// A failed query counts as no context.
    pub fn is_active_context(&self, cid: Option<i32>) -> bool {
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
        );
        match calls {
            Ok(calls) => calls
                .iter()
                .any(|c| c.is_up() && cid.map_or(true, |id| c.cid == id)),
            Err(e) => {
                debug!(error = %e, "data call list unavailable");
                false
            }
        }
    }

    pub fn get_network_registering_mode(&self) -> Result<RegistrationMode> {
        send_and_wait(
            self.transport.as_ref(),
            RilRequest::QueryNetworkSelectionMode,
            self.request_timeout,
            |err, resp| {
                err.into_result().map_err(|_| CellularError::DeviceError)?;
                match resp {
                    RilResponse::Ints(v) if v.first() == Some(&1) => Ok(RegistrationMode::Manual),
                    RilResponse::Ints(v) if v.first() == Some(&0) => {
                        Ok(RegistrationMode::Automatic)
                    }
                    _ => Err(CellularError::DeviceError),
                }
            },
        )
    }

    /// The radio reports EPS registration on its own; other reports are not
    /// available.
    pub fn set_registration_urc(&self, kind: RegistrationType, _on: bool) -> Result<()> {
        match kind {
            RegistrationType::Eps => Ok(()),
            RegistrationType::CircuitSwitched | RegistrationType::Gprs => {
                Err(CellularError::Unsupported)
            }
        }
    }

    // ─── Polling ─────────────────────────────────────────────────────────────

    fn retry_schedule(&self) -> Vec<Duration> {
        self.device
            .upgrade()
            .map(|d| d.retry_timeouts())
            .unwrap_or_default()
    }

    fn poll_registration(&self) {
        let weak = self.me.clone();
        let sent = self.transport.send(
            RilRequest::DataRegistrationState,
            Box::new(move |c| {
                let Some(network) = weak.upgrade() else { return };
                match decode_registration(c.error, c.response) {
                    Ok(params) => network.apply_registration(params),
                    Err(e) => debug!(error = %e, "registration poll failed"),
                }
            }),
        );
        if let Err(e) = sent {
            debug!(error = %e, "registration poll not sent");
            self.fail_stage(&self.registration_gate, Operation::Register, e);
            self.fail_stage(&self.attach_gate, Operation::Attach, e);
        }
    }

    fn on_initial_attach(&self, error: RilErrno) {
        if error.is_success() {
            self.poll_registration();
        } else {
            warn!(?error, "initial attach APN rejected");
            self.fail_stage(&self.registration_gate, Operation::Register, CellularError::DeviceError);
        }
    }

    fn apply_registration(&self, params: RegistrationParams) {
        let status = params.status;
        let (previous, was_attached) = {
            let mut st = self.lock();
            let previous = st.registration.status;
            st.registration = params;
            (previous, st.attach == AttachStatus::Attached)
        };

        if status.is_registered() {
            let opened = self.registration_gate.open();
            if opened || status != previous {
                info!(?status, "registration status changed");
                self.emit(CellularEvent::RegistrationStatusChanged(status));
            }
            if self.attach_gate.is_pending() {
                self.mark_attached();
            }
            return;
        }

        if status != previous {
            debug!(?status, "registration status changed");
            self.emit(CellularEvent::RegistrationStatusChanged(status));
        }
        if previous.is_registered() {
            warn!(?status, "registration lost");
            self.registration_gate.reset();
            self.attach_gate.reset();
            if was_attached {
                self.lock().attach = AttachStatus::Detached;
                self.emit(CellularEvent::AttachStatusChanged(AttachStatus::Detached));
            }
        }
    }

    fn mark_attached(&self) {
        self.lock().attach = AttachStatus::Attached;
        if self.attach_gate.open() {
            info!("attached to packet domain");
            self.emit(CellularEvent::AttachStatusChanged(AttachStatus::Attached));
        }
    }

    fn fail_stage(&self, gate: &Gate, operation: Operation, error: CellularError) {
        if gate.abandon(error) {
            self.emit(CellularEvent::OperationFailed { operation, error });
        }
    }

    fn emit(&self, event: CellularEvent) {
        if let Some(device) = self.device.upgrade() {
            device.broadcast(&event);
        }
        let cb = self.lock().status_cb.clone();
        if let Some(cb) = cb {
            cb(&event);
        }
    }

    pub(crate) fn handle_unsolicited(&self, u: &Unsolicited) {
        match u {
            Unsolicited::NetworkStateChanged => self.poll_registration(),
            Unsolicited::SignalStrength(strength) => {
                match decode_signal(strength, self.ril_radio_technology()) {
                    Ok(quality) => {
                        let changed = {
                            let mut st = self.lock();
                            let changed = st.signal != quality;
                            st.signal = quality;
                            changed
                        };
                        if changed {
                            self.emit(CellularEvent::SignalQualityChanged(quality));
                        }
                    }
                    Err(_) => debug!(?strength, "ignoring out-of-range signal report"),
                }
            }
            _ => {}
        }
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
}

impl RegistrationSource for CellularNetwork {
    fn register_to_network(&self, apn: &InitialAttachApn, mode: GateMode) -> Result<()> {
        if let Some(outcome) = Self::claim(&self.registration_gate, mode) {
            return outcome;
        }
        info!(apn = %apn.apn, protocol = %apn.protocol, "registering to network");
        let weak = self.me.clone();
        let sent = self.transport.send(
            RilRequest::SetInitialAttachApn(apn.clone()),
            Box::new(move |c| {
                if let Some(network) = weak.upgrade() {
                    network.on_initial_attach(c.error);
                }
            }),
        );
        if let Err(e) = sent {
            self.registration_gate.abandon(e);
            return Err(e);
        }
        match mode {
            GateMode::NonBlocking => Ok(()),
            GateMode::Blocking(timeout) => {
                let schedule = self.retry_schedule();
                wait_with_retries(&self.registration_gate, timeout, &schedule, || {
                    self.poll_registration()
                })
            }
        }
    }

    fn attach_to_network(&self, mode: GateMode) -> Result<()> {
        if let Some(outcome) = Self::claim(&self.attach_gate, mode) {
            return outcome;
        }
        if self.lock().registration.status.is_registered() {
            self.mark_attached();
            return Ok(());
        }
        self.poll_registration();
        match mode {
            GateMode::NonBlocking => Ok(()),
            GateMode::Blocking(timeout) => {
                let schedule = self.retry_schedule();
                wait_with_retries(&self.attach_gate, timeout, &schedule, || {
                    self.poll_registration()
                })
            }
        }
    }

    fn abandon(&self, stage: Operation, error: CellularError) {
        let gate = match stage {
            Operation::Register => &self.registration_gate,
            Operation::Attach => &self.attach_gate,
            _ => return,
        };
        if gate.abandon(error) {
            debug!(gate = gate.name(), error = %error, "network attempt abandoned");
        }
    }

    fn data_technology(&self) -> RilRadioTechnology {
        self.lock().rat.to_ril()
    }
}
