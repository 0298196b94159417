//! Typed request, response and notification shapes exchanged with the
//! radio interface library.
//!
//! The transport forwards these values untouched; each component decodes
//! the response shapes it asked for.

use crate::error::{CellularError, Result};

// ─── Radio state ─────────────────────────────────────────────────────────────

/// Power and availability state reported by the radio interface library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    Off,
    Unavailable,
    SimNotReady,
    SimLockedOrAbsent,
    SimReady,
    RuimNotReady,
    RuimReady,
    RuimLockedOrAbsent,
    NvNotReady,
    NvReady,
    On,
    Unknown(i32),
}

impl RadioState {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => RadioState::Off,
            1 => RadioState::Unavailable,
            2 => RadioState::SimNotReady,
            3 => RadioState::SimLockedOrAbsent,
            4 => RadioState::SimReady,
            5 => RadioState::RuimNotReady,
            6 => RadioState::RuimReady,
            7 => RadioState::RuimLockedOrAbsent,
            8 => RadioState::NvNotReady,
            9 => RadioState::NvReady,
            10 => RadioState::On,
            other => RadioState::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            RadioState::Off => 0,
            RadioState::Unavailable => 1,
            RadioState::SimNotReady => 2,
            RadioState::SimLockedOrAbsent => 3,
            RadioState::SimReady => 4,
            RadioState::RuimNotReady => 5,
            RadioState::RuimReady => 6,
            RadioState::RuimLockedOrAbsent => 7,
            RadioState::NvNotReady => 8,
            RadioState::NvReady => 9,
            RadioState::On => 10,
            RadioState::Unknown(code) => code,
        }
    }

    /// The library can accept requests (a powered-off radio still can).
    pub fn is_available(self) -> bool {
        self != RadioState::Unavailable
    }

    /// The radio is powered.
    pub fn is_on(self) -> bool {
        !matches!(
            self,
            RadioState::Off | RadioState::Unavailable | RadioState::Unknown(_)
        )
    }
}

// ─── Error codes ─────────────────────────────────────────────────────────────

/// Completion error code reported by the radio interface library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RilErrno {
    Success,
    RadioNotAvailable,
    GenericFailure,
    PasswordIncorrect,
    RequestNotSupported,
    Cancelled,
    SimAbsent,
    Other(i32),
}

impl RilErrno {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => RilErrno::Success,
            1 => RilErrno::RadioNotAvailable,
            2 => RilErrno::GenericFailure,
            3 => RilErrno::PasswordIncorrect,
            6 => RilErrno::RequestNotSupported,
            7 => RilErrno::Cancelled,
            11 => RilErrno::SimAbsent,
            other => RilErrno::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == RilErrno::Success
    }

    /// Translate into the crate taxonomy.
    pub fn into_result(self) -> Result<()> {
        match self {
            RilErrno::Success => Ok(()),
            RilErrno::RequestNotSupported => Err(CellularError::Unsupported),
            _ => Err(CellularError::DeviceError),
        }
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// Request identifiers, numbered as the radio interface library numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    GetSimStatus = 1,
    EnterSimPin = 2,
    GetImsi = 11,
    SignalStrength = 19,
    DataRegistrationState = 21,
    RadioPower = 23,
    SendSms = 25,
    SetupDataCall = 27,
    GetImei = 38,
    DeactivateDataCall = 41,
    QueryNetworkSelectionMode = 45,
    BasebandVersion = 51,
    DataCallList = 57,
    SetInitialAttachApn = 111,
}

impl RequestKind {
    pub fn id(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    None = 0,
    Pap = 1,
    Chap = 2,
    PapOrChap = 3,
}

/// Payload of `SET_INITIAL_ATTACH_APN`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitialAttachApn {
    pub apn: String,
    pub protocol: String,
    pub auth: AuthType,
    pub username: String,
    pub password: String,
}

/// Payload of `SETUP_DATA_CALL`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataCallSetup {
    /// Native radio technology code plus two, as the library expects.
    pub radio_technology: i32,
    pub profile: i32,
    pub apn: String,
    pub username: String,
    pub password: String,
    pub auth: AuthType,
    pub protocol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeactivateReason {
    #[default]
    NoReason = 0,
    RadioShutdown = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RilRequest {
    GetSimStatus,
    EnterSimPin { pin: String },
    GetImsi,
    SignalStrength,
    DataRegistrationState,
    RadioPower { on: bool },
    SendSms { smsc: Option<String>, pdu: String },
    SetupDataCall(DataCallSetup),
    GetImei,
    DeactivateDataCall { cid: i32, reason: DeactivateReason },
    QueryNetworkSelectionMode,
    BasebandVersion,
    DataCallList,
    SetInitialAttachApn(InitialAttachApn),
}

impl RilRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            RilRequest::GetSimStatus => RequestKind::GetSimStatus,
            RilRequest::EnterSimPin { .. } => RequestKind::EnterSimPin,
            RilRequest::GetImsi => RequestKind::GetImsi,
            RilRequest::SignalStrength => RequestKind::SignalStrength,
            RilRequest::DataRegistrationState => RequestKind::DataRegistrationState,
            RilRequest::RadioPower { .. } => RequestKind::RadioPower,
            RilRequest::SendSms { .. } => RequestKind::SendSms,
            RilRequest::SetupDataCall(_) => RequestKind::SetupDataCall,
            RilRequest::GetImei => RequestKind::GetImei,
            RilRequest::DeactivateDataCall { .. } => RequestKind::DeactivateDataCall,
            RilRequest::QueryNetworkSelectionMode => RequestKind::QueryNetworkSelectionMode,
            RilRequest::BasebandVersion => RequestKind::BasebandVersion,
            RilRequest::DataCallList => RequestKind::DataCallList,
            RilRequest::SetInitialAttachApn(_) => RequestKind::SetInitialAttachApn,
        }
    }
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Absent,
    Present,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Unknown,
    Detected,
    Pin,
    Puk,
    SubscriptionPerso,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus {
    pub card_state: CardState,
    pub app_state: AppState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GwSignalStrength {
    pub signal_strength: i32,
    pub bit_error_rate: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LteSignalStrength {
    pub signal_strength: i32,
    pub rsrp: i32,
    pub rsrq: i32,
    pub rssnr: i32,
    pub cqi: i32,
    pub timing_advance: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalStrength {
    pub gw: GwSignalStrength,
    pub lte: LteSignalStrength,
}

/// One entry of a data-call list or a `SETUP_DATA_CALL` answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataCallResponse {
    /// PDP fail cause, 0 when the call is healthy.
    pub status: i32,
    pub suggested_retry_time: i32,
    pub cid: i32,
    /// 0 inactive, 1 link down, 2 link up.
    pub active: i32,
    pub protocol: String,
    pub ifname: String,
    /// Space separated, each optionally with a `/prefix`.
    pub addresses: String,
    pub dnses: String,
    pub gateways: String,
    pub pcscf: String,
    pub mtu: i32,
}

impl DataCallResponse {
    pub const ACTIVE_UP: i32 = 2;

    pub fn is_up(&self) -> bool {
        self.status == 0 && self.cid >= 0 && self.active == Self::ACTIVE_UP
    }

    /// Carries enough to route beyond the local link.
    pub fn is_routable(&self) -> bool {
        !self.addresses.trim().is_empty() && !self.gateways.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsResponse {
    pub message_ref: i32,
    pub ack_pdu: Option<String>,
    pub error_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RilResponse {
    #[default]
    Empty,
    CardStatus(CardStatus),
    Strings(Vec<Option<String>>),
    Ints(Vec<i32>),
    Text(String),
    SignalStrength(SignalStrength),
    DataCall(DataCallResponse),
    DataCallList(Vec<DataCallResponse>),
    Sms(SmsResponse),
}

// ─── Unsolicited ─────────────────────────────────────────────────────────────

/// Out-of-band notifications pushed by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    RadioStateChanged,
    SimStatusChanged,
    NetworkStateChanged,
    SignalStrength(SignalStrength),
    DataCallListChanged(Vec<DataCallResponse>),
    Other { id: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_state_codes() {
        for code in 0..=10 {
            assert_eq!(RadioState::from_raw(code).raw(), code);
        }
        assert_eq!(RadioState::from_raw(99), RadioState::Unknown(99));
        assert!(RadioState::Off.is_available());
        assert!(!RadioState::Off.is_on());
        assert!(!RadioState::Unavailable.is_available());
        assert!(RadioState::SimReady.is_on());
        assert!(!RadioState::Unknown(99).is_on());
    }

    #[test]
    fn errno_translation() {
        assert_eq!(RilErrno::Success.into_result(), Ok(()));
        assert_eq!(
            RilErrno::RequestNotSupported.into_result(),
            Err(CellularError::Unsupported)
        );
        assert_eq!(
            RilErrno::GenericFailure.into_result(),
            Err(CellularError::DeviceError)
        );
        assert_eq!(
            RilErrno::from_raw(7).into_result(),
            Err(CellularError::DeviceError)
        );
        assert_eq!(RilErrno::from_raw(42), RilErrno::Other(42));
    }

    #[test]
    fn request_ids_follow_ril_numbering() {
        assert_eq!(RilRequest::RadioPower { on: true }.kind().id(), 23);
        assert_eq!(
            RilRequest::SetInitialAttachApn(InitialAttachApn::default())
                .kind()
                .id(),
            111
        );
        assert_eq!(RilRequest::DataCallList.kind().id(), 57);
    }

    #[test]
    fn data_call_up_and_routable() {
        let mut call = DataCallResponse {
            cid: 0,
            active: 2,
            addresses: "10.0.0.1".into(),
            gateways: "10.0.0.99".into(),
            ..Default::default()
        };
        assert!(call.is_up());
        assert!(call.is_routable());
        call.gateways.clear();
        assert!(!call.is_routable());
        call.status = 33;
        assert!(!call.is_up());
    }
}
