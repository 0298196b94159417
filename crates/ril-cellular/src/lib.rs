//! Cellular connection manager over an asynchronous radio interface layer.
//!
//! - **ril**: request tokens, typed payloads and the radio transport
//! - **device**: power sequencing, readiness gates, context arena, singletons
//! - **network**: registration, attach and signal quality
//! - **context**: the per-connection stage ladder, blocking or event-driven
//! - **information** / **sms**: identity queries and SMS submission

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod event;
pub mod gate;
pub mod information;
pub mod netif;
pub mod network;
pub mod pdp;
pub mod ril;
pub mod sms;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{CellularConfig, ContextConfig, Credentials, DeviceConfig, StageTimeouts};
pub use context::{CellularContext, ConnectionStatus, ContextId, Operation};
pub use device::{CellularDevice, CellularProperty, ReadinessGate, SimState};
pub use error::{CellularError, Result};
pub use event::{CellularEvent, EventQueue, StatusCallback};
pub use gate::GateMode;
pub use information::{CellularInformation, SerialNumberType};
pub use netif::{InterfaceConfig, NetworkStack};
pub use network::{
    AttachStatus, CellularNetwork, RadioAccessTechnology, RegistrationMode, RegistrationParams,
    RegistrationSource, RegistrationStatus, RegistrationType, SignalQuality,
};
pub use pdp::{PdpContextParams, PdpType};
pub use sms::CellularSms;
