//! Loopback radio interface library for exercising `ril-cellular` without a
//! modem.
//!
//! [`RilSimulator`] answers every request the connection manager issues from
//! an in-memory model of the radio, SIM, network and data calls. Scenarios
//! are described in TOML ([`SimConfig`]) and tests steer the model through
//! the hooks on the simulator itself.

pub mod config;
pub mod simulator;

pub use config::{DeliveryMode, SimConfig};
pub use simulator::RilSimulator;
