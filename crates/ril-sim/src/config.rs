use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _};
use ril_cellular::ril::{GwSignalStrength, LteSignalStrength, SignalStrength};
use serde::Deserialize;

pub const SCENARIO_VERSION: u32 = 1;

pub const DEFAULT_BASEBAND_VERSION: &str = "RIL Simulator v12";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfigInput {
    pub version: u32,
    pub baseband_version: Option<String>,
    pub sim: SimCardInput,
    pub network: SimNetworkInput,
    pub delivery: DeliveryInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimCardInput {
    pub present: Option<bool>,
    pub pin: Option<String>,
    pub imsi: Option<String>,
    pub imei: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimNetworkInput {
    pub registration_status: Option<i32>,
    pub technology: Option<String>,
    pub gw_signal: Option<i32>,
    pub gw_ber: Option<i32>,
    pub lte_signal: Option<i32>,
    pub lte_rsrp: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryInput {
    pub mode: Option<String>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCard {
    pub present: bool,
    /// Locks the card until a matching `ENTER_SIM_PIN`.
    pub pin: Option<String>,
    pub imsi: String,
    pub imei: String,
}

impl Default for SimCard {
    fn default() -> Self {
        Self {
            present: true,
            pin: None,
            imsi: "001010123456789".to_string(),
            imei: "490154203237518".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNetwork {
    /// Data registration code reported once the modem is powered and has an
    /// attach APN.
    pub registration_status: i32,
    pub technology: String,
    pub signal: SignalStrength,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self {
            registration_status: 1,
            technology: "14".to_string(),
            signal: SignalStrength {
                gw: GwSignalStrength {
                    signal_strength: 20,
                    bit_error_rate: 0,
                },
                lte: LteSignalStrength {
                    signal_strength: 20,
                    rsrp: 95,
                    ..Default::default()
                },
            },
        }
    }
}

/// How answers reach the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// From inside the request call.
    #[default]
    Inline,
    /// From a worker thread after `latency`.
    Worker { latency: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub version: u32,
    pub baseband_version: String,
    pub sim: SimCard,
    pub network: SimNetwork,
    pub delivery: DeliveryMode,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            version: SCENARIO_VERSION,
            baseband_version: DEFAULT_BASEBAND_VERSION.to_string(),
            sim: SimCard::default(),
            network: SimNetwork::default(),
            delivery: DeliveryMode::Inline,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SimConfigInput {
    pub fn resolve(self) -> anyhow::Result<SimConfig> {
        let version = if self.version == 0 {
            SCENARIO_VERSION
        } else {
            self.version
        };
        if version != SCENARIO_VERSION {
            bail!("Unsupported scenario version {}", version);
        }

        let card_defaults = SimCard::default();
        let sim = SimCard {
            present: self.sim.present.unwrap_or(card_defaults.present),
            pin: non_empty(self.sim.pin),
            imsi: non_empty(self.sim.imsi).unwrap_or(card_defaults.imsi),
            imei: non_empty(self.sim.imei).unwrap_or(card_defaults.imei),
        };

        let net_defaults = SimNetwork::default();
        let signal = SignalStrength {
            gw: GwSignalStrength {
                signal_strength: self
                    .network
                    .gw_signal
                    .unwrap_or(net_defaults.signal.gw.signal_strength)
                    .clamp(0, 99),
                bit_error_rate: self
                    .network
                    .gw_ber
                    .unwrap_or(net_defaults.signal.gw.bit_error_rate),
            },
            lte: LteSignalStrength {
                signal_strength: self
                    .network
                    .lte_signal
                    .unwrap_or(net_defaults.signal.lte.signal_strength)
                    .clamp(0, 99),
                rsrp: self.network.lte_rsrp.unwrap_or(net_defaults.signal.lte.rsrp),
                ..net_defaults.signal.lte
            },
        };
        let network = SimNetwork {
            registration_status: self
                .network
                .registration_status
                .unwrap_or(net_defaults.registration_status),
            technology: non_empty(self.network.technology).unwrap_or(net_defaults.technology),
            signal,
        };

        let latency = Duration::from_millis(self.delivery.latency_ms.unwrap_or(0));
        let delivery = match self.delivery.mode.as_deref().map(str::trim) {
            None | Some("inline") => DeliveryMode::Inline,
            Some("worker") | Some("thread") => DeliveryMode::Worker { latency },
            Some(other) => bail!("Unknown delivery.mode {:?}", other),
        };

        Ok(SimConfig {
            version,
            baseband_version: non_empty(self.baseband_version)
                .unwrap_or_else(|| DEFAULT_BASEBAND_VERSION.to_string()),
            sim,
            network,
            delivery,
        })
    }
}

impl SimConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(SimConfig::default());
        }
        let parsed: SimConfigInput = toml::from_str(input).context("Invalid scenario TOML")?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Answers from a worker thread after `latency`.
    pub fn with_worker(mut self, latency: Duration) -> Self {
        self.delivery = DeliveryMode::Worker { latency };
        self
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.sim.pin = Some(pin.to_string());
        self
    }

    pub fn with_registration_status(mut self, code: i32) -> Self {
        self.network.registration_status = code;
        self
    }
}
