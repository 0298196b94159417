use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde::Deserialize;

use crate::pdp::PdpType;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CellularConfigInput {
    pub version: u32,
    pub device: DeviceConfigInput,
    pub context: ContextConfigInput,
    pub event_queue: EventQueueConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfigInput {
    pub request_timeout_ms: Option<u64>,
    pub retry_timeouts_s: Option<Vec<u64>>,
    pub sim_pin: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContextConfigInput {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pdp_type: Option<String>,
    pub plmn: Option<String>,
    pub blocking: Option<bool>,
    pub device_timeout_ms: Option<u64>,
    pub sim_timeout_ms: Option<u64>,
    pub registration_timeout_ms: Option<u64>,
    pub attach_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventQueueConfigInput {
    pub capacity: Option<usize>,
    pub dispatcher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Bound on a single blocking request.
    pub request_timeout: Duration,
    /// Re-poll cadence while a blocking gate waits on the radio.
    pub retry_timeouts: Vec<Duration>,
    pub sim_pin: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            retry_timeouts: [1, 2, 4, 8, 16, 32, 64, 128]
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            sim_pin: None,
        }
    }
}

/// Per-stage budgets, each re-armed when its stage starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub device: Duration,
    pub sim: Duration,
    pub registration: Duration,
    pub attach: Duration,
    pub connect: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            device: Duration::from_secs(5),
            sim: Duration::from_secs(5),
            registration: Duration::from_secs(180),
            attach: Duration::from_secs(180),
            connect: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(apn: Option<&str>, username: Option<&str>, password: Option<&str>) -> Self {
        Self {
            apn: non_empty(apn.map(str::to_string)),
            username: non_empty(username.map(str::to_string)),
            password: non_empty(password.map(str::to_string)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    pub credentials: Credentials,
    pub pdp_type: PdpType,
    pub plmn: Option<String>,
    pub blocking: bool,
    pub timeouts: StageTimeouts,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            pdp_type: PdpType::Default,
            plmn: None,
            blocking: true,
            timeouts: StageTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatcherMode {
    /// A dedicated thread drains the queue.
    #[default]
    Thread,
    /// The owner calls `dispatch_pending`.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQueueConfig {
    pub capacity: usize,
    pub dispatcher: DispatcherMode,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            dispatcher: DispatcherMode::Thread,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellularConfig {
    pub version: u32,
    pub device: DeviceConfig,
    pub context: ContextConfig,
    pub event_queue: EventQueueConfig,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            device: DeviceConfig::default(),
            context: ContextConfig::default(),
            event_queue: EventQueueConfig::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl CellularConfigInput {
    pub fn resolve(self) -> anyhow::Result<CellularConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("Unsupported config version {}", version);
        }

        let device_defaults = DeviceConfig::default();
        let device = DeviceConfig {
            request_timeout: millis_or(
                self.device.request_timeout_ms,
                device_defaults.request_timeout,
            )
            .max(Duration::from_millis(10)),
            retry_timeouts: self
                .device
                .retry_timeouts_s
                .map(|secs| secs.into_iter().map(Duration::from_secs).collect())
                .unwrap_or(device_defaults.retry_timeouts),
            sim_pin: non_empty(self.device.sim_pin),
        };

        let pdp_type = match self.context.pdp_type.as_deref().map(str::trim) {
            None => PdpType::Default,
            Some(s) => PdpType::from_ril_str(s)
                .with_context(|| format!("Unknown pdp_type {:?}", s))?,
        };
        let stage_defaults = StageTimeouts::default();
        let context = ContextConfig {
            credentials: Credentials {
                apn: non_empty(self.context.apn),
                username: non_empty(self.context.username),
                password: non_empty(self.context.password),
            },
            pdp_type,
            plmn: non_empty(self.context.plmn),
            blocking: self.context.blocking.unwrap_or(true),
            timeouts: StageTimeouts {
                device: millis_or(self.context.device_timeout_ms, stage_defaults.device),
                sim: millis_or(self.context.sim_timeout_ms, stage_defaults.sim),
                registration: millis_or(
                    self.context.registration_timeout_ms,
                    stage_defaults.registration,
                ),
                attach: millis_or(self.context.attach_timeout_ms, stage_defaults.attach),
                connect: millis_or(self.context.connect_timeout_ms, stage_defaults.connect),
            },
        };

        let dispatcher = match self.event_queue.dispatcher.as_deref().map(str::trim) {
            None | Some("thread") => DispatcherMode::Thread,
            Some("manual") => DispatcherMode::Manual,
            Some(other) => bail!("Unknown event_queue.dispatcher {:?}", other),
        };
        let event_queue = EventQueueConfig {
            capacity: self
                .event_queue
                .capacity
                .unwrap_or(EventQueueConfig::default().capacity),
            dispatcher,
        };

        Ok(CellularConfig {
            version,
            device,
            context,
            event_queue,
        })
    }
}

impl CellularConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(CellularConfig::default());
        }
        let parsed: CellularConfigInput =
            toml::from_str(input).context("Invalid config TOML")?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}
