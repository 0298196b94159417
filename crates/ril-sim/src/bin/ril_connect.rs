//! # ril-connect
//!
//! Brings one cellular data connection up through the RIL simulator, prints
//! the resulting PDP context parameters as JSON, then holds the connection
//! until Ctrl-C or the hold duration expires and tears it down again.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: inline simulator, blocking connect, hold until Ctrl-C
//! ril-connect --apn internet
//!
//! # Event-driven connect against a slow modem, hold for 10 s
//! ril-connect --scenario slow.toml --non-blocking --hold-secs 10
//!
//! # Stream every cellular event as a JSON line
//! RUST_LOG=ril_cellular=debug ril-connect --config cellular.toml --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use clap::Parser;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use ril_cellular::ril::RadioTransport;
use ril_cellular::{
    CellularConfig, CellularDevice, CellularEvent, ConnectionStatus, Credentials,
    InterfaceConfig, NetworkStack, StatusCallback,
};
use ril_sim::{RilSimulator, SimConfig};

/// Connect a cellular context through the loopback RIL simulator.
#[derive(Parser, Debug)]
#[command(name = "ril-connect", about = "Cellular connect driver over the RIL simulator")]
struct Cli {
    /// Cellular configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulator scenario (TOML).
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// APN override.
    #[arg(long)]
    apn: Option<String>,

    /// Drive the connection through events instead of blocking calls.
    #[arg(long, default_value_t = false)]
    non_blocking: bool,

    /// Seconds to stay connected; 0 waits for Ctrl-C.
    #[arg(long, default_value_t = 0)]
    hold_secs: u64,

    /// Print every cellular event as a JSON line.
    #[arg(long, default_value_t = false)]
    json: bool,
}

/// Host network stack stand-in that only logs.
struct LoggingStack;

impl NetworkStack for LoggingStack {
    fn bring_up(&self, config: &InterfaceConfig) -> ril_cellular::Result<()> {
        tracing::info!(
            ifname = %config.name,
            address = %config.address,
            netmask = %config.netmask,
            gateway = %config.gateway,
            dns = ?config.dns,
            mtu = config.mtu,
            "interface up"
        );
        Ok(())
    }

    fn bring_down(&self, name: &str) {
        tracing::info!(ifname = %name, "interface down");
    }
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Configuration ───────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => CellularConfig::from_file(path)?,
        None => CellularConfig::default(),
    };
    if cli.non_blocking {
        config.context.blocking = false;
    }
    let scenario = match &cli.scenario {
        Some(path) => SimConfig::from_file(path)?,
        None => SimConfig::default(),
    };
    let budget = {
        let t = &config.context.timeouts;
        t.device + t.sim + t.registration + t.attach + t.connect
    };

    tracing::info!(
        blocking = config.context.blocking,
        apn = ?cli.apn.as_deref().or(config.context.credentials.apn.as_deref()),
        delivery = ?scenario.delivery,
        hold_secs = cli.hold_secs,
        "ril-connect starting"
    );

    // ── Device ──────────────────────────────────────────────────
    let sim = RilSimulator::new(scenario)?;
    let transport = Arc::new(RadioTransport::new(sim));
    let device = CellularDevice::new(transport, config)?;
    device.hard_power_on().context("Radio interface registration failed")?;
    if let Some(version) = device.version() {
        tracing::info!(%version, "baseband");
    }

    let credentials = cli.apn.as_deref().map(|apn| {
        let current = &device.config().context.credentials;
        Credentials::new(
            Some(apn),
            current.username.as_deref(),
            current.password.as_deref(),
        )
    });
    let ctx = device.create_context(credentials);
    ctx.set_network_stack(Some(Arc::new(LoggingStack)));

    let (status_tx, status_rx) = unbounded();
    let json = cli.json;
    let callback: StatusCallback = Arc::new(move |event: &CellularEvent| {
        if json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "event not serializable"),
            }
        }
        tracing::debug!(?event, "cellular event");
        let _ = status_tx.send(event.clone());
    });
    ctx.attach(Some(callback));

    // ── Connect ─────────────────────────────────────────────────
    let started = Instant::now();
    ctx.connect().context("Connect failed")?;
    if !ctx.is_blocking() {
        wait_for_connection(&status_rx, budget)?;
    }
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        cid = ctx.cid(),
        ip = ?ctx.ip_address(),
        "connected"
    );

    let params = ctx
        .get_pdp_context_params()
        .context("PDP context query failed")?;
    println!("{}", serde_json::to_string_pretty(&params)?);

    let network = device.open_network();
    match network.get_signal_quality() {
        Ok(quality) => tracing::info!(rssi = quality.rssi, ber = quality.ber, "signal"),
        Err(e) => tracing::warn!(error = %e, "signal quality unavailable"),
    }

    // ── Hold ────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        tracing::info!("shutting down...");
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let hold = (cli.hold_secs > 0).then(|| Duration::from_secs(cli.hold_secs));
    let hold_until = hold.map(|d| Instant::now() + d);
    loop {
        match stop_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if hold_until.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        while let Ok(event) = status_rx.try_recv() {
            if event == CellularEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected) {
                tracing::warn!("connection lost");
            }
        }
        if !ctx.is_connected() {
            break;
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    if let Err(e) = ctx.disconnect() {
        tracing::warn!(error = %e, "disconnect failed");
    }
    device.delete_context(Some(&ctx));
    drop(network);
    device.close_network();
    if let Err(e) = device.soft_power_off() {
        tracing::warn!(error = %e, "radio power off failed");
    }
    tracing::info!(
        connected_secs = started.elapsed().as_secs(),
        "ril-connect stopped"
    );
    Ok(())
}

/// Block until the context reports a connected status or a failure.
fn wait_for_connection(
    events: &crossbeam_channel::Receiver<CellularEvent>,
    budget: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = match events.recv_timeout(remaining) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => bail!("Timed out after {:?} waiting for a connection", budget),
            Err(RecvTimeoutError::Disconnected) => bail!("Context dropped its callback"),
        };
        match event {
            CellularEvent::ConnectionStatusChanged(status) if status.is_up() => return Ok(()),
            CellularEvent::OperationFailed { operation, error } => {
                bail!("{:?} failed: {}", operation, error)
            }
            _ => {}
        }
    }
}
