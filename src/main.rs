//! uvclink daemon entrypoint

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uvclink::config::MetricsFormat;
use uvclink::{
    DeviceDirectory, Error, SharedPlugin, SimulatedPlugin, SlotManager, SlotSnapshot,
    UvclinkConfig, logging, metrics,
};

#[derive(Parser, Debug)]
#[command(
    name = "uvclinkd",
    version,
    about = "Keeps a fixed set of USB camera slots streaming"
)]
struct Cli {
    /// Optional configuration file (toml/yaml). Defaults to uvclink.{toml,yaml} in cwd/XDG config.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// List detected cameras and exit
    #[arg(long)]
    list_cameras: bool,

    /// Run against N simulated cameras instead of real hardware
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// Override the number of capture slots
    #[arg(long, value_name = "N")]
    max_slots: Option<usize>,

    /// Seconds between reconcile passes
    #[arg(long, value_name = "SECS")]
    reconcile_interval: Option<u64>,

    /// Seconds between status reports
    #[arg(long, value_name = "SECS")]
    status_interval: Option<u64>,

    /// Print status reports as JSON instead of human-readable text
    #[arg(long)]
    json: bool,

    /// Enable metrics output regardless of configuration file settings
    #[arg(long)]
    metrics: bool,

    /// Override metrics endpoint bind address (e.g. 127.0.0.1:9910)
    #[arg(long, value_name = "ADDR")]
    metrics_bind: Option<String>,

    /// Override metrics endpoint format (`json` or `prometheus`)
    #[arg(long, value_name = "FORMAT")]
    metrics_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = UvclinkConfig::load(cli.config.as_deref())?;
    apply_cli_overrides(&cli, &mut config)?;

    logging::init(&config.logging)?;

    let plugin = build_plugin(&cli)?;

    if cli.list_cameras {
        return list_cameras(plugin).await;
    }

    let metrics_enabled = config.logging.metrics || config.logging.metrics_endpoint.is_some();
    if metrics_enabled {
        metrics::enable(config.logging.metrics_interval_secs);
        if let Some(ref endpoint) = config.logging.metrics_endpoint {
            let addr: SocketAddr = endpoint
                .parse()
                .with_context(|| format!("Invalid metrics endpoint '{endpoint}'"))?;
            metrics::spawn_http_endpoint(addr, config.logging.metrics_format)?;
            info!(%addr, format = ?config.logging.metrics_format, "Metrics endpoint listening");
        }
    }

    let manager_config = config.manager_config()?;
    info!(
        slots = manager_config.max_slots,
        policy = manager_config.session.negotiation.policy.as_str(),
        "Starting uvclink"
    );
    let manager = SlotManager::new(plugin, manager_config);

    manager.init().await.context("Camera plugin init failed")?;
    let fill = manager.initial_fill().await?;
    if fill.discovered == 0 {
        warn!("No cameras found at startup; waiting for hot-plug");
    }
    report_status(&manager, cli.json).await?;

    run(&manager, &config, cli.json).await?;

    manager.shutdown().await?;
    info!("uvclinkd stopped");
    Ok(())
}

fn apply_cli_overrides(cli: &Cli, config: &mut UvclinkConfig) -> anyhow::Result<()> {
    if let Some(slots) = cli.max_slots {
        config.slots.max_slots = slots;
    }
    if let Some(secs) = cli.reconcile_interval {
        config.daemon.reconcile_interval_secs = secs.max(1);
    }
    if let Some(secs) = cli.status_interval {
        config.daemon.status_interval_secs = secs.max(1);
    }

    if cli.metrics {
        config.logging.metrics = true;
    }
    if let Some(ref bind) = cli.metrics_bind {
        config.logging.metrics_endpoint = Some(bind.clone());
        config.logging.metrics = true;
    }
    if let Some(ref format) = cli.metrics_format {
        config.logging.metrics_format = format.parse::<MetricsFormat>().map_err(Error::Config)?;
    }
    Ok(())
}

fn build_plugin(cli: &Cli) -> anyhow::Result<SharedPlugin> {
    if let Some(count) = cli.simulate {
        info!(cameras = count, "Using simulated cameras");
        return Ok(Arc::new(SimulatedPlugin::with_cameras(count)));
    }
    hardware_plugin()
}

#[cfg(feature = "camera")]
fn hardware_plugin() -> anyhow::Result<SharedPlugin> {
    Ok(Arc::new(uvclink::V4lPlugin::new()))
}

#[cfg(not(feature = "camera"))]
fn hardware_plugin() -> anyhow::Result<SharedPlugin> {
    anyhow::bail!("uvclinkd was built without the `camera` feature; pass --simulate <N>")
}

async fn list_cameras(plugin: SharedPlugin) -> anyhow::Result<()> {
    #[cfg(feature = "camera")]
    {
        let nodes = uvclink::camera::list_capture_nodes();
        if !nodes.is_empty() {
            println!("V4L2 capture nodes:");
            for node in nodes {
                println!("  [{}] {} ({}, {})", node.index, node.card, node.path, node.driver);
            }
        }
    }

    let devices = DeviceDirectory::new(plugin).list_devices().await?;
    if devices.is_empty() {
        println!("No cameras detected");
    } else {
        println!("Cameras visible to uvclink:");
        for device in devices {
            println!("  {device}");
        }
    }
    Ok(())
}

async fn run(manager: &SlotManager, config: &UvclinkConfig, json: bool) -> anyhow::Result<()> {
    let mut reconcile = time::interval(Duration::from_secs(
        config.daemon.reconcile_interval_secs.max(1),
    ));
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    reconcile.tick().await;

    let mut status = time::interval(Duration::from_secs(config.daemon.status_interval_secs.max(1)));
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutdown requested");
                return Ok(());
            }
            _ = reconcile.tick() => match manager.reconcile().await {
                Ok(_) => {}
                Err(Error::ReconcileInProgress) => debug!("Reconcile already running"),
                Err(err) => warn!(error = %err, "Reconcile pass failed"),
            },
            _ = status.tick() => report_status(manager, json).await?,
        }
    }
}

async fn report_status(manager: &SlotManager, json: bool) -> anyhow::Result<()> {
    let snapshots = manager.status().await;
    if json {
        println!("{}", serde_json::to_string(&snapshots)?);
        return Ok(());
    }

    for snapshot in &snapshots {
        println!("{}", describe(snapshot));
    }
    Ok(())
}

fn describe(snapshot: &SlotSnapshot) -> String {
    let Some(device) = &snapshot.device else {
        return format!("slot {}: empty", snapshot.index);
    };

    let mut line = format!("slot {}: {device} {}", snapshot.index, snapshot.state);
    if let Some(mode) = &snapshot.negotiated {
        line.push_str(&format!(" {}x{}@{}", mode.width, mode.height, mode.fps));
    }
    if let Some(format) = &snapshot.format {
        line.push_str(&format!(" [{}]", format.raw));
    }
    if snapshot.frames > 0 || snapshot.frame_errors > 0 {
        line.push_str(&format!(
            " frames={} errors={}",
            snapshot.frames, snapshot.frame_errors
        ));
    }
    if let Some(number) = snapshot.frame_number {
        line.push_str(&format!(" native#{number}"));
    }
    if let Some(err) = &snapshot.last_error {
        line.push_str(&format!(" last_error=\"{err}\""));
    }
    line
}
