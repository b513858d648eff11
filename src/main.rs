mod config;
mod crypto;
mod error;
mod gateway;
mod lorawan;
mod region;
mod scheduler;
mod session;
mod testengine;
mod udp;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scheduler::{DeviceRegistry, DownlinkScheduler};
use session::EndDevice;
use testengine::TestSessionCoordinator;

#[derive(Parser)]
#[command(name = "lorawan-conformance-tool")]
#[command(about = "LoRaWAN 1.0.2 conformance test harness")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lorawan-conformance-tool v{}", env!("CARGO_PKG_VERSION"));

    info!("starting Semtech UDP packet forwarder bridge on {}", config.udp.bind);
    let (downlink, uplink_tx) = udp::start_server(&config).await?;

    let dev_eui = parse_eui8(&config.testengine.dev_eui)?;
    let app_key = parse_key16(&config.testengine.app_key)?;
    let device_under_test = EndDevice::new(dev_eui, [0; 4], app_key, [0; 16], [0; 16]);
    let step_timeout = Duration::from_secs(config.testengine.step_timeout_secs);
    let requested_tests = config.testengine.test_cases.clone();

    let coordinator = TestSessionCoordinator::new(device_under_test, downlink.clone(), requested_tests, step_timeout);
    let coordinator_uplinks = uplink_tx.subscribe();
    let coordinator_task = tokio::spawn(async move {
        let report = coordinator.run(coordinator_uplinks).await;
        for row in &report {
            if row.passed {
                info!("PASS {}", row.tc_name);
            } else {
                tracing::error!("FAIL {}: {}", row.tc_name, row.detail.as_deref().unwrap_or(""));
            }
        }
        report
    });

    let registry = DeviceRegistry::new(&config.scheduler.known_devices);
    let scheduler = DownlinkScheduler::new(registry, downlink);
    let scheduler_uplinks = uplink_tx.subscribe();
    tokio::spawn(async move {
        scheduler.run(scheduler_uplinks).await;
    });

    let report = coordinator_task.await?;
    let passed = report.iter().filter(|r| r.passed).count();
    info!("session complete: {}/{} test cases passed", passed, report.len());

    Ok(())
}

fn parse_eui8(hex_str: &str) -> anyhow::Result<[u8; 8]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 8-byte EUI, got {} bytes", hex_str.len() / 2))
}

fn parse_key16(hex_str: &str) -> anyhow::Result<[u8; 16]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 16-byte key, got {} bytes", hex_str.len() / 2))
}
