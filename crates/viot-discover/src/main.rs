//! CLI entry point for the viot-discover scanner.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use viot_discover::arp::NeighborTableResolver;
use viot_discover::config::DiscoverConfig;
use viot_discover::liveness::FpingProber;
use viot_discover::modbus::tcp::TcpModbusClient;
use viot_discover::scheduler::{ScanScheduler, Transports};
use viot_discover::snmp::udp::UdpSnmpClient;

#[derive(Parser)]
#[command(name = "viot-discover")]
#[command(about = "SNMP/Modbus device discovery for data-center rooms")]
struct Cli {
    /// Run a single discovery cycle and exit.
    #[arg(long)]
    once: bool,

    /// Run as daemon with scheduled cycles.
    #[arg(long)]
    daemon: bool,

    /// Config file path, with or without extension.
    #[arg(short, long, default_value = "config/viot-scanner")]
    config: String,

    /// Restrict a one-shot cycle to these rooms (repeatable).
    #[arg(short, long)]
    room: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    if cli.once == cli.daemon {
        anyhow::bail!("Specify exactly one of --once (single cycle) or --daemon (scheduled cycles)");
    }

    let config = DiscoverConfig::load(&cli.config)?;
    tracing::info!(
        config = %cli.config,
        rooms = config.ip_ranges.len(),
        targets = config.targets.len(),
        "Configuration loaded"
    );

    let prober = FpingProber::new(
        &config.scanner.fping_path,
        config.scanner.fping_retries,
        config.scanner.fping_timeout_ms,
    );
    let version = prober.verify_installation().await?;
    tracing::info!(fping_version = %version, "fping verified");

    let transports = Transports {
        prober: Arc::new(prober),
        snmp: Arc::new(UdpSnmpClient::new(
            Duration::from_secs(config.snmp.timeout_secs),
            config.snmp.retries,
        )),
        modbus: Arc::new(TcpModbusClient::new(Duration::from_secs(
            config.modbus.timeout_secs,
        ))),
        mac: Arc::new(NeighborTableResolver::new(&config.scanner.arp_table)),
    };

    let scheduler = ScanScheduler::new(config, transports)?;

    if cli.once {
        let report = scheduler.run_cycle(&cli.room).await?;
        if !report.errors.is_empty() {
            tracing::warn!(errors = report.errors.len(), "Cycle finished with errors");
        }
    } else {
        if !cli.room.is_empty() {
            tracing::warn!("--room is ignored in daemon mode");
        }
        scheduler.run().await?;
    }

    Ok(())
}
