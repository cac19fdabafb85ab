use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use easun_core::config::POLL_INTERVAL_BOUNDS;
use easun_core::{
    ClientConfig, CollectorConfig, DataCollector, DeviceProfile, Endpoints, Inverter,
    RefreshOutcome,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;


#[derive(Debug, Parser)]
#[command(name = "easund")]
#[command(about = "EASUN / ISolar inverter telemetry poller (read-only)")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Inverter address; discovered by broadcast when omitted.
    #[arg(long, global = true)]
    inverter: Option<Ipv4Addr>,

    /// Local address the device connects back to; resolved from the route
    /// toward the inverter when omitted.
    #[arg(long, global = true)]
    local: Option<Ipv4Addr>,

    #[arg(long, global = true, default_value = "EASUN_SMW_8K")]
    model: String,

    /// Seconds between polls; defaults to the model's profile.
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(
        *POLL_INTERVAL_BOUNDS.start()..=*POLL_INTERVAL_BOUNDS.end()
    ))]
    interval: Option<u64>,

    #[arg(long, global = true, default_value_t = 5000)]
    discovery_wait_ms: u64,

    #[arg(long, global = true, default_value_t = 30_000)]
    fetch_timeout_ms: u64,

    #[arg(long, global = true, default_value_t = 5000)]
    reply_timeout_ms: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    Discover,
    Models,
    Once,
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Models => {
            println!("{}", serde_json::to_string_pretty(DeviceProfile::all())?);
        }
        Command::Discover => {
            let endpoints = resolve_endpoints(&cli).await?;
            println!("{}", serde_json::to_string_pretty(&endpoints)?);
        }
        Command::Once => {
            let collector = build_collector(&cli).await?;
            match collector.request_refresh().await {
                RefreshOutcome::Updated(snapshot) => {
                    println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
                }
                RefreshOutcome::Failed { error, .. } => return Err(error.into()),
                other => bail!("refresh did not run: {other:?}"),
            }
        }
        Command::Run => {
            let collector = build_collector(&cli).await?;
            stream_loop(&collector).await?;
        }
    }

    Ok(())
}

async fn resolve_endpoints(cli: &Cli) -> Result<Endpoints> {
    let wait = Duration::from_millis(cli.discovery_wait_ms);
    Ok(Endpoints::resolve(cli.inverter, cli.local, wait).await?)
}

fn collector_config(cli: &Cli, profile: &DeviceProfile) -> Result<CollectorConfig> {
    let mut config = match cli.interval {
        Some(secs) => CollectorConfig::with_poll_interval(secs)?,
        None => CollectorConfig {
            poll_interval: profile.default_poll_interval,
            ..CollectorConfig::default()
        },
    };
    config.fetch_timeout = Duration::from_millis(cli.fetch_timeout_ms);
    Ok(config)
}

async fn build_collector(cli: &Cli) -> Result<DataCollector<Inverter>> {
    let profile = DeviceProfile::lookup(&cli.model)?;
    let collector_config = collector_config(cli, profile)?;
    let endpoints = resolve_endpoints(cli).await?;

    let mut config = ClientConfig::new(endpoints.inverter, endpoints.local, profile.key);
    config.reply_timeout = Duration::from_millis(cli.reply_timeout_ms);

    let client = Inverter::from_config(&config)?;
    Ok(DataCollector::new(client, collector_config))
}

async fn stream_loop(collector: &DataCollector<Inverter>) -> Result<()> {
    let period = collector.config().poll_interval;
    let mut ticker = interval_at(Instant::now() + Duration::from_millis(50), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = ticker.tick() => {
                match collector.request_refresh().await {
                    RefreshOutcome::Updated(snapshot) => {
                        println!("{}", serde_json::to_string(snapshot.as_ref())?);
                        info!(
                            soc = snapshot.battery.state_of_charge,
                            mode = %snapshot.system.mode_name,
                            "tick"
                        );
                    }
                    RefreshOutcome::Failed { retry_in, .. } => {
                        debug!(?retry_in, "poll failed");
                    }
                    RefreshOutcome::BackingOff { retry_in } => {
                        debug!(?retry_in, "skipping tick while backing off");
                    }
                    RefreshOutcome::InFlight => {}
                }
            }
        }
    }

    Ok(())
}
