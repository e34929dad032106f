mod config;
mod server;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::time::MissedTickBehavior;

use config::ServerConfig;
use netsync::SyncConfig;
use server::SyncServer;

const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "netsync-server")]
#[command(about = "Network sync authority")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = netsync::net::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = netsync::net::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(short, long, help = "TOML sync settings, re-read while running")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let sync = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        sync,
    };

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let mut server = SyncServer::new(&bind_addr, config)?;
    log::info!("Server started on {}", server.local_addr());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(&mut server, args.config))?;

    log::info!("Server shutting down");
    Ok(())
}

async fn run(server: &mut SyncServer, config_path: Option<PathBuf>) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reload = tokio::time::interval(CONFIG_RELOAD_INTERVAL);
    reload.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = tokio::time::interval(STATS_INTERVAL);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => server.tick_once(Instant::now()),
            _ = reload.tick() => {
                if let Some(path) = &config_path {
                    match SyncConfig::load(path) {
                        Ok(sync) => server.apply_config(sync),
                        Err(e) => log::warn!("Keeping previous config: {}", e),
                    }
                }
            }
            _ = report.tick() => {
                let stats = server.stats();
                log::info!(
                    "tick {} | clients {}/{} | batches {} | pool {} ({:?}) | sent {} recv {} rejected {}",
                    stats.tick,
                    stats.client_count,
                    stats.max_clients,
                    stats.granted_batches,
                    stats.scaler.current_limit,
                    stats.scaler.mode,
                    stats.network_stats.packets_sent,
                    stats.network_stats.packets_received,
                    stats.network_stats.packets_rejected,
                );
            }
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    server.shutdown();
    Ok(())
}
