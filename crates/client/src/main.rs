mod session;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use tokio::time::MissedTickBehavior;

use netsync::SyncConfig;
use netsync::net::ConnectionState;
use session::ClientSession;

#[derive(Parser)]
#[command(name = "netsync-client")]
#[command(about = "Headless sync participant")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = netsync::net::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 20, help = "Objects to spawn per second")]
    rate: u32,

    #[arg(short, long, help = "Stop after this many spawns")]
    count: Option<u64>,

    #[arg(long, help = "TOML sync settings")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    let mut session = ClientSession::new(config)?;
    session.connect(&args.server, args.port)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(&mut session, &args));
    session.disconnect();
    result
}

async fn run(session: &mut ClientSession, args: &Args) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(5));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let spawn_every = Duration::from_secs_f64(1.0 / args.rate.max(1) as f64);
    let mut spawner = tokio::time::interval(spawn_every);
    spawner.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.update(Instant::now())?;
                match session.state() {
                    ConnectionState::TimedOut => bail!("connection to server timed out"),
                    ConnectionState::Disconnected => bail!("server closed the connection"),
                    _ => {}
                }
            }
            _ = spawner.tick() => {
                if session.state() != ConnectionState::Connected || !session.has_ids() {
                    continue;
                }
                if let Some(id) = session.spawn(Instant::now()) {
                    log::debug!(
                        "Spawned {} ({} ids left, rtt {:?} ms)",
                        id,
                        session.remaining_ids(),
                        session.rtt_ms()
                    );
                }
                if args.count.is_some_and(|limit| session.spawned() >= limit) {
                    log::info!("Spawned {} objects, leaving", session.spawned());
                    return Ok(());
                }
            }
            result = &mut shutdown => {
                result?;
                return Ok(());
            }
        }
    }
}
