use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use swarmgate::config::DEFAULT_STATEDIR;
use swarmgate::store::{load_session_config, save_session_config};
use swarmgate::{
    Config, DetachedTransport, FileStore, Keypair, NullSink, Runtime, RuntimeParts, SessionConfig,
    SessionOverrides,
};

const EVENT_PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "swarmgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding sessconfig, keypair and handle records.
    #[arg(long, env = "SWARMGATE_STATEDIR", default_value = DEFAULT_STATEDIR)]
    statedir: PathBuf,

    /// Overlay UDP port.
    #[arg(long, env = "SWARMGATE_DISPERSY")]
    dispersy: Option<u16>,

    /// Swarm transport listen port, recorded for the engine.
    #[arg(long, env = "SWARMGATE_LIBTORRENT")]
    libtorrent: Option<u16>,

    #[arg(long, env = "SWARMGATE_MANHOLE")]
    manhole: Option<u16>,

    #[arg(long, env = "SWARMGATE_RESTAPI")]
    restapi: Option<u16>,

    #[arg(long, env = "SWARMGATE_SOCKS_PORT")]
    socks_port: Option<u16>,

    #[arg(long, env = "SWARMGATE_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Bootstrap overlay peer (IP:PORT); repeatable.
    #[arg(short, long = "peer", value_name = "PEER", env = "SWARMGATE_PEERS", value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    /// Circuit length.
    #[arg(long, env = "SWARMGATE_HOPS")]
    hops: Option<usize>,

    /// Number of circuits to keep ready.
    #[arg(long, env = "SWARMGATE_CIRCUITS")]
    circuits: Option<usize>,

    /// Act as an exit for other nodes' circuits.
    #[arg(long, env = "SWARMGATE_EXIT")]
    exit: bool,

    /// Start extra queued handles while the upload budget is under-used.
    #[arg(long, env = "SWARMGATE_URM")]
    urm: bool,

    #[arg(short, long, env = "SWARMGATE_TELEMETRY_INTERVAL", default_value = "300")]
    telemetry_interval: u64,
}

impl Args {
    fn overrides(&self) -> SessionOverrides {
        SessionOverrides {
            overlay_port: self.dispersy,
            transport_port: self.libtorrent,
            manhole_port: self.manhole,
            restapi_port: self.restapi,
            socks_port: self.socks_port,
            control_port: self.control_port,
            bootstrap: self.peers.clone(),
            hops: self.hops,
            circuits: self.circuits,
            exit_capable: self.exit.then_some(true),
            urm: self.urm.then_some(true),
        }
    }
}

/// Load `sessconfig`, apply flags on top and write the result back.
async fn load_session(args: &Args) -> Result<SessionConfig> {
    let statedir = args.statedir.clone();
    let overrides = args.overrides();
    tokio::task::spawn_blocking(move || {
        let path = SessionConfig::with_statedir(&statedir).sessconfig_path();
        let mut session = load_session_config(&path)?.unwrap_or_default();
        session.statedir = statedir;
        overrides.apply(&mut session);
        save_session_config(&path, &session)?;
        Ok(session)
    })
    .await
    .context("session loader panicked")?
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let session = load_session(&args).await?;
    let keypair_path = session.keypair_path();
    let keypair = tokio::task::spawn_blocking(move || Keypair::load_or_generate(&keypair_path))
        .await
        .context("keypair loader panicked")??;
    info!(identity = %keypair.identity(), statedir = %session.statedir.display(), "node identity");

    let config = Config::from_session(session);
    let parts = RuntimeParts {
        identity: keypair.identity(),
        transport: Arc::new(DetachedTransport),
        store: Arc::new(FileStore::new(config.session.handles_dir())),
        sink: Arc::new(NullSink),
    };
    let mut runtime = Runtime::start(config, parts).await?;

    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    let mut pump = time::interval(EVENT_PUMP_INTERVAL);
    telemetry.tick().await;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = pump.tick() => {
                runtime.pump_events();
            }
            _ = telemetry.tick() => {
                match runtime.telemetry().await {
                    Ok(t) => info!(
                        circuits = t.ready_circuits,
                        relay_rules = t.overlay.relay_rules,
                        bytes_enter = t.overlay.bytes_enter,
                        bytes_exit = t.overlay.bytes_exit,
                        bytes_relayed = t.overlay.bytes_relayed,
                        known_peers = t.overlay.known_peers,
                        socks_clients = t.gateway.clients,
                        downloading = t.handles.downloading,
                        seeding = t.handles.seeding,
                        max_up = format!("{:.1}", t.max_rate.up),
                        max_down = format!("{:.1}", t.max_rate.down),
                        "telemetry snapshot"
                    ),
                    Err(e) => warn!(error = %e, "telemetry unavailable"),
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
