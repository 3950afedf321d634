use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use octostore_quorum::{
    config::Config,
    node::{self, NodeState},
    KeyStore, QuorumCoordinator,
};
use tokio::{signal, time};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "octostore-quorum", version, about = "Quorum locks over independent authorities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a single lock authority over HTTP
    Node(NodeArgs),
    /// Acquire a lock on the configured authorities, hold and renew it, then release it
    Lock(LockArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// SQLite file for key persistence (overrides DATABASE_URL)
    #[arg(long)]
    database: Option<String>,

    /// How often expired keys are swept
    #[arg(long, default_value_t = 5_000)]
    sweep_ms: u64,
}

#[derive(Args)]
struct LockArgs {
    /// Name of the resource to lock
    resource: String,

    /// Authority endpoint; repeat for each authority (overrides AUTHORITIES)
    #[arg(long = "authority", short = 'a')]
    authorities: Vec<String>,

    #[arg(long, default_value_t = 10_000)]
    ttl_ms: u64,

    /// How long to hold the lock between renewals
    #[arg(long, default_value_t = 3_000)]
    hold_ms: u64,

    /// Number of renewals before releasing
    #[arg(long, default_value_t = 3)]
    rounds: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "octostore_quorum=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Node(args) => run_node(config, args).await,
        Command::Lock(args) => run_lock(config, args).await,
    }
}

async fn run_node(config: Config, args: NodeArgs) -> anyhow::Result<()> {
    let bind_addr = args.bind.unwrap_or(config.bind_addr);
    let endpoint = format!("http://{}", bind_addr);

    let store = match args.database.or(config.database_url) {
        Some(path) => {
            let store = KeyStore::open(endpoint, &path)?;
            info!("Loaded {} live keys from {}", store.len(), path);
            store
        }
        None => KeyStore::in_memory(endpoint),
    };
    let sweeper = store.clone().start_expiry_task(Duration::from_millis(args.sweep_ms));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    node::serve(listener, NodeState::new(store), shutdown_signal()).await?;

    sweeper.abort();
    info!("Authority node stopped");
    Ok(())
}

async fn run_lock(config: Config, args: LockArgs) -> anyhow::Result<()> {
    let endpoints = if args.authorities.is_empty() {
        config.authorities
    } else {
        args.authorities
    };
    if endpoints.is_empty() {
        anyhow::bail!("no authorities configured: pass --authority or set AUTHORITIES");
    }

    let coordinator = QuorumCoordinator::from_endpoints(config.quorum, endpoints.as_slice())?;
    info!(
        "Coordinating {} authorities, quorum {}",
        coordinator.len(),
        coordinator.quorum()
    );

    let ttl = Duration::from_millis(args.ttl_ms);
    let hold = Duration::from_millis(args.hold_ms);

    let mut handle = coordinator.acquire(&args.resource, ttl).await?;
    info!("Holding {} with token {}", handle.resource(), handle.token());

    for round in 1..=args.rounds {
        time::sleep(hold).await;
        if handle.is_expired() {
            warn!("Lock on {} expired before renewal {}", handle.resource(), round);
        }
        // a failed renewal has already released the lock
        coordinator.renew(&mut handle, ttl).await?;
        info!(
            "Renewal {}/{}: {} valid for another {}ms",
            round,
            args.rounds,
            handle.resource(),
            handle.validity().as_millis()
        );
    }

    time::sleep(hold).await;
    coordinator.release(&handle).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
