use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mesh_call::call::{CallHandle, CallSession};
use mesh_call::config::{AppConfig, ConfigStore, IceConfig, SessionConfig};
use mesh_call::media::SyntheticMediaSource;
use mesh_call::rtc::{LoopbackTransport, WebRtcTransport};
use mesh_call::signaling::{relay, MemoryHub, PeerId, RelayState, WsTransport};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// mesh-call command line arguments
#[derive(Parser, Debug)]
#[command(name = "mesh-call")]
#[command(version, about = "Full-mesh call signaling relay and headless participant", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay server
    Relay {
        /// Listen address (overrides config)
        #[arg(short = 'a', long, value_name = "ADDRESS")]
        address: Option<String>,

        /// Listen port (overrides config)
        #[arg(short = 'p', long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Join a room through a relay as a headless participant
    Join {
        /// Room to join
        #[arg(short = 'r', long)]
        room: String,

        /// Relay base URL (overrides config)
        #[arg(short = 's', long, value_name = "URL")]
        signaling: Option<String>,

        /// Fixed peer id instead of a random one
        #[arg(long, value_name = "ID")]
        peer_id: Option<String>,
    },
    /// Run several participants in-process and print the resulting mesh
    Demo {
        /// Number of participants
        #[arg(short = 'n', long, default_value_t = 3)]
        participants: usize,

        /// Room name
        #[arg(short = 'r', long, default_value = "demo")]
        room: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting mesh-call v{}", env!("CARGO_PKG_VERSION"));

    let mut store = ConfigStore::load(args.config.as_deref()).await?;

    match args.command {
        Command::Relay { address, port } => {
            store.update(|config| {
                if let Some(address) = address {
                    config.relay.bind_address = address;
                }
                if let Some(port) = port {
                    config.relay.port = port;
                }
            })?;
            run_relay(store.get().clone()).await
        }
        Command::Join {
            room,
            signaling,
            peer_id,
        } => {
            if let Some(url) = signaling {
                store.update(|config| config.signaling.url = url)?;
            }
            run_join(store.get().clone(), room, peer_id).await
        }
        Command::Demo { participants, room } => run_demo(store.get().clone(), participants, room).await,
    }
}

async fn run_relay(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.relay.bind_address, config.relay.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown = CancellationToken::new();
    let state = RelayState::new(config.relay.clone(), shutdown.clone());

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    relay::serve(listener, state).await?;
    tracing::info!("Relay shutdown complete");
    Ok(())
}

async fn run_join(config: AppConfig, room: String, peer_id: Option<String>) -> anyhow::Result<()> {
    let signaling = Arc::new(WsTransport::new(config.signaling.url.clone()));
    let mut builder = CallSession::builder(
        signaling,
        Arc::new(WebRtcTransport::new()),
        Arc::new(SyntheticMediaSource::new()),
    )
    .config(config);
    if let Some(id) = peer_id {
        builder = builder.peer_id(id);
    }
    let handle = builder.spawn();

    spawn_event_logger(&handle);
    handle.join_room(room.as_str()).await?;
    tracing::info!("Joining {} as {}", room, handle.local_peer_id());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    handle.notify_hidden();
    handle.leave_room().await?;
    tracing::info!("Left {}", room);
    Ok(())
}

fn spawn_event_logger(handle: &CallHandle) {
    let mut events = handle.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!("{}", json),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_demo(config: AppConfig, participants: usize, room: String) -> anyhow::Result<()> {
    if participants < 2 {
        anyhow::bail!("a mesh needs at least two participants");
    }

    let config = AppConfig {
        ice: IceConfig::host_only(),
        session: SessionConfig {
            camera_reacquire_delay_ms: 0,
            ..config.session
        },
        ..config
    };

    let hub = MemoryHub::new();
    let mut handles = Vec::with_capacity(participants);
    for _ in 0..participants {
        let handle = CallSession::builder(
            Arc::new(hub.connect()),
            Arc::new(LoopbackTransport::new()),
            Arc::new(SyntheticMediaSource::new()),
        )
        .config(config.clone())
        .peer_id(PeerId::random())
        .spawn();
        handle.join_room(room.as_str()).await?;
        handles.push(handle);
    }

    let expected = participants - 1;
    let wait_all = async {
        for handle in &handles {
            handle
                .wait_for(|s| s.peers.len() == expected && s.peer_ids.len() == expected)
                .await?;
        }
        Ok::<_, mesh_call::AppError>(())
    };
    tokio::time::timeout(Duration::from_secs(10), wait_all)
        .await
        .map_err(|_| anyhow::anyhow!("mesh did not converge within 10s"))??;

    println!("Room {} ({} participants)", room, participants);
    for handle in &handles {
        let snapshot = handle.snapshot();
        let remotes: Vec<String> = snapshot
            .peers
            .iter()
            .map(|(peer, stream)| format!("{} [{} tracks]", peer, stream.tracks.len()))
            .collect();
        println!("  {} -> {}", snapshot.local_peer_id, remotes.join(", "));
    }

    for handle in &handles {
        handle.leave_room().await?;
    }
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "mesh_call=error,tower_http=error",
        LogLevel::Warn => "mesh_call=warn,tower_http=warn",
        LogLevel::Info => "mesh_call=info,tower_http=info",
        LogLevel::Verbose => "mesh_call=debug,tower_http=info",
        LogLevel::Debug => "mesh_call=debug,tower_http=debug",
        LogLevel::Trace => "mesh_call=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
