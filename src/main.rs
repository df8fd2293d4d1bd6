//! scriptbridge - RPC bridge between a control process and a scripting host.
//!
//! `serve` runs the control side: it listens on the configured address,
//! keeps the working context and relays host commands to whichever peer
//! registered as the host. `host` runs next to the host application and
//! executes host commands through an interpreter. `call` issues a single
//! call and prints the result.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scriptbridge::config::{BridgeConfig, Endpoint, InterpreterConfig, ReconnectPolicy};
use scriptbridge::host::CommandHost;
use scriptbridge::procedures::{register_host_routes, ControlHub, HostContext, HostStub};
use scriptbridge::session::{ConnectionState, Session};
use scriptbridge::transport::{StreamAcceptor, StreamConnector};

#[derive(Parser, Debug)]
#[command(name = "scriptbridge", version)]
#[command(about = "RPC bridge between a control process and an embedded scripting host")]
struct Args {
    /// Endpoint address (tcp://host:port, unix:///path or /path)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Configuration file (defaults to <config dir>/scriptbridge/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Default call timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for peers and keep the bridge up
    Serve {
        #[arg(long, default_value = "")]
        project: String,
        #[arg(long, default_value = "")]
        asset: String,
        #[arg(long, default_value = "")]
        task: String,
    },

    /// Connect to the control process and execute host commands
    Host {
        /// Interpreter that runs host scripts (defaults to the configured one)
        #[arg(long)]
        interpreter: Option<String>,

        /// Arguments passed to the interpreter
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Call a procedure and print the JSON result
    Call {
        procedure: String,

        /// JSON payload (defaults to null)
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = load_config(&args)?;

    match args.command {
        Command::Serve {
            project,
            asset,
            task,
        } => {
            let context = HostContext {
                project,
                asset,
                task,
            };
            serve(config, context).await
        }
        Command::Host { interpreter, args } => {
            let interpreter = interpreter.map(|program| InterpreterConfig { program, args });
            run_host(config, interpreter).await
        }
        Command::Call { procedure, payload } => call(config, &procedure, payload.as_deref()).await,
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "scriptbridge=debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "scriptbridge=info".into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

/// Defaults, then the config file, then environment, then flags.
fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?
        .with_env()
        .context("Invalid environment override")?;

    if let Some(address) = &args.address {
        config.address = Endpoint::parse(address)?;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.call_timeout_ms = timeout_ms;
    }

    Ok(config)
}

async fn serve(config: BridgeConfig, context: HostContext) -> Result<()> {
    let acceptor = match StreamAcceptor::bind(&config.address).await {
        Ok(acceptor) => acceptor,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            info!("{} is already served, handing over the context", config.address);
            return hand_over_context(config, context).await;
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to listen on {}", config.address))
        }
    };
    info!(
        "Starting scriptbridge v{} on {}",
        env!("CARGO_PKG_VERSION"),
        acceptor.local_endpoint()
    );

    let hub = ControlHub::new(context);

    // One session per peer; a peer that leaves is not waited for again
    let mut peer_config = config.clone();
    peer_config.reconnect = ReconnectPolicy::disabled();

    loop {
        let session = Session::new(peer_config.clone(), acceptor.clone());
        let peer = hub.attach(&session);
        session.start();

        tokio::select! {
            _ = session.wait_for_state(ConnectionState::Open) => {}
            _ = session.wait_until_stopped() => {
                warn!("Accepting a peer failed");
                hub.detach(peer);
                tokio::time::sleep(config.reconnect.delay_for(1)).await;
                continue;
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                session.stop().await;
                hub.detach(peer);
                break;
            }
        }

        info!("Peer {} connected", peer);
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            session.wait_until_stopped().await;
            hub.detach(peer);
            info!("Peer {} disconnected", peer);
        });
    }

    for session in hub.sessions() {
        session.stop().await;
    }
    Ok(())
}

/// Pass `context` to the bridge already serving the address.
async fn hand_over_context(config: BridgeConfig, context: HostContext) -> Result<()> {
    let session = connect_once(config).await?;
    let result = HostStub::new(session.clone()).set_context(&context).await;
    session.stop().await;

    let applied = result.context("Running bridge refused the context")?;
    info!(
        "Running bridge now on project={} asset={} task={}",
        applied.project, applied.asset, applied.task
    );
    Ok(())
}

async fn run_host(config: BridgeConfig, interpreter: Option<InterpreterConfig>) -> Result<()> {
    let interpreter = interpreter
        .or_else(|| config.interpreter.clone())
        .context("No interpreter configured; pass --interpreter or set SCRIPTBRIDGE_INTERPRETER")?;

    let host = CommandHost::new(interpreter);
    info!("Executing host scripts with {}", host.program());

    let session = Session::new(config, StreamConnector::new());
    register_host_routes(session.routes(), Arc::new(host));
    session.start();

    // Register with the control process every time the connection opens
    let announcer = session.clone();
    let announce = tokio::spawn(async move {
        let stub = HostStub::new(announcer.clone());
        let mut states = announcer.subscribe();
        loop {
            let state = *states.borrow_and_update();
            if state == ConnectionState::Open {
                match stub.register_host().await {
                    Ok(peer) => info!("Registered as host (peer {})", peer),
                    // The drop itself is logged by the session
                    Err(e) if e.is_connection_error() => {}
                    Err(e) => warn!("Failed to register as host: {}", e),
                }
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        _ = session.wait_until_stopped() => {
            warn!("Gave up reconnecting to {}", session.config().address);
        }
    }

    announce.abort();
    session.stop().await;
    Ok(())
}

async fn call(config: BridgeConfig, procedure: &str, payload: Option<&str>) -> Result<()> {
    let payload = match payload {
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("Payload is not valid JSON: {}", text))?,
        None => Value::Null,
    };

    let session = connect_once(config).await?;
    let result = session.call(procedure, payload).await;
    session.stop().await;

    let value = result.with_context(|| format!("Call to '{}' failed", procedure))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Connect without reconnecting, failing if the peer cannot be reached
/// within the call timeout.
async fn connect_once(mut config: BridgeConfig) -> Result<Session> {
    config.reconnect = ReconnectPolicy::disabled();
    let address = config.address.clone();
    let timeout = config.call_timeout();

    let session = Session::new(config, StreamConnector::new());
    session.start();

    let opened = tokio::time::timeout(timeout, async {
        tokio::select! {
            _ = session.wait_for_state(ConnectionState::Open) => true,
            _ = session.wait_until_stopped() => false,
        }
    })
    .await;

    match opened {
        Ok(true) => Ok(session),
        _ => {
            session.stop().await;
            bail!("Could not connect to {}", address)
        }
    }
}
