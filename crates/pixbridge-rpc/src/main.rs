//! Pixbridge RPC - reference canvas host and one-shot client.
//!
//! `serve` embeds a [`ServerListener`] in front of an in-memory canvas running
//! on its own mutation thread. `call` and `operations` use the client side
//! ([`ClientBridge`] + [`Dispatcher`]) against any host that speaks the bridge
//! protocol.

mod canvas;
mod handlers;

use anyhow::{bail, Context, Result};
use canvas::Canvas;
use clap::{Parser, Subcommand};
use pixbridge::config::parse_seconds;
use pixbridge::{
    BridgeConfig, ClientBridge, Dispatcher, MutationQueue, OperationOutcome, RetryConfig,
    ServerListener, SessionPolicy,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pixbridge-rpc")]
#[command(about = "Command bridge host and client for image editor automation")]
struct Args {
    /// Host to bind (serve) or connect to (call) [env: PIXBRIDGE_HOST]
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind or connect to; 0 picks a free port when serving [env: PIXBRIDGE_PORT]
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Default per-call timeout in seconds [env: PIXBRIDGE_TIMEOUT]
    #[arg(long, global = true)]
    timeout: Option<String>,

    /// Log filter, e.g. "info" or "pixbridge=debug" [env: PIXBRIDGE_LOG_LEVEL]
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable debug logging [env: PIXBRIDGE_DEBUG]
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reference canvas host until Ctrl-C
    Serve {
        /// What to do with a second client: replace or reject
        #[arg(long, default_value = "replace")]
        policy: String,

        /// Canvas width in pixels
        #[arg(long, default_value = "640")]
        width: u32,

        /// Canvas height in pixels
        #[arg(long, default_value = "480")]
        height: u32,
    },

    /// Send one operation and print the outcome as JSON
    Call {
        operation: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Wait for the host to come up, backing off between attempts
        #[arg(long)]
        wait: bool,

        /// Write the (first) binary attachment to this file
        #[arg(long)]
        save_attachment: Option<PathBuf>,
    },

    /// List the client-side operation catalog
    Operations,
}

/// Environment first, then command-line flags on top.
fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::from_env()?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(timeout) = &args.timeout {
        config.timeout = parse_seconds("--timeout", timeout)?;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    config.debug |= args.debug;
    Ok(config)
}

fn init_logging(config: &BridgeConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_filter())
        .with_context(|| format!("invalid log filter '{}'", config.log_filter()))?;

    // stdout is reserved for the port line and command output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    match args.command {
        Command::Serve {
            policy,
            width,
            height,
        } => {
            let policy: SessionPolicy = policy.parse()?;
            serve(&config, policy, width, height).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Call {
            operation,
            args,
            wait,
            save_attachment,
        } => call(config, &operation, &args, wait, save_attachment).await,
        Command::Operations => {
            list_operations(config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(
    config: &BridgeConfig,
    policy: SessionPolicy,
    width: u32,
    height: u32,
) -> Result<()> {
    info!("Starting reference canvas host ({}x{})", width, height);

    let canvas = Canvas::new(width, height).context("invalid canvas size")?;
    let (queue, mutation_thread) = MutationQueue::spawn(canvas, handlers::registry())
        .context("failed to start the mutation thread")?;

    let handle = ServerListener::new(queue)
        .with_policy(policy)
        .with_max_frame_size(config.max_frame_size)
        .start(&config.address())
        .await?;

    // Print port for the launching process to read (intentional stdout).
    println!("BRIDGE_PORT={}", handle.port);
    info!("Bridge host running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.stop().await;

    // The listener held the last queue handle, so the mutation loop is ending.
    match tokio::task::spawn_blocking(move || mutation_thread.join()).await? {
        Ok(canvas) => info!(
            "Mutation thread stopped with {} layer(s) on the canvas",
            canvas.layers().len()
        ),
        Err(_) => warn!("Mutation thread panicked"),
    }
    Ok(())
}

async fn call(
    config: BridgeConfig,
    operation: &str,
    raw_args: &str,
    wait: bool,
    save_attachment: Option<PathBuf>,
) -> Result<ExitCode> {
    let arguments: Map<String, Value> = match serde_json::from_str::<Value>(raw_args)
        .with_context(|| format!("--args is not valid JSON: {}", raw_args))?
    {
        Value::Object(map) => map,
        other => bail!("--args must be a JSON object, got {}", other),
    };

    let bridge = Arc::new(ClientBridge::new(config));
    if wait {
        if let Err(e) = bridge.connect_with_retry(&RetryConfig::default()).await {
            warn!("Host did not come up: {}", e);
        }
    }

    let dispatcher = Dispatcher::new(bridge.clone());
    let outcome = if dispatcher.operation(operation).is_some() {
        dispatcher.invoke(operation, arguments).await
    } else {
        dispatcher.invoke_raw(operation, arguments, None).await
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let Some(path) = save_attachment {
        save_first_attachment(&outcome, &path).await?;
    }

    bridge.shutdown(Duration::from_secs(1)).await;
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn save_first_attachment(outcome: &OperationOutcome, path: &Path) -> Result<()> {
    let mut names: Vec<&String> = outcome.attachments.keys().collect();
    names.sort();
    let Some(name) = names.first() else {
        warn!("'{}' returned no attachment to save", outcome.operation);
        return Ok(());
    };

    let bytes = &outcome.attachments[*name];
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("Saved '{}' ({} bytes) to {}", name, bytes.len(), path.display());
    Ok(())
}

fn list_operations(config: BridgeConfig) {
    let dispatcher = Dispatcher::new(Arc::new(ClientBridge::new(config)));
    let config = dispatcher.bridge().config();
    for op in dispatcher.operations() {
        println!(
            "{:<20} {:>6.1}s  {}",
            op.name(),
            op.timeout(config).as_secs_f64(),
            op.summary()
        );
    }
}
