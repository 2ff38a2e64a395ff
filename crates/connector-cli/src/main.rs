use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use slideshow_connector::{
    Bridge, BridgeConfig, BundledInstaller, CONNECTOR_VERSION, PackagedInstaller, Registry,
    RequestError, ResponseFuture,
};

/// Drive a slideshow helper: one JSON request per stdin line, one JSON reply
/// per stdout line, in request order.
#[derive(Debug, Parser)]
#[command(name = "slideshow-bridge", version = CONNECTOR_VERSION)]
struct Args {
    /// Application to control (e.g. keynote, powerpoint2016)
    application: String,

    /// Platform id to resolve against [default: host platform]
    #[arg(long)]
    platform: Option<String>,

    /// JSON helper registry replacing the built-in one
    #[arg(long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Run helpers in place from this directory
    #[arg(long, value_name = "DIR", conflicts_with_all = ["install_from", "install_to"])]
    helper_dir: Option<PathBuf>,

    /// Read-only directory holding the bundled helpers
    #[arg(long, value_name = "DIR", requires = "install_to")]
    install_from: Option<PathBuf>,

    /// Writable directory the bundled helpers are copied into
    #[arg(long, value_name = "DIR", requires = "install_from")]
    install_to: Option<PathBuf>,
}

/// Initialize tracing with SLIDESHOW_LOG and LOG_FORMAT support.
///
/// Logs go to stderr; stdout carries replies only.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SLIDESHOW_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "slideshow_connector={level},slideshow_bridge={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn build_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::new(&args.application);

    if let Some(platform) = &args.platform {
        config = config.with_platform(platform);
    }

    if let Some(path) = &args.registry {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read registry {}", path.display()))?;
        config = config.with_registry(Registry::from_json(&json)?);
    }

    if let Some(dir) = &args.helper_dir {
        config = config.with_installer(Arc::new(BundledInstaller::new(dir)));
    } else if let (Some(from), Some(to)) = (&args.install_from, &args.install_to) {
        config = config.with_installer(Arc::new(PackagedInstaller::new(from, to)));
    }

    Ok(config)
}

/// A reply slot, kept in request order.
enum Pending {
    Request(ResponseFuture),
    Invalid(String),
}

fn render(result: Result<Value, RequestError>) -> Value {
    match result {
        Ok(response) => json!({ "response": response }),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// Print replies in the order their requests were read.
async fn print_replies(mut pending: mpsc::UnboundedReceiver<Pending>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(slot) = pending.recv().await {
        let reply = match slot {
            Pending::Request(response) => render(response.await),
            Pending::Invalid(message) => json!({ "error": message }),
        };
        let mut line = serde_json::to_string(&reply)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run(bridge: Bridge) -> anyhow::Result<()> {
    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_replies(pending_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let slot = match serde_json::from_str::<Value>(trimmed) {
            Ok(payload) => Pending::Request(bridge.request(&payload)),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping invalid request line");
                Pending::Invalid(format!("invalid request: {e}"))
            }
        };
        if pending_tx.send(slot).is_err() {
            break;
        }
    }

    bridge.end();
    drop(pending_tx);
    printer.await.context("reply printer panicked")??;
    bridge.closed().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = build_config(&args)?;
    let bridge = Bridge::connect(config)?;
    tracing::info!(helper = bridge.key(), "Connected to helper");

    run(bridge).await
}
