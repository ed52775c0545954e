//! wsharness - send one command to a WebSocket JSON server and print the reply.
//!
//! The endpoint is given directly or resolved from the server's port
//! configuration. The normalized reply goes to stdout as pretty JSON; logs go
//! to stderr so the output can be piped.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;
use wsharness_core::{resolve_endpoint, ClientConfig, ServerConfig, WsClient, WsProtocol};

#[derive(Parser, Debug)]
#[command(name = "wsharness")]
#[command(about = "Invoke a command on a WebSocket JSON server")]
struct Args {
    /// Server port configuration (JSON) to take the endpoint from
    #[arg(short, long, conflicts_with = "endpoint")]
    config: Option<PathBuf>,

    /// Use the port advertising "ws2" instead of "ws"
    #[arg(long, requires = "config")]
    ws2: bool,

    /// Server address as HOST:PORT
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Command parameters as a JSON object
    #[arg(short, long, default_value = "{}")]
    params: String,

    /// How long to wait for the reply
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Keep printing pushed messages for this long after the reply
    #[arg(long)]
    listen_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Command to invoke
    command: String,
}

impl Args {
    fn protocol(&self) -> WsProtocol {
        if self.ws2 {
            WsProtocol::Ws2
        } else {
            WsProtocol::Ws
        }
    }

    fn params(&self) -> Result<Value> {
        let params: Value = serde_json::from_str(&self.params)
            .with_context(|| format!("--params is not valid JSON: {}", self.params))?;
        if !params.is_object() {
            bail!("--params must be a JSON object");
        }
        Ok(params)
    }
}

async fn endpoint(args: &Args) -> Result<SocketAddr> {
    if let Some(endpoint) = &args.endpoint {
        return tokio::net::lookup_host(endpoint.as_str())
            .await
            .with_context(|| format!("Failed to resolve {}", endpoint))?
            .next()
            .with_context(|| format!("No address found for {}", endpoint));
    }

    let Some(path) = &args.config else {
        bail!("Either --config or --endpoint is required");
    };
    let config = ServerConfig::load(path)?;
    Ok(resolve_endpoint(&config, args.protocol())?)
}

/// `None` means listen until the connection goes away.
fn listen_deadline(now: Instant, listen_ms: u64) -> Option<Instant> {
    now.checked_add(Duration::from_millis(listen_ms))
}

/// Returns whether a reply arrived.
async fn run(args: Args) -> Result<bool> {
    let params = args.params()?;
    let endpoint = endpoint(&args).await?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let client = WsClient::connect(endpoint, ClientConfig::default().with_invoke_timeout(timeout))
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let reply = client.invoke_within(&args.command, params, timeout).await?;
    let answered = reply.is_some();
    match &reply {
        Some(reply) => println!("{}", serde_json::to_string_pretty(reply)?),
        None => {
            info!("No reply to '{}' within {:?}", args.command, timeout);
            println!("null");
        }
    }

    if let Some(listen_ms) = args.listen_ms {
        let deadline = listen_deadline(Instant::now(), listen_ms);
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                break;
            }
            match client.get_msg(remaining).await {
                Some(message) => println!("{}", message),
                None => break,
            }
        }
    }

    client.close().await;
    debug!("Done with {}", endpoint);
    Ok(answered)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if run(args).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
