use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreDriver, TollgateConfig};
use tollgate::gate::{Gate, Identity, ResponseSink};
use tollgate::ratelimit::Limiter;
use tollgate::store;

/// Run identities read from stdin through a token bucket gate.
///
/// Each input line is one request; an empty line or `-` bypasses limiting.
/// Each output line is the JSON response the request would receive.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tokens added per second
    #[arg(long)]
    rate: Option<f64>,

    /// Maximum tokens per bucket
    #[arg(long)]
    capacity: Option<f64>,

    /// Bucket key prefix
    #[arg(long)]
    namespace: Option<String>,

    /// Bucket store driver
    #[arg(long, value_enum)]
    store: Option<DriverArg>,

    /// Redis URL for the redis store
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DriverArg {
    Memory,
    Redis,
}

impl From<DriverArg> for StoreDriver {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Memory => StoreDriver::Memory,
            DriverArg::Redis => StoreDriver::Redis,
        }
    }
}

/// One line of input.
struct LineRequest {
    identity: String,
}

fn resolve_identity(request: &LineRequest) -> Identity {
    match request.identity.trim() {
        "" | "-" => Identity::Bypass,
        identity => Identity::from(identity),
    }
}

/// The response written for one line.
#[derive(Debug, Serialize)]
struct LineResponse {
    identity: String,
    status: u16,
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ResponseSink for LineResponse {
    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn set_body(&mut self, body: &str) {
        self.body = Some(body.to_string());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr, responses to stdout
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!(
        rate = config.limiter.rate,
        capacity = config.limiter.capacity,
        namespace = %config.limiter.namespace,
        driver = ?config.store.driver,
        "Configuration loaded"
    );

    let store = store::connect(&config.store).await?;
    let limiter = Arc::new(Limiter::from_config(&config.limiter, store)?);
    let gate: Gate<LineRequest> = Gate::from_config(limiter, resolve_identity, &config);
    info!("Gate initialized, reading identities from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let request = LineRequest { identity: line };
        let verdict = gate.check(&request).await;

        let mut response = LineResponse {
            identity: request.identity.trim().to_string(),
            status: 200,
            headers: BTreeMap::new(),
            body: None,
            error: None,
        };
        if let Err(rejection) = gate.respond(&verdict, &mut response) {
            response.error = Some(rejection.to_string());
        }

        match serde_json::to_string(&response) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!(error = %e, "Failed to encode response"),
        }
    }

    info!("Tollgate stopped");
    Ok(())
}

/// Merge command line overrides into the file/environment configuration.
fn load_config(args: &Args) -> tollgate::error::Result<TollgateConfig> {
    let mut config = TollgateConfig::load(args.config.as_deref())?;

    if let Some(rate) = args.rate {
        config.limiter.rate = rate;
    }
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(namespace) = &args.namespace {
        config.limiter.namespace = namespace.clone();
    }
    if let Some(driver) = args.store {
        config.store.driver = driver.into();
    }
    if let Some(url) = &args.redis_url {
        config.store.url = Some(url.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
