use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pathguard::config::{LoggingConfig, PathguardConfig};
use pathguard::ratelimit::{Admission, AdmissionRequest, Decision, RateLimiterTrie, Reclaimer};

/// Check `RATE BURST KEY...` lines from stdin against a path-keyed rate limiter.
#[derive(Parser, Debug)]
#[command(name = "pathguard", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON); PATHGUARD__* variables override it
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PathguardConfig::load(args.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Pathguard admission checker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        gc_interval_ms = config.rate_limiting.gc_interval_ms,
        staleness_threshold_ms = config.rate_limiting.staleness_threshold_ms,
        "Configuration loaded"
    );

    let trie = Arc::new(RateLimiterTrie::from_config(&config.rate_limiting));
    let reclaimer = Reclaimer::new(trie.clone(), config.rate_limiting.clone())?.spawn();
    let admission = Admission::new(trie);
    info!("Rate limiter initialized");

    tokio::select! {
        result = check_lines(&admission) => {
            result?;
            info!("Input closed");
        }
        _ = shutdown_signal() => {}
    }

    reclaimer.shutdown().await;
    info!("Pathguard stopped");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Answer one decision line per request line until stdin closes.
async fn check_lines(admission: &Admission) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: AdmissionRequest = match line.parse() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request line");
                println!("ERROR {}", e);
                continue;
            }
        };

        match admission.check(&request) {
            Decision::Unlimited => println!("UNLIMITED"),
            Decision::Allowed(entry) => println!("ALLOW tokens={:.2}", entry.bucket().tokens()),
            Decision::Limited(entry) => println!("LIMIT tokens={:.2}", entry.bucket().tokens()),
        }
    }

    Ok(())
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
