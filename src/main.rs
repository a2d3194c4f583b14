use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::admission::{Admission, AdmissionRequest, FailurePolicy, TierSelector};
use quotagate::config::{LogFormat, LoggingConfig, QuotaConfig};
use quotagate::error::QuotaError;
use quotagate::ratelimit::{FnIdentifier, LocalStore, RateLimiter, Sweeper, TierRegistry};

/// Admission control probe for Quotagate deployments.
#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective tier table
    Tiers,

    /// Run admission for a synthetic request and print each decision
    Check {
        /// Tier name
        #[arg(long, default_value = "anonymous")]
        tier: String,

        /// Explicit rate limit key, takes precedence over addresses
        #[arg(long)]
        key: Option<String>,

        /// X-Forwarded-For header value
        #[arg(long)]
        forwarded_for: Option<String>,

        /// X-Real-IP header value
        #[arg(long)]
        real_ip: Option<String>,

        /// Connection address
        #[arg(long)]
        remote_addr: Option<IpAddr>,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Reject instead of allowing when admission itself fails
        #[arg(long)]
        fail_closed: bool,
    },

    /// Show the remaining quota for an identifier without consuming it
    Status {
        #[arg(long, default_value = "anonymous")]
        tier: String,

        identifier: String,
    },

    /// Clear all rate limit state for an identifier
    Reset { identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = QuotaConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging, cli.log_format.map(LogFormat::from));

    info!("Starting Quotagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let registry = config.registry().context("invalid tier configuration")?;
    let local = Arc::new(LocalStore::new());
    let store = config
        .backend()
        .into_store(local.clone())
        .context("invalid backend configuration")?;
    let limiter = RateLimiter::new(store);
    let sweeper = Sweeper::spawn(local, config.sweep_interval(&registry));

    match cli.command {
        Command::Tiers => {
            for (tier, policy) in registry.iter() {
                let line = serde_json::json!({
                    "tier": tier,
                    "max_requests": policy.max_requests(),
                    "window_seconds": policy.window().as_secs_f64(),
                    "message": policy.message(),
                });
                println!("{}", line);
            }
        }

        Command::Check {
            tier,
            key,
            forwarded_for,
            real_ip,
            remote_addr,
            repeat,
            interval_ms,
            fail_closed,
        } => {
            let selector = tier_selector(&registry, &tier, key.is_some());
            let mut request = AdmissionRequest::new();
            if let Some(key) = key {
                request = request.custom_key(key);
            }
            if let Some(value) = forwarded_for {
                request = request.forwarded_for(value);
            }
            if let Some(value) = real_ip {
                request = request.real_ip(value);
            }
            if let Some(addr) = remote_addr {
                request = request.remote_addr(addr);
            }

            let policy = if fail_closed {
                FailurePolicy::Closed
            } else {
                FailurePolicy::Open
            };
            let admission = Admission::new(limiter, Arc::new(registry));

            let run = async {
                for attempt in 1..=repeat {
                    let decision = admission
                        .admit_with_policy(&request, selector.clone(), policy)
                        .await;
                    let line = serde_json::json!({
                        "attempt": attempt,
                        "allowed": decision.allowed,
                        "identifier": decision.identifier,
                        "result": decision.result,
                        "status": decision.rejection.as_ref().map(|r| r.status.as_u16()),
                        "retry_after": decision.rejection.as_ref().and_then(|r| r.retry_after()),
                        "body": decision.rejection.as_ref().map(|r| &r.body),
                    });
                    println!("{}", line);

                    if interval_ms > 0 && attempt < repeat {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    }
                }
            };

            tokio::select! {
                _ = run => {}
                _ = shutdown_signal() => {}
            }
        }

        Command::Status { tier, identifier } => {
            let policy = registry.by_name(&tier)?;
            let result = limiter.status(&identifier, policy).await;
            println!("{}", serde_json::to_string(&result)?);
        }

        Command::Reset { identifier } => {
            limiter.reset(&identifier).await;
            info!(identifier = %identifier, "Identifier reset");
        }
    }

    sweeper.shutdown().await;
    info!("Quotagate stopped");
    Ok(())
}

/// Policy for `check`. With an explicit key the tier's policy gains an
/// identifier function returning it. An unknown tier name is passed through
/// so admission applies the failure policy to it.
fn tier_selector(registry: &TierRegistry, tier: &str, keyed: bool) -> TierSelector {
    if !keyed {
        return TierSelector::from(tier);
    }
    match registry.by_name(tier) {
        Ok(policy) => {
            let identifier = FnIdentifier(|request: AdmissionRequest| async move {
                Ok::<_, QuotaError>(request.custom_key)
            });
            TierSelector::from((**policy).clone().with_identifier(Arc::new(identifier)))
        }
        Err(_) => TierSelector::from(tier),
    }
}

fn init_tracing(logging: &LoggingConfig, format_override: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format_override.unwrap_or(logging.format) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
