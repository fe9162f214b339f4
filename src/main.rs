use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use formguard::config::FormGuardConfig;
use formguard::ratelimit::{LimitDecision, RateLimitFacade};

/// Sliding window admission control for repeated actions.
#[derive(Debug, Parser)]
#[command(name = "formguard", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); FORMGUARD_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a check for each identifier and print the decisions
    Check {
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Print where each identifier stands without consuming quota
    Peek {
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Check one identifier per line from stdin until EOF or Ctrl+C
    Stdin,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting formguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = FormGuardConfig::load(cli.config.as_deref())?;
    let facade = Arc::new(RateLimitFacade::from_config(&config).await?);

    match cli.command {
        Command::Check { identifiers } => {
            let checks = identifiers.into_iter().map(|identifier| {
                let facade = facade.clone();
                async move {
                    let decision = facade.check_rate_limit(&identifier).await;
                    (identifier, decision)
                }
            });
            for (identifier, decision) in futures::future::join_all(checks).await {
                print_decision(&identifier, &decision)?;
            }
        }
        Command::Peek { identifiers } => {
            for identifier in identifiers {
                let decision = facade.rate_limit_info(&identifier).await;
                print_decision(&identifier, &decision)?;
            }
        }
        Command::Stdin => {
            tokio::select! {
                result = check_lines(&facade) => result?,
                _ = shutdown_signal() => {}
            }
        }
    }

    let stats = facade.stats();
    info!(
        checks = stats.checks,
        denied = stats.denied,
        degraded = stats.degraded,
        "formguard stopped"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn check_lines(facade: &RateLimitFacade) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let identifier = line.trim();
        if identifier.is_empty() {
            continue;
        }
        let decision = facade.check_rate_limit(identifier).await;
        print_decision(identifier, &decision)?;
    }
    Ok(())
}

fn print_decision(identifier: &str, decision: &LimitDecision) -> anyhow::Result<()> {
    let line = serde_json::json!({
        "identifier": identifier,
        "decision": decision,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
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
