//! learnpath-access
//!
//! Command-line front end for the access layer:
//! 1. Loads configuration and seeds the session token
//! 2. Runs one REST call or content request
//! 3. Prints the unwrapped JSON payload to stdout
//!
//! Failures print `kind: message` to stderr and exit with status 1.

use anyhow::{Context, Result, bail};
use learnpath_client::{AccessLayer, Config, metrics};
use metrics_exporter_prometheus::PrometheusHandle;
use realtime::ContentKind;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::RequestConfig;

const USAGE: &str = "usage: learnpath-access [--config PATH] [--print-metrics] <get PATH | lesson ID | chapter ID>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Get(String),
    Content(ContentKind, String),
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: Option<String>,
    print_metrics: bool,
    command: Command,
}

impl Cli {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut config_path = None;
        let mut print_metrics = false;
        let mut positional = Vec::new();

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config_path = Some(args.next().context("--config requires a path")?);
                }
                "--print-metrics" => print_metrics = true,
                flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
                _ => positional.push(arg),
            }
        }

        let command = match positional.as_slice() {
            [cmd, path] if cmd == "get" => Command::Get(path.clone()),
            [cmd, id] if cmd == "lesson" => Command::Content(ContentKind::Lesson, id.clone()),
            [cmd, id] if cmd == "chapter" => Command::Content(ContentKind::Chapter, id.clone()),
            _ => bail!(USAGE),
        };

        Ok(Self {
            config_path,
            print_metrics,
            command,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse(std::env::args().skip(1))?;

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let layer = AccessLayer::new(&config).context("failed to build access layer")?;

    let outcome = tokio::select! {
        outcome = run(&layer, &cli.command) => Some(outcome),
        _ = shutdown_signal() => None,
    };
    layer.shutdown().await;

    if cli.print_metrics {
        print_metrics(&prometheus);
    }

    match outcome {
        Some(Ok(value)) => {
            let rendered = serde_json::to_string_pretty(&value).context("failed to render result")?;
            println!("{rendered}");
            Ok(())
        }
        Some(Err(e)) => {
            eprintln!("{}: {e}", e.kind());
            std::process::exit(1);
        }
        None => {
            eprintln!("interrupted");
            std::process::exit(1);
        }
    }
}

async fn run(layer: &AccessLayer, command: &Command) -> learnpath_client::Result<Value> {
    match command {
        Command::Get(path) => layer.request_value(RequestConfig::get(path.as_str())).await,
        Command::Content(kind, id) => layer.request_content(*kind, id).await,
    }
}

fn print_metrics(handle: &PrometheusHandle) {
    eprintln!("{}", handle.render());
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_get_command() {
        let cli = Cli::parse(args(&["get", "/Courses"])).unwrap();
        assert_eq!(
            cli,
            Cli {
                config_path: None,
                print_metrics: false,
                command: Command::Get("/Courses".into()),
            }
        );
    }

    #[test]
    fn parses_flags_in_any_position() {
        let cli = Cli::parse(args(&["lesson", "--print-metrics", "L1", "--config", "/etc/lp.toml"]))
            .unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("/etc/lp.toml"));
        assert!(cli.print_metrics);
        assert_eq!(cli.command, Command::Content(ContentKind::Lesson, "L1".into()));
    }

    #[test]
    fn parses_chapter_command() {
        let cli = Cli::parse(args(&["chapter", "C3"])).unwrap();
        assert_eq!(cli.command, Command::Content(ContentKind::Chapter, "C3".into()));
    }

    #[test]
    fn config_flag_requires_value() {
        let err = Cli::parse(args(&["get", "/x", "--config"])).unwrap_err();
        assert!(err.to_string().contains("--config requires a path"));
    }

    #[test]
    fn rejects_unknown_commands_and_flags() {
        assert!(Cli::parse(args(&["delete", "/x"])).is_err());
        assert!(Cli::parse(args(&["lesson"])).is_err());
        assert!(Cli::parse(args(&["--verbose", "get", "/x"])).is_err());
        assert!(Cli::parse(Vec::new()).is_err());
    }
}
