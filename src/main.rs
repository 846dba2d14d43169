/// Version injected at compile time via SITEAUDIT_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("SITEAUDIT_VERSION") {
    Some(v) => v,
    None => "dev",
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use siteaudit::audit::{Pipeline, RunReport};
use siteaudit::config::AuditConfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Bulk audit of sites: storage, linked groups and permissions
#[derive(Parser, Debug)]
#[command(name = "siteaudit", version = VERSION, about, long_about = None)]
struct Args {
    /// Config file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token for the directory API
    #[arg(long, env = "SITEAUDIT_TOKEN", hide_env_values = true)]
    token: String,

    /// API base URL
    #[arg(long)]
    api_base_url: Option<String>,

    /// Resume from the checkpoint and keep it updated
    #[arg(long)]
    resume: bool,

    /// Checkpoint file location
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Resources expanded concurrently
    #[arg(short = 'j', long)]
    max_parallel: Option<usize>,

    /// Memory ceiling in MiB
    #[arg(long)]
    memory_ceiling_mb: Option<u64>,

    /// Exclude resources whose name or URL matches (repeatable)
    #[arg(short, long = "exclude")]
    exclude: Vec<String>,

    /// Include personal storage sites
    #[arg(long)]
    include_personal: bool,

    /// Report the N largest files and folders per site
    #[arg(long)]
    largest_items: Option<usize>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    // RUST_LOG wins over the flag
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("siteaudit={}", tracing_level.as_str().to_lowercase())));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("siteaudit {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn resolve_config(args: &Args) -> Result<AuditConfig> {
    let mut config = AuditConfig::load(args.config.as_deref())?;

    if let Some(url) = &args.api_base_url {
        config.api_base_url = url.clone();
    }
    if args.resume {
        config.resume = true;
    }
    if let Some(path) = &args.checkpoint {
        config.checkpoint_path = Some(path.clone());
    }
    if let Some(n) = args.max_parallel {
        config.max_parallel = n;
    }
    if let Some(mb) = args.memory_ceiling_mb {
        config.memory_ceiling_mb = Some(mb);
    }
    if !args.exclude.is_empty() {
        config.exclusions.extend(args.exclude.iter().cloned());
    }
    if args.include_personal {
        config.include_personal = true;
    }
    if let Some(n) = args.largest_items {
        config.largest_items = n;
    }

    config.validate()?;
    Ok(config)
}

fn write_report(report: &RunReport, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report {}", path.display()))?;
            tracing::info!("Report written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(json.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Interrupt received, finishing in-flight resources"),
        _ = terminate => tracing::warn!("SIGTERM received, finishing in-flight resources"),
    }
}

/// Raise the cancel flag once `signal` resolves
async fn cancel_on(signal: impl std::future::Future<Output = ()>, cancel: Arc<AtomicBool>) {
    signal.await;
    cancel.store(true, Ordering::SeqCst);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level, args.log_file.as_deref())?;

    let config = resolve_config(&args)?;
    tracing::debug!("Effective config: {:?}", config);

    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn(cancel_on(shutdown_signal(), Arc::clone(&cancel)));

    let pipeline = Pipeline::new(config, &args.token, cancel)?;
    let report = pipeline.run().await?;

    write_report(&report, args.output.as_deref())?;

    if report.cancelled {
        eprintln!(
            "Run cancelled: {} of {} resources reported; rerun with --resume to continue",
            report.details.len(),
            report.discovered
        );
    } else if report.errored > 0 {
        eprintln!("{} resources could not be fully audited", report.errored);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_cancel_flag_raised_on_signal() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<()>();
        let watcher = tokio::spawn(cancel_on(
            async move {
                let _ = rx.await;
            },
            Arc::clone(&cancel),
        ));

        tokio::task::yield_now().await;
        assert!(!cancel.load(Ordering::SeqCst));

        tx.send(()).unwrap();
        watcher.await.unwrap();
        assert!(cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "siteaudit",
            "--token",
            "t",
            "-j",
            "3",
            "--exclude",
            "archive*",
            "--include-personal",
        ]);
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            config: Some(dir.path().join("missing.yaml")),
            ..args
        };
        assert!(resolve_config(&args).is_err());

        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "max_parallel: 12\nlargest_items: 4\n").unwrap();
        let args = Args {
            config: Some(path),
            ..Args::parse_from(["siteaudit", "--token", "t", "-j", "3", "--include-personal"])
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.largest_items, 4);
        assert!(config.include_personal);
    }
}
