//! Per-process tracing setup.
//!
//! Every component is its own process and the coordinator owns the
//! terminal, so each one writes to `<log_dir>/<component>.log` unless
//! told to use stderr.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Where a process sends its log lines.
#[derive(Debug, Clone, Copy)]
pub enum LogTarget<'a> {
    Stderr,
    /// A file named after the component inside this directory
    Directory(&'a Path),
}

fn filter(verbose: bool) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Installs the global subscriber for `component`. `RUST_LOG` wins over `verbose`.
pub fn init_logging(component: &str, target: LogTarget<'_>, verbose: bool) -> Result<()> {
    match target {
        LogTarget::Stderr => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter(verbose))
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
        }
        LogTarget::Directory(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
            let path = dir.join(format!("{}.log", component));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter(verbose))
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
        }
    }
    Ok(())
}
