use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Overrides `--log-level` with a full filter directive when set.
pub const LOG_ENV: &str = "SHIM_LOG";
pub const LOG_FILE: &str = "shim.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Installs the global subscriber. Logs go to stderr unless `log_dir` is
/// given, in which case they are appended to `shim.log` there (or under
/// `./logs` if that directory cannot be written). Returns the directory used.
pub fn init(log_dir: Option<PathBuf>, min_level: Level) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(min_level.directive()));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("unable to initialize logging: {err}"))?;
        return Ok(None);
    };

    let (file, used_dir) = open_with_fallback(&log_dir)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|err| anyhow::anyhow!("unable to initialize logging: {err}"))?;
    if used_dir != log_dir {
        tracing::warn!(
            requested = %log_dir.display(),
            used = %used_dir.display(),
            "unable to write shim.log in the requested directory, fell back"
        );
    }
    Ok(Some(used_dir))
}

fn open_with_fallback(log_dir: &Path) -> anyhow::Result<(File, PathBuf)> {
    let fallback = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs");

    let mut candidates = vec![log_dir.to_path_buf()];
    if fallback != log_dir {
        candidates.push(fallback);
    }

    let mut last_error: Option<(PathBuf, io::Error)> = None;
    for candidate in candidates {
        match try_open_log(&candidate) {
            Ok(file) => return Ok((file, candidate)),
            Err(err) => last_error = Some((candidate, err)),
        }
    }

    match last_error {
        Some((path, err)) => Err(anyhow::anyhow!(
            "unable to open {LOG_FILE} at {}: {}",
            path.display(),
            err
        )),
        None => anyhow::bail!("unable to initialize log file"),
    }
}

fn try_open_log(log_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn writes_shim_log() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let used = init(Some(dir.path().to_path_buf()), Level::Info)?;
        assert_eq!(used.as_deref(), Some(dir.path()));
        tracing::info!(target: "tests::writes_shim_log", "hello world");
        tracing::debug!(target: "tests::writes_shim_log", "filtered out");
        let contents = fs::read_to_string(dir.path().join(LOG_FILE))?;
        assert!(contents.contains("hello world"));
        assert!(!contents.contains("filtered out"));
        Ok(())
    }
}
