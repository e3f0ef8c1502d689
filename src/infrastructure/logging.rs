use crate::infrastructure::error::InfraError;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "TAGTIMER_LOG";
const LOG_FILE_NAME: &str = "tagtimer.log";
const DEFAULT_FILTER: &str = "info";

/// Routes `tracing` output to `<logs_dir>/tagtimer.log`.
///
/// Returns the log path. A subscriber that is already installed is left in
/// place.
pub fn init_logging(logs_dir: &Path) -> Result<PathBuf, InfraError> {
    let path = logs_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let filter =
        EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
    Ok(path)
}
