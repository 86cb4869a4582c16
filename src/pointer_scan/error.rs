use std::any::Any;

use thiserror::Error;

/// Failures while ingesting a snapshot.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read memory snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot too large: {size} bytes, cannot exceed {} GB", gigabytes(*limit))]
    TooLarge { size: u64, limit: u64 },
}

/// Failures while building the pointer map.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("pointer map build cancelled")]
    Cancelled,

    #[error("memory snapshot not loaded")]
    NoSnapshotLoaded,

    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("worker failed while building the pointer map: {0}")]
    WorkerFault(String),
}

/// Setup failures reported before a scan starts.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("memory snapshot not loaded")]
    NoSnapshotLoaded,

    #[error("no pointer map loaded")]
    NoPointerMap,

    #[error("pointer map was built with {field} = {built}, config has {requested}; rebuild the map")]
    StalePointerMap {
        field: &'static str,
        built: String,
        requested: String,
    },

    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),
}

impl BuildError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn gigabytes(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1_000_000_000.0)
}
