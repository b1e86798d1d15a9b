//! Error types for the pipeline stages.

use std::path::PathBuf;

use thiserror::Error;

/// Stage-level failures.
///
/// Acquisition variants are transient and retried by the orchestrator; the
/// structural ones abort immediately and leave intermediate state in place.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ==================== Acquisition ====================
    #[error("no {device} firmware found for version {version}")]
    NoFirmware { device: String, version: String },

    #[error("no system image entry found in {url}")]
    NoSystemImage { url: String },

    #[error("failed to fetch '{entry}' from {url}")]
    FetchFailed { url: String, entry: String },

    #[error("fetched entry '{0}' is missing")]
    FetchedEntryMissing(PathBuf),

    #[error("failed to mount {image} on {mount_point}")]
    MountFailed { image: PathBuf, mount_point: PathBuf },

    #[error("failed to create mount point {0}")]
    MountPointFailed(PathBuf),

    #[error("mounted filesystem root {0} does not exist")]
    MissingMountRoot(PathBuf),

    #[error("no shared cache files found in {0}")]
    NoSharedCache(PathBuf),

    #[error("failed to unmount {0}")]
    UnmountFailed(PathBuf),

    #[error("failed to remove mount point {0}")]
    MountPointRemoveFailed(PathBuf),

    #[error("acquisition failed after {attempts} attempts: {last_error}")]
    AcquisitionExhausted { attempts: u32, last_error: String },

    // ==================== Split ====================
    #[error("shared cache {0} does not exist")]
    MissingSharedCache(PathBuf),

    #[error("splitter failed on {0}")]
    SplitterFailed(PathBuf),

    #[error("expected splitter output {0} does not exist")]
    MissingSplitOutput(PathBuf),

    // ==================== Orchestration ====================
    #[error("failed to promote {from} to {to}: {source}")]
    PromoteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stage '{stage}' completed without leaving its marker")]
    StageDidNotAdvance { stage: &'static str },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
