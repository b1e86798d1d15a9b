//! Core pipeline logic.
//!
//! This module contains:
//! - Acquire: firmware lookup and remote entry fetch
//! - Mount: image mount and shared cache extraction
//! - Split: shared cache to individual binaries
//! - Dump: per-binary artifact generation over a worker pool
//! - Orchestrator: stage sequencing gated on on-disk markers

pub mod acquire;
pub mod dump;
pub mod error;
pub mod mount;
pub mod orchestrator;
pub mod retry;
pub mod split;

// Re-export commonly used types
pub use acquire::{Acquirer, ArchiveEntry, EntryPolicy, CANONICAL_IMAGE};
pub use dump::{discover_work_set, dump_one, DumpError, DumpPool, DumpSummary, FailedItem};
pub use error::PipelineError;
pub use mount::{extract_shared_cache, MountSession, Mounter};
pub use orchestrator::{Orchestrator, RunReport};
pub use retry::{RetryExhausted, RetryPolicy};
pub use split::Splitter;
