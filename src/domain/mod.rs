//! Domain types for the mirror pipeline.
//!
//! - Version: the firmware build being mirrored
//! - Stage: on-disk markers and the state machine derived from them
//! - Artifact: extracted binaries and their dump outputs

pub mod artifact;
pub mod stage;
pub mod version;

// Re-export commonly used types
pub use artifact::{DumpDocument, WorkItem};
pub use stage::{FsProbe, MemoryProbe, PipelineState, Stage, StageMarkers, StageProbe};
pub use version::{VersionError, VersionId};
