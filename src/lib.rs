//! sdkmirror - build an SDK-style mirror of OS libraries from a firmware image
//!
//! Given an OS version, the pipeline fetches only the system image out of the
//! remote firmware archive, copies the shared library cache out of it, splits
//! the cache into individual binaries and dumps each binary into a stub
//! (`.tbd`), a JSON metadata document and its reconstructed headers.
//!
//! # Architecture
//!
//! Stages are gated on markers in the work directory:
//! - `<version>.dsc` means the shared cache has been acquired
//! - `<version>.bins` means it has been split
//! - `<version>.extracted` means the binaries are in their final place
//!
//! Re-running after a failure resumes at the first incomplete stage, and a
//! binary with a stub next to it is never dumped again.
//!
//! # Modules
//!
//! - `adapters`: External processes and services (runner, catalog, dump tool)
//! - `core`: Stages and orchestration
//! - `domain`: Versions, stage markers, work items
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! sdkmirror 16.0
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::Settings;
pub use core::{DumpSummary, Orchestrator, PipelineError, RunReport};
pub use domain::{PipelineState, Stage, VersionId};
