//! Splitting the shared cache into individual binaries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{CommandRunner, CommandSpec};

use super::error::PipelineError;
use super::mount::SHARED_CACHE_PREFIX;

/// Cache file handed to the splitter
pub const SPLIT_INPUT: &str = "dyld_shared_cache_arm64";

/// Workspace the splitter writes into (relative to its cwd)
pub const SPLIT_WORKSPACE: &str = "binaries";

/// Subdirectory of the workspace that holds usable output
pub const SPLIT_OUTPUT: &str = "binaries/System";

/// Runs the external splitter
pub struct Splitter {
    runner: Arc<dyn CommandRunner>,
    program: String,
    jobs: usize,
}

impl Splitter {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, jobs: usize) -> Self {
        Self {
            runner,
            program: program.into(),
            jobs: jobs.max(1),
        }
    }

    /// Split `<dsc_dir>/dyld_shared_cache_arm64` and move the result to `dest`.
    ///
    /// On success the raw cache files and the splitter workspace are removed,
    /// leaving `dsc_dir` itself in place. On failure nothing is removed.
    #[instrument(skip(self), fields(jobs = self.jobs))]
    pub async fn split(&self, dsc_dir: &Path, dest: &Path) -> Result<()> {
        let input = dsc_dir.join(SPLIT_INPUT);
        if !input.exists() {
            return Err(PipelineError::MissingSharedCache(input).into());
        }

        let workspace = dsc_dir.join(SPLIT_WORKSPACE);
        if workspace.exists() {
            warn!(workspace = %workspace.display(), "Removing stale splitter workspace");
            tokio::fs::remove_dir_all(&workspace)
                .await
                .map_err(|e| PipelineError::io(&workspace, e))?;
        }

        let spec = CommandSpec::new(&self.program)
            .arg(format!("-j{}", self.jobs))
            .arg(SPLIT_INPUT)
            .current_dir(dsc_dir);
        info!("Splitting shared cache");
        if !self.runner.run(&spec).await? {
            return Err(PipelineError::SplitterFailed(input).into());
        }

        let output = dsc_dir.join(SPLIT_OUTPUT);
        if !output.is_dir() {
            return Err(PipelineError::MissingSplitOutput(output).into());
        }

        tokio::fs::rename(&output, dest)
            .await
            .map_err(|e| PipelineError::io(dest, e))?;
        info!(dest = %dest.display(), "Split output moved into place");

        for path in raw_cache_files(dsc_dir).await? {
            debug!(file = %path.display(), "Removing raw cache file");
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| PipelineError::io(&path, e))?;
        }
        tokio::fs::remove_dir_all(&workspace)
            .await
            .map_err(|e| PipelineError::io(&workspace, e))?;

        Ok(())
    }
}

async fn raw_cache_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| PipelineError::io(dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(dir, e))?
    {
        if entry.file_name().to_string_lossy().starts_with(SHARED_CACHE_PREFIX) {
            files.push(entry.path());
        }
    }

    Ok(files)
}
