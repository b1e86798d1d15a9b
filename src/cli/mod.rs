//! Command-line interface for sdkmirror.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::config::config;
use crate::core::{Orchestrator, RunReport};
use crate::domain::VersionId;

/// sdkmirror - mirror OS library stubs and headers from a firmware image
#[derive(Parser, Debug)]
#[command(name = "sdkmirror")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// OS version to mirror (e.g. 16.0)
    pub version: String,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let version = VersionId::new(&self.version)
            .with_context(|| format!("Invalid version: {}", self.version))?;

        let settings = config()?.clone();
        if let Some(path) = &settings.config_file {
            info!(config = %path.display(), "Loaded config file");
        }
        info!(
            %version,
            device = %settings.device,
            work_dir = %settings.work_dir.display(),
            "Starting"
        );

        let orchestrator = Orchestrator::new(settings);
        let report = orchestrator.run(&version).await?;
        log_report(&report);

        Ok(())
    }
}

fn log_report(report: &RunReport) {
    let stages: Vec<&str> = report.stages.iter().map(|s| s.name()).collect();

    match &report.dump {
        None => info!(version = %report.version, ?stages, "Nothing to do, mirror is up to date"),
        Some(summary) if summary.is_clean() => info!(
            version = %report.version,
            ?stages,
            dumped = summary.succeeded,
            "Mirror complete"
        ),
        Some(summary) => {
            for failed in &summary.failed {
                warn!(item = %failed.item, error = %failed.error, "Not dumped");
            }
            warn!(
                version = %report.version,
                ?stages,
                dumped = summary.succeeded,
                failed = summary.failed.len(),
                "Mirror incomplete, re-run to retry failed binaries"
            );
        }
    }
}
