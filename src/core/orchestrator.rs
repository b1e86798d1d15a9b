//! Main orchestrator for the mirror pipeline.
//!
//! Sequences the stages, gating each on the markers left by the previous
//! one. Nothing but the filesystem carries state between runs, so running
//! again after a failure resumes at the first incomplete stage.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, instrument};

use crate::adapters::{
    ArtifactGenerator, CommandRunner, DumpToolGenerator, FirmwareCatalog, IpswCatalog,
    ProcessRunner,
};
use crate::config::Settings;
use crate::domain::{FsProbe, PipelineState, Stage, StageMarkers, StageProbe, VersionId};

use super::acquire::Acquirer;
use super::dump::{discover_work_set, DumpPool, DumpSummary};
use super::error::PipelineError;
use super::mount::{extract_shared_cache, Mounter};
use super::split::Splitter;

/// What one invocation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub version: VersionId,

    /// Stages executed this run, in order
    pub stages: Vec<Stage>,

    /// Dump results, when there was anything to dump
    pub dump: Option<DumpSummary>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    catalog: Arc<dyn FirmwareCatalog>,
    generator: Arc<dyn ArtifactGenerator>,
    probe: Arc<dyn StageProbe>,
}

impl Orchestrator {
    /// Create an orchestrator backed by real processes and the ipsw.me catalog
    pub fn new(settings: Settings) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let catalog = Arc::new(IpswCatalog::new(settings.catalog_url.clone()));
        let generator = Arc::new(DumpToolGenerator::new(
            Arc::clone(&runner),
            settings.tools.dump_tool.clone(),
        ));
        Self::with_components(settings, runner, catalog, generator)
    }

    /// Create an orchestrator from explicit collaborators
    pub fn with_components(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        catalog: Arc<dyn FirmwareCatalog>,
        generator: Arc<dyn ArtifactGenerator>,
    ) -> Self {
        Self {
            settings,
            runner,
            catalog,
            generator,
            probe: Arc::new(FsProbe),
        }
    }

    /// Replace the stage probe
    pub fn with_probe(mut self, probe: Arc<dyn StageProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Marker paths for `version`
    pub fn markers(&self, version: &VersionId) -> StageMarkers {
        StageMarkers::new(&self.settings.work_dir, version)
    }

    /// Current state for `version`
    pub fn state(&self, version: &VersionId) -> PipelineState {
        PipelineState::probe(&self.markers(version), self.probe.as_ref())
    }

    /// Run every outstanding stage for `version`
    #[instrument(skip(self, version), fields(version = %version))]
    pub async fn run(&self, version: &VersionId) -> Result<RunReport> {
        let markers = self.markers(version);
        let mut report = RunReport {
            version: version.clone(),
            stages: Vec::new(),
            dump: None,
        };

        loop {
            let state = PipelineState::probe(&markers, self.probe.as_ref());
            let stage = state.next_stage();

            info!(stage = stage.name(), ?state, "Running stage");
            let started = Instant::now();
            match stage {
                Stage::Acquire => self.acquire_stage(version, &markers).await?,
                Stage::Split => self.split_stage(&markers).await?,
                Stage::Promote => self.promote_stage(&markers).await?,
                Stage::Dump => {
                    report.dump = self.dump_stage(&markers).await?;
                    if report.dump.is_some() {
                        report.stages.push(Stage::Dump);
                    }
                    break;
                }
            }
            info!(
                stage = stage.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage complete"
            );
            report.stages.push(stage);

            let reached = PipelineState::probe(&markers, self.probe.as_ref());
            if reached <= state {
                return Err(PipelineError::StageDidNotAdvance { stage: stage.name() }.into());
            }
        }

        Ok(report)
    }

    /// Acquire the image, mount it and copy the shared cache out, with retries
    async fn acquire_stage(&self, version: &VersionId, markers: &StageMarkers) -> Result<()> {
        let policy = &self.settings.acquire.retry;
        let device = self.settings.device.as_str();
        let mounter = self.mounter();

        // Decided once: a mount point left by a failed attempt is still ours
        let owns_mount_point = mounter.mount_point_missing();
        let mounter = &mounter;

        let outcome = policy
            .run("acquire", |attempt| async move {
                info!(attempt, %device, "Acquiring shared cache");
                self.acquire_once(version, markers, mounter, owns_mount_point)
                    .await
            })
            .await;

        match outcome {
            Ok(()) => {
                info!(%device, %version, "Shared cache extraction successful");
                Ok(())
            }
            Err(exhausted) => {
                error!(
                    attempts = exhausted.attempts,
                    error = %format!("{:#}", exhausted.last_error),
                    "Shared cache extraction failed"
                );
                Err(PipelineError::AcquisitionExhausted {
                    attempts: exhausted.attempts,
                    last_error: format!("{:#}", exhausted.last_error),
                }
                .into())
            }
        }
    }

    /// One acquisition attempt. Cleans up only when everything succeeded.
    async fn acquire_once(
        &self,
        version: &VersionId,
        markers: &StageMarkers,
        mounter: &Mounter,
        owns_mount_point: bool,
    ) -> Result<()> {
        let work_dir = &self.settings.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;

        let acquirer = Acquirer::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.catalog),
            self.settings.tools.remotezip.clone(),
            self.settings.acquire.second_largest_from_major,
        );
        let image = acquirer
            .acquire(version, &self.settings.device, work_dir)
            .await?;

        let session = mounter.mount_image(&image, owns_mount_point).await?;

        let partial = markers.dsc_partial();
        extract_shared_cache(&session.root, &partial).await?;

        mounter.cleanup(&session).await?;
        remove_if_exists(&image).await?;

        tokio::fs::rename(&partial, &markers.dsc)
            .await
            .map_err(|e| PipelineError::io(&markers.dsc, e))?;

        Ok(())
    }

    fn mounter(&self) -> Mounter {
        Mounter::new(
            Arc::clone(&self.runner),
            self.settings.mount_point.clone(),
            self.settings.privilege_command.clone(),
            self.settings.tools.apfs_fuse.clone(),
        )
    }

    async fn split_stage(&self, markers: &StageMarkers) -> Result<()> {
        Splitter::new(
            Arc::clone(&self.runner),
            self.settings.tools.splitter.clone(),
            self.settings.split_jobs,
        )
        .split(&markers.dsc, &markers.bins)
        .await
    }

    async fn promote_stage(&self, markers: &StageMarkers) -> Result<()> {
        tokio::fs::rename(&markers.bins, &markers.extracted)
            .await
            .map_err(|source| PipelineError::PromoteFailed {
                from: markers.bins.clone(),
                to: markers.extracted.clone(),
                source,
            })?;
        info!("{} -> {}", markers.bins.display(), markers.extracted.display());
        Ok(())
    }

    /// Dump pending binaries; `None` when the work set is empty
    async fn dump_stage(&self, markers: &StageMarkers) -> Result<Option<DumpSummary>> {
        let root = markers.extracted.clone();
        let skip_failed = self.settings.dump.skip_failed;
        let items = tokio::task::spawn_blocking(move || discover_work_set(&root, skip_failed))
            .await
            .context("Work set discovery panicked")??;

        if items.is_empty() {
            info!("Nothing left to dump");
            return Ok(None);
        }

        let pool = DumpPool::new(Arc::clone(&self.generator), self.settings.dump.workers)
            .with_throttle(Duration::from_millis(self.settings.dump.throttle_ms));
        pool.run(items).await.map(Some)
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e).into()),
    }
}
