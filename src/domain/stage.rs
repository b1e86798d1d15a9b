//! Stage markers and the pipeline state machine.
//!
//! Each completed stage leaves a well-known path in the work directory:
//!
//! ```text
//! <version>.dsc        shared cache copied out of the firmware image
//! <version>.bins       split binaries (staging)
//! <version>.extracted  split binaries, promoted
//! ```
//!
//! The state is derived from those paths on every probe; nothing else is
//! persisted between runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::version::VersionId;

/// Marker paths for one version in one work directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMarkers {
    /// Directory holding the copied shared cache
    pub dsc: PathBuf,

    /// Staging directory written by the split stage
    pub bins: PathBuf,

    /// Root of the extracted tree
    pub extracted: PathBuf,
}

impl StageMarkers {
    /// Marker paths for `version` under `work_dir`
    pub fn new(work_dir: &Path, version: &VersionId) -> Self {
        Self {
            dsc: work_dir.join(format!("{}.dsc", version)),
            bins: work_dir.join(format!("{}.bins", version)),
            extracted: work_dir.join(format!("{}.extracted", version)),
        }
    }

    /// Scratch directory the acquisition stage fills before renaming it to `dsc`
    pub fn dsc_partial(&self) -> PathBuf {
        let mut name = self.dsc.clone().into_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }
}

/// Answers "does this path exist"
pub trait StageProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

/// Probe backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl StageProbe for FsProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory probe for exercising the transition table
#[derive(Debug, Default)]
pub struct MemoryProbe {
    present: Mutex<HashSet<PathBuf>>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as present
    pub fn insert(&self, path: impl Into<PathBuf>) {
        if let Ok(mut present) = self.present.lock() {
            present.insert(path.into());
        }
    }

    /// Mark `path` as absent
    pub fn remove(&self, path: &Path) {
        if let Ok(mut present) = self.present.lock() {
            present.remove(path);
        }
    }
}

impl StageProbe for MemoryProbe {
    fn exists(&self, path: &Path) -> bool {
        self.present
            .lock()
            .map(|present| present.contains(path))
            .unwrap_or(false)
    }
}

/// How far the pipeline has got for one version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    /// No marker present
    NotStarted,

    /// Shared cache copied out (`.dsc`)
    Acquired,

    /// Binaries split into the staging directory (`.bins`)
    Split,

    /// Binaries promoted to the extracted tree (`.extracted`)
    Extracted,
}

/// Work the orchestrator performs to leave a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Acquire the firmware image, mount it and copy the shared cache out
    Acquire,

    /// Split the shared cache into individual binaries
    Split,

    /// Rename the staging directory to the extracted tree
    Promote,

    /// Dump every pending binary
    Dump,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Split => "split",
            Stage::Promote => "promote",
            Stage::Dump => "dump",
        }
    }
}

impl PipelineState {
    /// Derive the state from marker presence.
    ///
    /// The latest marker wins, so a stage that tidies up after an earlier
    /// one never causes that earlier stage to run again.
    pub fn probe(markers: &StageMarkers, probe: &dyn StageProbe) -> Self {
        if probe.exists(&markers.extracted) {
            PipelineState::Extracted
        } else if probe.exists(&markers.bins) {
            PipelineState::Split
        } else if probe.exists(&markers.dsc) {
            PipelineState::Acquired
        } else {
            PipelineState::NotStarted
        }
    }

    /// The stage that moves the pipeline out of this state
    pub fn next_stage(&self) -> Stage {
        match self {
            PipelineState::NotStarted => Stage::Acquire,
            PipelineState::Acquired => Stage::Split,
            PipelineState::Split => Stage::Promote,
            PipelineState::Extracted => Stage::Dump,
        }
    }

    /// State reached once `stage` completes from this state
    pub fn after(&self, stage: Stage) -> Option<Self> {
        match (self, stage) {
            (PipelineState::NotStarted, Stage::Acquire) => Some(PipelineState::Acquired),
            (PipelineState::Acquired, Stage::Split) => Some(PipelineState::Split),
            (PipelineState::Split, Stage::Promote) => Some(PipelineState::Extracted),
            (PipelineState::Extracted, Stage::Dump) => Some(PipelineState::Extracted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> StageMarkers {
        StageMarkers::new(Path::new("/work"), &VersionId::new("15.4").unwrap())
    }

    #[test]
    fn test_marker_paths() {
        let m = markers();
        assert_eq!(m.dsc, PathBuf::from("/work/15.4.dsc"));
        assert_eq!(m.bins, PathBuf::from("/work/15.4.bins"));
        assert_eq!(m.extracted, PathBuf::from("/work/15.4.extracted"));
        assert_eq!(m.dsc_partial(), PathBuf::from("/work/15.4.dsc.partial"));
    }

    #[test]
    fn test_probe_walks_forward() {
        let m = markers();
        let probe = MemoryProbe::new();
        assert_eq!(PipelineState::probe(&m, &probe), PipelineState::NotStarted);

        probe.insert(&m.dsc);
        assert_eq!(PipelineState::probe(&m, &probe), PipelineState::Acquired);

        probe.insert(&m.bins);
        assert_eq!(PipelineState::probe(&m, &probe), PipelineState::Split);

        probe.remove(&m.bins);
        probe.insert(&m.extracted);
        assert_eq!(PipelineState::probe(&m, &probe), PipelineState::Extracted);
    }

    #[test]
    fn test_latest_marker_wins() {
        let m = markers();
        let probe = MemoryProbe::new();
        probe.insert(&m.extracted);
        assert_eq!(PipelineState::probe(&m, &probe), PipelineState::Extracted);
    }

    #[test]
    fn test_transition_table() {
        let mut state = PipelineState::NotStarted;
        let mut stages = Vec::new();

        while state != PipelineState::Extracted {
            let stage = state.next_stage();
            stages.push(stage);
            state = state.after(stage).unwrap();
        }

        assert_eq!(stages, vec![Stage::Acquire, Stage::Split, Stage::Promote]);
        assert_eq!(state.next_stage(), Stage::Dump);
    }

    #[test]
    fn test_no_skipping_ahead() {
        assert_eq!(PipelineState::NotStarted.after(Stage::Split), None);
        assert_eq!(PipelineState::Acquired.after(Stage::Dump), None);
        assert_eq!(PipelineState::Extracted.after(Stage::Acquire), None);
    }
}
