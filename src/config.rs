//! Configuration for sdkmirror.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SDKMIRROR_WORK_DIR, SDKMIRROR_DEVICE, SDKMIRROR_MOUNT_POINT)
//! 2. Config file (.sdkmirror/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .sdkmirror/config.yaml
//! - Falls back to ~/.sdkmirror/config.yaml
//! - Paths in config file are relative to the config file's project root

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::catalog::DEFAULT_CATALOG_URL;
use crate::adapters::generator::DEFAULT_DUMP_TOOL;
use crate::core::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<Settings, String>> = OnceLock::new();

/// Device model every firmware lookup targets
pub const DEFAULT_DEVICE: &str = "iPhone10,3";

/// Mount point for the firmware image
pub const DEFAULT_MOUNT_POINT: &str = "/mnt/ipsw";

/// First major version whose system image is the second-largest archive entry
pub const DEFAULT_SECOND_LARGEST_FROM_MAJOR: u32 = 16;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub privilege_command: Option<String>,
    #[serde(default)]
    pub acquire: Option<AcquireConfig>,
    #[serde(default)]
    pub split: Option<SplitConfig>,
    #[serde(default)]
    pub dump: Option<DumpConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the stage markers (relative to project root)
    pub work_dir: Option<String>,
    /// Where the firmware image gets mounted
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquireConfig {
    pub retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub second_largest_from_major: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitConfig {
    pub jobs: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    pub workers: Option<usize>,
    pub throttle_ms: Option<u64>,
    pub skip_failed: Option<bool>,
}

/// External tool names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub remotezip: String,
    pub apfs_fuse: String,
    pub splitter: String,
    pub dump_tool: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            remotezip: "remotezip".to_string(),
            apfs_fuse: "apfs-fuse".to_string(),
            splitter: "dyldex_all".to_string(),
            dump_tool: DEFAULT_DUMP_TOOL.to_string(),
        }
    }
}

/// Acquisition tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireSettings {
    pub retry: RetryPolicy,
    pub second_largest_from_major: u32,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            second_largest_from_major: DEFAULT_SECOND_LARGEST_FROM_MAJOR,
        }
    }
}

/// Dump stage tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSettings {
    /// Worker count
    pub workers: usize,
    /// Pause after each successful dump, in milliseconds
    pub throttle_ms: u64,
    /// Leave items with a failure marker out of the work set
    pub skip_failed: bool,
}

impl Default for DumpSettings {
    fn default() -> Self {
        Self {
            workers: default_parallelism(),
            throttle_ms: 0,
            skip_failed: false,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub device: String,
    pub work_dir: PathBuf,
    pub mount_point: PathBuf,
    /// Prefix for commands needing elevated privileges (`None` runs them directly)
    pub privilege_command: Option<String>,
    pub catalog_url: String,
    pub tools: ToolSettings,
    pub acquire: AcquireSettings,
    /// Parallelism hint passed to the splitter
    pub split_jobs: usize,
    pub dump: DumpSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            work_dir: PathBuf::from("."),
            mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            privilege_command: Some("sudo".to_string()),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            tools: ToolSettings::default(),
            acquire: AcquireSettings::default(),
            split_jobs: default_parallelism(),
            dump: DumpSettings::default(),
            config_file: None,
        }
    }
}

impl Settings {
    /// Defaults rooted at `work_dir`
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }
}

/// Processor count minus one, reserving a core for the orchestrator
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".sdkmirror").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".sdkmirror").join("config.yaml"))
        .filter(|p| p.exists())
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Fold a parsed config file into the defaults
fn apply_config_file(settings: &mut Settings, config: ConfigFile, base_dir: &Path) {
    if let Some(device) = config.device {
        settings.device = device;
    }
    if let Some(ref work_dir) = config.paths.work_dir {
        settings.work_dir = resolve_path(base_dir, work_dir);
    }
    if let Some(ref mount_point) = config.paths.mount_point {
        settings.mount_point = resolve_path(base_dir, mount_point);
    }
    if let Some(prefix) = config.privilege_command {
        settings.privilege_command = Some(prefix).filter(|p| !p.trim().is_empty());
    }

    if let Some(acquire) = config.acquire {
        if let Some(retries) = acquire.retries {
            settings.acquire.retry.max_retries = retries;
        }
        if let Some(delay) = acquire.retry_delay_seconds {
            settings.acquire.retry.delay_secs = delay;
        }
        if let Some(major) = acquire.second_largest_from_major {
            settings.acquire.second_largest_from_major = major;
        }
    }

    if let Some(jobs) = config.split.and_then(|s| s.jobs) {
        settings.split_jobs = jobs.max(1);
    }

    if let Some(dump) = config.dump {
        if let Some(workers) = dump.workers {
            settings.dump.workers = workers.max(1);
        }
        if let Some(throttle) = dump.throttle_ms {
            settings.dump.throttle_ms = throttle;
        }
        if let Some(skip) = dump.skip_failed {
            settings.dump.skip_failed = skip;
        }
    }
}

/// Load configuration from all sources, starting discovery at `cwd`
fn load_settings_from(cwd: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let mut settings = Settings::with_work_dir(cwd);

    let config_file = find_config_file(cwd);
    if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // Base directory is the parent of .sdkmirror/
        let base_dir = config_path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));

        apply_config_file(&mut settings, config, base_dir);
    }
    settings.config_file = config_file;

    if let Some(work_dir) = env("SDKMIRROR_WORK_DIR") {
        settings.work_dir = PathBuf::from(work_dir);
    }
    if let Some(device) = env("SDKMIRROR_DEVICE") {
        settings.device = device;
    }
    if let Some(mount_point) = env("SDKMIRROR_MOUNT_POINT") {
        settings.mount_point = PathBuf::from(mount_point);
    }

    Ok(settings)
}

fn load_settings() -> Result<Settings> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_settings_from(&cwd, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static Settings> {
    let result = CONFIG.get_or_init(|| load_settings().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(settings) => Ok(settings),
        Err(e) => anyhow::bail!("{}", e),
    }
}
