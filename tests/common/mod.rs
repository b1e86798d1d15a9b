//! Shared fakes for the integration tests.
//!
//! `ScriptedRunner` stands in for every external tool the pipeline drives
//! and simulates its filesystem effects, so a whole run can happen inside a
//! temporary directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;

use sdkmirror::adapters::{
    ArtifactGenerator, CommandRunner, CommandSpec, FirmwareCatalog, GeneratedArtifacts,
};
use sdkmirror::core::RetryPolicy;
use sdkmirror::Settings;

pub const ARCHIVE_URL: &str = "https://updates.example.com/iPhone10,3_16.0_Restore.ipsw";

pub const LISTING: &str = "\
  Length            DateTime  Name
---------  -------------------  ------------------------
    55231  2022-09-01 10:00:00  BuildManifest.plist
104857600  2022-09-01 10:00:00  098-12345-001.dmg
 73400320  2022-09-01 10:00:00  098-12346-001.dmg
6442450944  2022-09-01 10:00:00  098-12347-001.dmg
";

/// Settings rooted in `work_dir` that never touch the real system
pub fn test_settings(work_dir: &Path) -> Settings {
    let mut settings = Settings::with_work_dir(work_dir);
    settings.mount_point = work_dir.join("mnt");
    settings.privilege_command = None;
    settings.acquire.retry = RetryPolicy::immediate(5);
    settings.split_jobs = 2;
    settings.dump.workers = 2;
    settings
}

/// Create `path` (and its parents) with placeholder contents
pub fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"\xcf\xfa\xed\xfe").unwrap();
}

/// Runner simulating remotezip, id, mkdir, apfs-fuse, umount, rmdir and the splitter
#[derive(Default)]
pub struct ScriptedRunner {
    pub calls: Mutex<Vec<CommandSpec>>,
    /// Binaries the splitter produces, relative to the extracted root
    pub binaries: Vec<String>,
    /// Program whose next invocation fails, once
    pub fail_once: Mutex<Option<String>>,
}

impl ScriptedRunner {
    pub fn with_binaries(binaries: &[&str]) -> Self {
        Self {
            binaries: binaries.iter().map(|b| b.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Make the next invocation of `program` fail
    pub fn failing_once_on(self, program: &str) -> Self {
        *self.fail_once.lock().unwrap() = Some(program.to_string());
        self
    }

    fn should_fail(&self, spec: &CommandSpec) -> bool {
        let mut fail_once = self.fail_once.lock().unwrap();
        if fail_once.as_deref() == Some(spec.program_name().as_str()) {
            *fail_once = None;
            return true;
        }
        false
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program_name())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn simulate(&self, spec: &CommandSpec) -> Result<bool> {
        let args = spec.arg_strings();
        match spec.program_name().as_str() {
            "remotezip" => {
                let cwd = spec.cwd.clone().ok_or_else(|| anyhow!("fetch without cwd"))?;
                touch(&cwd.join(&args[1]));
            }
            "mkdir" => std::fs::create_dir_all(&args[1])?,
            "apfs-fuse" => {
                let cache = Path::new(&args[3]).join("root/System/Library/Caches/com.apple.dyld");
                touch(&cache.join("dyld_shared_cache_arm64"));
                touch(&cache.join("dyld_shared_cache_arm64.1"));
            }
            "umount" => std::fs::remove_dir_all(Path::new(&args[0]).join("root"))?,
            "rmdir" => std::fs::remove_dir(&args[0])?,
            "dyldex_all" => {
                let cwd = spec.cwd.clone().ok_or_else(|| anyhow!("split without cwd"))?;
                let system = cwd.join("binaries/System");
                for binary in &self.binaries {
                    touch(&system.join(binary));
                }
            }
            other => bail!("unexpected command {}", other),
        }
        Ok(true)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<bool> {
        self.calls.lock().unwrap().push(spec.clone());
        if self.should_fail(spec) {
            return Ok(false);
        }
        self.simulate(spec)
    }

    async fn run_capture(&self, spec: &CommandSpec) -> Result<String> {
        self.calls.lock().unwrap().push(spec.clone());
        if self.should_fail(spec) {
            bail!("{} exited with status 1", spec.program_name());
        }
        match spec.program_name().as_str() {
            "remotezip" => Ok(LISTING.trim_end().to_string()),
            "id" => Ok("1000".to_string()),
            other => bail!("unexpected capture of {}", other),
        }
    }
}

/// Catalog that counts lookups and either answers or fails
pub struct CountingCatalog {
    pub calls: AtomicUsize,
    pub answer: Option<String>,
}

impl CountingCatalog {
    pub fn answering(url: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            answer: Some(url.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            answer: None,
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirmwareCatalog for CountingCatalog {
    async fn firmware_url(&self, _device: &str, _version: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(url) => Ok(Some(url.clone())),
            None => bail!("catalog unavailable"),
        }
    }
}

/// Generator failing on binaries whose file name is listed in `fail_on`
#[derive(Default)]
pub struct FakeGenerator {
    pub fail_on: Vec<String>,
    pub generated: Mutex<Vec<PathBuf>>,
    pub version_calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn failing_on(names: &[&str]) -> Self {
        Self {
            fail_on: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.generated.lock().unwrap().len() + self.version_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactGenerator for FakeGenerator {
    async fn tool_version(&self) -> Result<String> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        Ok("ktool 1.4.0".to_string())
    }

    async fn generate(&self, binary: &Path) -> Result<GeneratedArtifacts> {
        self.generated.lock().unwrap().push(binary.to_path_buf());

        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.fail_on.contains(&name) {
            bail!("malformed load commands in {}", name);
        }

        let mut headers = BTreeMap::new();
        headers.insert(format!("{}.h", name), format!("@interface {}\n@end\n", name));

        Ok(GeneratedArtifacts {
            stub: format!("--- !tapi-tbd\ninstall-name: {}\n...\n", name),
            data: json!({ "install_name": name }),
            objc: serde_json::Value::Null,
            headers,
        })
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
