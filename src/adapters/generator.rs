//! Metadata, stub and header generation for one binary.
//!
//! Parsing Mach-O images and laying out headers is delegated to an external
//! dump tool. Each call runs in its own process, so a crash on a malformed
//! binary only takes down that one invocation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::{CommandRunner, CommandSpec};

/// Default dump tool binary
pub const DEFAULT_DUMP_TOOL: &str = "ktool-dump";

/// Everything the generator produces for one binary
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifacts {
    /// Text-based stub document
    pub stub: String,

    /// Serialized library structure (opaque)
    pub data: serde_json::Value,

    /// Serialized Objective-C metadata; `Null` when the binary carries none
    pub objc: serde_json::Value,

    /// Reconstructed header text keyed by header file name
    pub headers: BTreeMap<String, String>,
}

/// Turns a binary into its artifact contents
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    /// Version string recorded in every JSON document
    async fn tool_version(&self) -> Result<String>;

    /// Parse `binary` and generate its stub, metadata and headers
    async fn generate(&self, binary: &Path) -> Result<GeneratedArtifacts>;
}

/// Bundle printed by `ktool-dump --sorted <binary>`
#[derive(Debug, Deserialize)]
struct DumpBundle {
    tbd: String,
    image: serde_json::Value,
    #[serde(default)]
    objc: Option<serde_json::Value>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl From<DumpBundle> for GeneratedArtifacts {
    fn from(bundle: DumpBundle) -> Self {
        Self {
            stub: bundle.tbd,
            data: bundle.image,
            objc: bundle.objc.unwrap_or(serde_json::Value::Null),
            headers: bundle.headers,
        }
    }
}

/// Generator that shells out to the dump tool
pub struct DumpToolGenerator {
    runner: Arc<dyn CommandRunner>,
    program: String,
    version: OnceCell<String>,
}

impl DumpToolGenerator {
    /// Create a generator running `program` through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            version: OnceCell::new(),
        }
    }
}

#[async_trait]
impl ArtifactGenerator for DumpToolGenerator {
    async fn tool_version(&self) -> Result<String> {
        let version = self
            .version
            .get_or_try_init(|| async {
                self.runner
                    .run_capture(&CommandSpec::new(&self.program).arg("--version"))
                    .await
                    .with_context(|| format!("Failed to query {} version", self.program))
            })
            .await?;
        Ok(version.clone())
    }

    async fn generate(&self, binary: &Path) -> Result<GeneratedArtifacts> {
        let spec = CommandSpec::new(&self.program).arg("--sorted").arg(binary);
        let stdout = self.runner.run_capture(&spec).await?;

        let bundle: DumpBundle = serde_json::from_str(&stdout)
            .with_context(|| format!("Malformed dump output for {}", binary.display()))?;

        Ok(bundle.into())
    }
}
