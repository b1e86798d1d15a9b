//! Extracted binaries and the artifacts dumped from them.
//!
//! For a binary at `<dir>/<name>` the dump stage writes:
//!
//! - `<dir>/<name>.json`: metadata document ([`DumpDocument`])
//! - `<dir>/Headers/*.h`: reconstructed headers
//! - `<dir>/<name>.tbd`: text stub, written last; its presence marks the item done
//! - `<dir>/<name>.dump-error`: only when the dump failed

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Suffix of the text stub (also the completion marker)
pub const STUB_SUFFIX: &str = ".tbd";

/// Suffix of the JSON metadata document
pub const JSON_SUFFIX: &str = ".json";

/// Suffix of the failure marker
pub const FAILURE_SUFFIX: &str = ".dump-error";

/// Name of the per-directory header folder
pub const HEADERS_DIR: &str = "Headers";

/// Fixed tool identifier stored in every JSON document
pub const DUMP_COMMENT: &str = "Info dumped with ktool + sdkmirror";

/// One binary inside the extracted tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkItem {
    /// Root of the extracted tree
    pub root: PathBuf,

    /// Path of the binary relative to `root`
    pub relative: PathBuf,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl WorkItem {
    pub fn new(root: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            relative: relative.into(),
        }
    }

    /// Absolute (root-joined) path of the binary
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relative)
    }

    /// Relative path with forward slashes, as recorded in the JSON document
    pub fn display_name(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn stub_path(&self) -> PathBuf {
        with_suffix(&self.path(), STUB_SUFFIX)
    }

    pub fn json_path(&self) -> PathBuf {
        with_suffix(&self.path(), JSON_SUFFIX)
    }

    pub fn failure_path(&self) -> PathBuf {
        with_suffix(&self.path(), FAILURE_SUFFIX)
    }

    /// `Headers` directory next to the binary
    pub fn headers_dir(&self) -> PathBuf {
        let path = self.path();
        path.parent()
            .map(|dir| dir.join(HEADERS_DIR))
            .unwrap_or_else(|| PathBuf::from(HEADERS_DIR))
    }

    /// Whether the stub (completion marker) exists
    pub fn is_complete(&self) -> bool {
        self.stub_path().exists()
    }

    /// Whether a failure marker exists
    pub fn has_failed_before(&self) -> bool {
        self.failure_path().exists()
    }
}

/// JSON metadata document written next to each binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpDocument {
    /// Binary path relative to the extracted root
    pub filename: String,

    /// Fixed tool identifier
    pub comment: String,

    /// Version of the generator that produced `data` and `objc`
    #[serde(rename = "tool-version")]
    pub tool_version: String,

    /// Serialized library structure
    pub data: serde_json::Value,

    /// Serialized Objective-C metadata
    pub objc: serde_json::Value,
}

impl DumpDocument {
    pub fn new(
        item: &WorkItem,
        tool_version: impl Into<String>,
        data: serde_json::Value,
        objc: serde_json::Value,
    ) -> Self {
        Self {
            filename: item.display_name(),
            comment: DUMP_COMMENT.to_string(),
            tool_version: tool_version.into(),
            data,
            objc,
        }
    }
}
