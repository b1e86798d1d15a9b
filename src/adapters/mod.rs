//! Adapter interfaces for external tools and services.
//!
//! Everything the pipeline does not implement itself sits behind one of
//! these seams: subprocesses ([`CommandRunner`]), the firmware catalog
//! ([`FirmwareCatalog`]) and the metadata/header generator
//! ([`ArtifactGenerator`]).

pub mod catalog;
pub mod generator;
pub mod runner;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

pub use catalog::{FirmwareCatalog, IpswCatalog};
pub use generator::{ArtifactGenerator, DumpToolGenerator, GeneratedArtifacts};
pub use runner::ProcessRunner;

/// A subprocess invocation as data: program, argument vector, working directory.
///
/// No shell is involved, so arguments are passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Create an invocation of `program` with no arguments
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Create an invocation that runs through a privilege prefix such as `sudo`.
    ///
    /// An empty or missing prefix runs `program` directly.
    pub fn privileged(prefix: Option<&str>, program: impl Into<OsString>) -> Self {
        match prefix.filter(|p| !p.trim().is_empty()) {
            Some(prefix) => Self::new(prefix).arg(program.into()),
            None => Self::new(program),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir` instead of the current directory
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Program name as a lossy string (for logs and fakes)
    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Arguments as lossy strings (for logs and fakes)
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Executes external tools.
///
/// Retry is a caller concern; implementations run each command exactly once.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and report whether it exited successfully.
    ///
    /// Returns `Err` only when the process could not be started.
    async fn run(&self, spec: &CommandSpec) -> Result<bool>;

    /// Run a command to completion and return its stdout with trailing
    /// whitespace trimmed. A non-zero exit is an error.
    async fn run_capture(&self, spec: &CommandSpec) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_prefix() {
        let spec = CommandSpec::privileged(Some("sudo"), "umount").arg("/mnt/ipsw");
        assert_eq!(spec.program_name(), "sudo");
        assert_eq!(spec.arg_strings(), vec!["umount", "/mnt/ipsw"]);
    }

    #[test]
    fn test_privileged_without_prefix() {
        let spec = CommandSpec::privileged(Some("  "), "umount").arg("/mnt/ipsw");
        assert_eq!(spec.program_name(), "umount");

        let spec = CommandSpec::privileged(None, "rmdir");
        assert_eq!(spec.program_name(), "rmdir");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn test_arguments_are_not_split() {
        let spec = CommandSpec::new("remotezip").args(["https://x/a b.ipsw", "entry; rm -rf /"]);
        assert_eq!(spec.args.len(), 2);
        assert_eq!(spec.to_string(), "remotezip https://x/a b.ipsw entry; rm -rf /");
    }
}
