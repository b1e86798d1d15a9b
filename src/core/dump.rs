//! Dump stage: per-binary artifact generation fanned out over a worker pool.
//!
//! # Architecture
//!
//! ```text
//! discover_work_set ──► bounded channel ──► worker 1 ─► dump_one ─► generator process
//!                                      ├──► worker 2 ─► dump_one ─► generator process
//!                                      └──► worker N ─► ...
//!                                                   JoinSet (wait for all)
//! ```
//!
//! Items are independent: a worker only touches paths derived from its own
//! binary, so there is no locking between workers. A failing item is logged
//! and skipped; it never stops the batch. Because the stub is written last,
//! a failed item has no stub and is picked up again on the next run.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adapters::ArtifactGenerator;
use crate::domain::artifact::{FAILURE_SUFFIX, JSON_SUFFIX, STUB_SUFFIX};
use crate::domain::{DumpDocument, WorkItem};

/// Per-item failure
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("generator failed on {path}: {message}")]
    Generator { path: PathBuf, message: String },

    #[error("refusing to write header named '{name}'")]
    UnsafeHeaderName { name: String },

    #[error("failed to serialize metadata for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An item that failed during this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    /// Path relative to the extracted root
    pub item: String,
    pub error: String,
}

/// Outcome of one dump batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedItem>,
}

impl DumpSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Whether `name` is one of the artifacts this tool writes, or a header
fn is_artifact_name(name: &str) -> bool {
    name.contains(".h") || name.contains(STUB_SUFFIX)
}

/// Whether `path` is a JSON document or failure marker belonging to a sibling binary
fn is_own_output(path: &Path, name: &str) -> bool {
    if name.ends_with(FAILURE_SUFFIX) {
        return true;
    }
    if let Some(stem) = name.strip_suffix(JSON_SUFFIX) {
        return !stem.is_empty() && path.with_file_name(stem).is_file();
    }
    false
}

/// Scan the extracted tree for binaries that still need dumping.
///
/// A file qualifies when it has no `.tbd` sibling and its name contains
/// neither `.h` nor `.tbd`. JSON documents and failure markers written by
/// this tool are never candidates. With `skip_failed`, binaries carrying a
/// failure marker are left out as well. The result is sorted.
pub fn discover_work_set(root: &Path, skip_failed: bool) -> Result<Vec<WorkItem>> {
    let pattern = format!(
        "{}/**/*",
        glob::Pattern::escape(&root.to_string_lossy())
    );

    let mut found = BTreeSet::new();
    for entry in glob::glob(&pattern).context("Invalid work set glob pattern")? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path");
                continue;
            }
        };

        if !path.is_file() {
            continue;
        }

        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        if is_artifact_name(&name) || is_own_output(&path, &name) {
            continue;
        }

        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let item = WorkItem::new(root, relative);

        if item.is_complete() {
            continue;
        }
        if skip_failed && item.has_failed_before() {
            debug!(item = %item.display_name(), "Skipping previously failed item");
            continue;
        }

        found.insert(item);
    }

    Ok(found.into_iter().collect())
}

/// Header names become file names; keep them inside the `Headers` directory
fn check_header_name(name: &str) -> Result<(), DumpError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(DumpError::UnsafeHeaderName {
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), DumpError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| DumpError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `contents` to `path` through a temp file in the same directory.
///
/// The temp name carries `.tbd` so a leftover from a crash is never
/// mistaken for a binary.
async fn write_atomic(path: PathBuf, contents: String) -> Result<(), DumpError> {
    let target = path.clone();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tbd.partial")
            .tempfile_in(dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(DumpError::Write {
            path: target,
            source,
        }),
        Err(join) => Err(DumpError::Write {
            path: target,
            source: std::io::Error::new(std::io::ErrorKind::Other, join.to_string()),
        }),
    }
}

/// Dump one binary: JSON document, headers, then the stub.
///
/// Returns the number of headers written.
pub async fn dump_one(
    item: &WorkItem,
    generator: &dyn ArtifactGenerator,
    tool_version: &str,
) -> Result<usize, DumpError> {
    let path = item.path();

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|source| DumpError::Unreadable {
            path: path.clone(),
            source,
        })?;
    if !metadata.is_file() {
        return Err(DumpError::Unreadable {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }

    let artifacts = generator
        .generate(&path)
        .await
        .map_err(|e| DumpError::Generator {
            path: path.clone(),
            message: format!("{:#}", e),
        })?;

    for name in artifacts.headers.keys() {
        check_header_name(name)?;
    }

    let document = DumpDocument::new(item, tool_version, artifacts.data, artifacts.objc);
    let json = serde_json::to_vec(&document).map_err(|source| DumpError::Serialize {
        path: path.clone(),
        source,
    })?;
    write_file(&item.json_path(), &json).await?;

    let headers_dir = item.headers_dir();
    tokio::fs::create_dir_all(&headers_dir)
        .await
        .map_err(|source| DumpError::Write {
            path: headers_dir.clone(),
            source,
        })?;
    let mut written = Vec::with_capacity(artifacts.headers.len());
    for (name, text) in &artifacts.headers {
        let header = headers_dir.join(name);
        if let Err(e) = write_file(&header, text.as_bytes()).await {
            discard_headers(item, &written).await;
            return Err(e);
        }
        written.push(header);
    }

    if let Err(e) = write_atomic(item.stub_path(), artifacts.stub).await {
        discard_headers(item, &written).await;
        return Err(e);
    }

    Ok(written.len())
}

/// Remove headers an unfinished item already wrote
async fn discard_headers(item: &WorkItem, headers: &[PathBuf]) {
    for header in headers {
        if let Err(e) = tokio::fs::remove_file(header).await {
            warn!(
                item = %item.display_name(),
                header = %header.display(),
                error = %e,
                "Failed to remove header"
            );
        }
    }
}

/// Remove partial output and leave a failure marker
async fn record_failure(item: &WorkItem, err: &DumpError) {
    match tokio::fs::remove_file(item.json_path()).await {
        Ok(()) => debug!(item = %item.display_name(), "Removed partial JSON document"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(item = %item.display_name(), error = %e, "Failed to remove partial JSON"),
    }

    let marker = format!("{}\n{}\n", chrono::Utc::now().to_rfc3339(), err);
    if let Err(e) = tokio::fs::write(item.failure_path(), marker).await {
        warn!(item = %item.display_name(), error = %e, "Failed to write failure marker");
    }
}

/// Fixed-size pool of dump workers
pub struct DumpPool {
    generator: Arc<dyn ArtifactGenerator>,
    workers: usize,
    throttle: Duration,
}

impl DumpPool {
    pub fn new(generator: Arc<dyn ArtifactGenerator>, workers: usize) -> Self {
        Self {
            generator,
            workers: workers.max(1),
            throttle: Duration::ZERO,
        }
    }

    /// Pause each worker for `throttle` after every successful dump
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Dump every item and wait for all of them to finish
    pub async fn run(&self, items: Vec<WorkItem>) -> Result<DumpSummary> {
        let total = items.len();
        if total == 0 {
            return Ok(DumpSummary::default());
        }

        let tool_version: Arc<str> = self
            .generator
            .tool_version()
            .await
            .context("Failed to determine generator version")?
            .into();

        let workers = self.workers.min(total);
        info!(items = total, workers, "Dumping binaries");

        let (tx, rx) = mpsc::channel::<WorkItem>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let generator = Arc::clone(&self.generator);
            let tool_version = Arc::clone(&tool_version);
            let throttle = self.throttle;

            pool.spawn(async move {
                let mut succeeded = 0usize;
                let mut failed = Vec::new();

                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(item) = next else { break };

                    info!(worker = worker_id, item = %item.display_name(), "Dumping");
                    match dump_one(&item, generator.as_ref(), &tool_version).await {
                        Ok(headers) => {
                            if let Err(e) = tokio::fs::remove_file(item.failure_path()).await {
                                if e.kind() != std::io::ErrorKind::NotFound {
                                    warn!(item = %item.display_name(), error = %e, "Failed to clear failure marker");
                                }
                            }
                            debug!(item = %item.display_name(), headers, "Dumped");
                            succeeded += 1;
                            if !throttle.is_zero() {
                                tokio::time::sleep(throttle).await;
                            }
                        }
                        Err(e) => {
                            error!(item = %item.display_name(), error = %e, "Failed to dump");
                            record_failure(&item, &e).await;
                            failed.push(FailedItem {
                                item: item.display_name(),
                                error: e.to_string(),
                            });
                        }
                    }
                }

                (succeeded, failed)
            });
        }

        for item in items {
            if tx.send(item).await.is_err() {
                error!("All dump workers exited early");
                break;
            }
        }
        drop(tx);

        let mut summary = DumpSummary {
            total,
            ..Default::default()
        };
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((succeeded, failed)) => {
                    summary.succeeded += succeeded;
                    summary.failed.extend(failed);
                }
                Err(e) => error!(error = %e, "Dump worker panicked"),
            }
        }
        summary.failed.sort_by(|a, b| a.item.cmp(&b.item));

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "Dump stage finished"
        );

        Ok(summary)
    }
}
