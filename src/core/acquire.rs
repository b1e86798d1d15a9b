//! Firmware acquisition.
//!
//! Only the system image entry is pulled out of the remote firmware archive;
//! the rest of the archive (several GB) is never downloaded.
//!
//! Which entry holds the system image depends on the firmware generation:
//! before the threshold major version it is the largest file, from the
//! threshold on it is the second-largest. This is a heuristic about the
//! archive layout and will break silently if that layout changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::adapters::{CommandRunner, CommandSpec, FirmwareCatalog};
use crate::domain::VersionId;

use super::error::PipelineError;

/// Local name of the acquired system image
pub const CANONICAL_IMAGE: &str = "system.dmg";

/// One file listed inside the remote archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub size: u64,
    pub name: String,
}

/// Parse `remotezip -l` output.
///
/// Data lines look like `<size> <date> <time> <name>`; header and separator
/// lines do not start with a number and are skipped.
pub fn parse_listing(listing: &str) -> Vec<ArchiveEntry> {
    listing
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let size = fields[0].parse::<u64>().ok()?;
            Some(ArchiveEntry {
                size,
                name: fields[3..].join(" "),
            })
        })
        .collect()
}

/// Which archive entry is the system image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPolicy {
    Largest,
    SecondLargest,
}

impl EntryPolicy {
    /// Policy for `version` given the first major version using the second-largest entry
    pub fn for_version(version: &VersionId, second_largest_from_major: u32) -> Self {
        match version.major() {
            Some(major) if major >= second_largest_from_major => EntryPolicy::SecondLargest,
            Some(_) => EntryPolicy::Largest,
            None => {
                warn!(%version, "Cannot read major version, assuming largest archive entry");
                EntryPolicy::Largest
            }
        }
    }

    /// Pick the entry from a listing
    pub fn select<'a>(&self, entries: &'a [ArchiveEntry]) -> Option<&'a ArchiveEntry> {
        let mut by_size: Vec<&ArchiveEntry> = entries.iter().collect();
        by_size.sort_by_key(|e| e.size);

        match self {
            EntryPolicy::Largest => by_size.last().copied(),
            EntryPolicy::SecondLargest => {
                if by_size.len() < 2 {
                    None
                } else {
                    Some(by_size[by_size.len() - 2])
                }
            }
        }
    }
}

/// Fetches the system image of one firmware build
pub struct Acquirer {
    runner: Arc<dyn CommandRunner>,
    catalog: Arc<dyn FirmwareCatalog>,
    remotezip: String,
    second_largest_from_major: u32,
}

impl Acquirer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        catalog: Arc<dyn FirmwareCatalog>,
        remotezip: impl Into<String>,
        second_largest_from_major: u32,
    ) -> Self {
        Self {
            runner,
            catalog,
            remotezip: remotezip.into(),
            second_largest_from_major,
        }
    }

    /// Acquire the system image of `version` for `device` into `work_dir`.
    ///
    /// Returns the path of the canonical image. An image left behind by an
    /// earlier attempt is reused rather than fetched again.
    #[instrument(skip(self, version, work_dir), fields(version = %version))]
    pub async fn acquire(
        &self,
        version: &VersionId,
        device: &str,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        let canonical = work_dir.join(CANONICAL_IMAGE);

        let url = self
            .catalog
            .firmware_url(device, version.as_str())
            .await?
            .ok_or_else(|| PipelineError::NoFirmware {
                device: device.to_string(),
                version: version.to_string(),
            })?;
        info!(%url, "Resolved firmware archive");

        let listing = self
            .runner
            .run_capture(&CommandSpec::new(&self.remotezip).arg("-l").arg(&url))
            .await?;
        let entries = parse_listing(&listing);
        let policy = EntryPolicy::for_version(version, self.second_largest_from_major);
        let entry = policy
            .select(&entries)
            .ok_or_else(|| PipelineError::NoSystemImage { url: url.clone() })?
            .name
            .clone();
        info!(%entry, ?policy, "Selected system image entry");

        let fetched = work_dir.join(&entry);
        if !fetched.exists() && !canonical.exists() {
            let spec = CommandSpec::new(&self.remotezip)
                .arg(&url)
                .arg(&entry)
                .current_dir(work_dir);
            if !self.runner.run(&spec).await? {
                return Err(PipelineError::FetchFailed { url, entry }.into());
            }
        }

        if !canonical.exists() {
            if !fetched.exists() {
                return Err(PipelineError::FetchedEntryMissing(fetched).into());
            }
            tokio::fs::rename(&fetched, &canonical)
                .await
                .map_err(|e| PipelineError::io(&canonical, e))?;
            info!("{} -> {}", fetched.display(), canonical.display());
        } else {
            info!(image = %canonical.display(), "Reusing acquired image");
        }

        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
  Length            DateTime  Name
---------  -------------------  ------------------------
    55231  2022-09-01 10:00:00  BuildManifest.plist
104857600  2022-09-01 10:00:00  098-12345-001.dmg
 73400320  2022-09-01 10:00:00  098-12346-001.dmg
6442450944  2022-09-01 10:00:00  098-12347-001.dmg
  1048576  2022-09-01 10:00:00  Firmware/all flash/iBoot.img4
";

    #[test]
    fn test_parse_listing_skips_headers() {
        let entries = parse_listing(LISTING);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].name, "BuildManifest.plist");
        assert_eq!(entries[4].name, "Firmware/all flash/iBoot.img4");
        assert_eq!(entries[3].size, 6_442_450_944);
    }

    #[test]
    fn test_largest_entry() {
        let entries = parse_listing(LISTING);
        let chosen = EntryPolicy::Largest.select(&entries).unwrap();
        assert_eq!(chosen.name, "098-12347-001.dmg");
    }

    #[test]
    fn test_second_largest_entry() {
        let entries = parse_listing(LISTING);
        let chosen = EntryPolicy::SecondLargest.select(&entries).unwrap();
        assert_eq!(chosen.name, "098-12345-001.dmg");
    }

    #[test]
    fn test_policy_threshold() {
        let v = |s: &str| VersionId::new(s).unwrap();
        assert_eq!(EntryPolicy::for_version(&v("15.7"), 16), EntryPolicy::Largest);
        assert_eq!(EntryPolicy::for_version(&v("16.0"), 16), EntryPolicy::SecondLargest);
        assert_eq!(EntryPolicy::for_version(&v("17.1.2"), 16), EntryPolicy::SecondLargest);
        assert_eq!(EntryPolicy::for_version(&v("latest"), 16), EntryPolicy::Largest);
    }

    #[test]
    fn test_empty_listing_selects_nothing() {
        assert!(EntryPolicy::Largest.select(&[]).is_none());

        let single = vec![ArchiveEntry {
            size: 1,
            name: "only.dmg".to_string(),
        }];
        assert!(EntryPolicy::SecondLargest.select(&single).is_none());
        assert_eq!(EntryPolicy::Largest.select(&single).unwrap().name, "only.dmg");
    }
}
