//! Mounting the firmware image and copying the shared cache out of it.
//!
//! Mounting needs elevated privileges; reading through the mount does not,
//! because the filesystem is mounted with the invoking user's uid/gid.
//!
//! Cleanup (unmount, remove the mount point) only happens after a
//! successful extraction. A failed mount stays in place for inspection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::adapters::{CommandRunner, CommandSpec};

use super::error::PipelineError;

/// Directory inside the mounted filesystem that holds the shared cache
pub const SHARED_CACHE_SUBPATH: &str = "System/Library/Caches/com.apple.dyld";

/// File name prefix of shared cache files (main cache and subcaches)
pub const SHARED_CACHE_PREFIX: &str = "dyld_shared_cache";

/// Directory the FUSE driver exposes the volume under
const MOUNT_ROOT: &str = "root";

/// A mounted firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSession {
    /// Where the image is mounted
    pub mount_point: PathBuf,

    /// Root of the mounted filesystem
    pub root: PathBuf,

    /// Whether this run created `mount_point` (and so must remove it)
    pub created_mount_point: bool,
}

/// Mounts firmware images through a privileged FUSE driver
pub struct Mounter {
    runner: Arc<dyn CommandRunner>,
    mount_point: PathBuf,
    privilege: Option<String>,
    apfs_fuse: String,
}

impl Mounter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        mount_point: impl Into<PathBuf>,
        privilege: Option<String>,
        apfs_fuse: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            mount_point: mount_point.into(),
            privilege,
            apfs_fuse: apfs_fuse.into(),
        }
    }

    fn privileged(&self, program: &str) -> CommandSpec {
        CommandSpec::privileged(self.privilege.as_deref(), program)
    }

    async fn current_id(&self, flag: &str) -> Result<u32> {
        let out = self
            .runner
            .run_capture(&CommandSpec::new("id").arg(flag))
            .await?;
        out.trim()
            .parse()
            .with_context(|| format!("Unexpected output from 'id {}': {}", flag, out))
    }

    /// Whether the mount point is absent, i.e. a later mount will create it
    pub fn mount_point_missing(&self) -> bool {
        !self.mount_point.exists()
    }

    /// Mount `image` and return the session describing the mount.
    ///
    /// `owns_mount_point` marks a mount point created earlier by this run (on a
    /// failed attempt), so cleanup removes it even though it already exists.
    #[instrument(skip(self), fields(mount_point = %self.mount_point.display()))]
    pub async fn mount_image(
        &self,
        image: &Path,
        owns_mount_point: bool,
    ) -> Result<MountSession> {
        let root = self.mount_point.join(MOUNT_ROOT);
        let mut created_mount_point = owns_mount_point;

        if !self.mount_point.exists() {
            let spec = self.privileged("mkdir").arg("-p").arg(&self.mount_point);
            if !self.runner.run(&spec).await? {
                return Err(PipelineError::MountPointFailed(self.mount_point.clone()).into());
            }
            created_mount_point = true;
            debug!("Created mount point");
        }

        if !root.exists() {
            let uid = self.current_id("-u").await?;
            let gid = self.current_id("-g").await?;

            let spec = self
                .privileged(&self.apfs_fuse)
                .arg("-o")
                .arg(format!("uid={},gid={},allow_other", uid, gid))
                .arg(image)
                .arg(&self.mount_point);
            if !self.runner.run(&spec).await? {
                return Err(PipelineError::MountFailed {
                    image: image.to_path_buf(),
                    mount_point: self.mount_point.clone(),
                }
                .into());
            }
            info!(image = %image.display(), "Mounted firmware image");
        } else {
            info!("Firmware image already mounted");
        }

        if !root.exists() {
            return Err(PipelineError::MissingMountRoot(root).into());
        }

        Ok(MountSession {
            mount_point: self.mount_point.clone(),
            root,
            created_mount_point,
        })
    }

    /// Unmount and remove the mount point if the session created it
    pub async fn cleanup(&self, session: &MountSession) -> Result<()> {
        if session.root.exists() {
            let spec = self.privileged("umount").arg(&session.mount_point);
            if !self.runner.run(&spec).await? {
                return Err(PipelineError::UnmountFailed(session.mount_point.clone()).into());
            }
            info!(mount_point = %session.mount_point.display(), "Unmounted");
        }

        if session.created_mount_point && session.mount_point.exists() {
            let spec = self.privileged("rmdir").arg(&session.mount_point);
            if !self.runner.run(&spec).await? {
                return Err(PipelineError::MountPointRemoveFailed(session.mount_point.clone()).into());
            }
            debug!(mount_point = %session.mount_point.display(), "Removed mount point");
        }

        Ok(())
    }
}

/// Copy every shared cache file under `root` into `dest`, keeping file names.
pub async fn extract_shared_cache(root: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let cache_dir = root.join(SHARED_CACHE_SUBPATH);

    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| PipelineError::io(dest, e))?;

    let mut entries = tokio::fs::read_dir(&cache_dir)
        .await
        .map_err(|e| PipelineError::io(&cache_dir, e))?;

    let mut copied = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(&cache_dir, e))?
    {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SHARED_CACHE_PREFIX) {
            continue;
        }

        let target = dest.join(&name);
        tokio::fs::copy(entry.path(), &target)
            .await
            .map_err(|e| PipelineError::io(&target, e))?;
        info!(file = %name.to_string_lossy(), "Copied shared cache file");
        copied.push(target);
    }

    if copied.is_empty() {
        return Err(PipelineError::NoSharedCache(cache_dir).into());
    }

    copied.sort();
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_extract_copies_only_cache_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("mnt/root");
        let cache_dir = root.join(SHARED_CACHE_SUBPATH);
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("dyld_shared_cache_arm64"), b"main").unwrap();
        std::fs::write(cache_dir.join("dyld_shared_cache_arm64.1"), b"sub").unwrap();
        std::fs::write(cache_dir.join("unrelated.plist"), b"x").unwrap();

        let dest = temp.path().join("out");
        let copied = extract_shared_cache(&root, &dest).await.unwrap();

        assert_eq!(copied.len(), 2);
        assert_eq!(
            std::fs::read(dest.join("dyld_shared_cache_arm64")).unwrap(),
            b"main"
        );
        assert!(!dest.join("unrelated.plist").exists());
    }

    #[tokio::test]
    async fn test_extract_without_cache_fails() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir_all(root.join(SHARED_CACHE_SUBPATH)).unwrap();

        let err = extract_shared_cache(&root, &temp.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoSharedCache(_))
        ));
    }
}
