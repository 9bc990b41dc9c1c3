use std::fs::Permissions;
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::error::SyncError;
use super::paths::disk_path_for;

/// setgid + rwxrwxr-x
pub const DIR_MODE: u32 = 0o2775;
pub const FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    File,
    Directory,
    Absent,
}

/// Turns namespace keys into filesystem state under a base directory.
#[derive(Debug, Clone)]
pub struct Materializer {
    base_dir: PathBuf,
    base_key: String,
    prune_directories: bool,
}

impl Materializer {
    pub fn new(base_dir: impl Into<PathBuf>, base_key: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            base_key: base_key.into(),
            prune_directories: true,
        }
    }

    /// Whether a directory delete takes the directory's remaining contents with it.
    pub fn with_pruning(mut self, prune_directories: bool) -> Self {
        self.prune_directories = prune_directories;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, SyncError> {
        Ok(disk_path_for(&self.base_dir, &self.base_key, key)?)
    }

    /// Returns true when at least one directory had to be created.
    pub async fn create_directory(&self, key: &str) -> Result<bool, SyncError> {
        let target = self.path_for(key)?;
        ensure_dir(&target).await
    }

    pub async fn write_value(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            ensure_dir(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&target)
            .await
            .map_err(|err| SyncError::fs(&target, err))?;
        file.set_permissions(Permissions::from_mode(FILE_MODE))
            .await
            .map_err(|err| SyncError::fs(&target, err))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|err| SyncError::fs(&target, err))?;
        file.flush()
            .await
            .map_err(|err| SyncError::fs(&target, err))?;
        file.sync_all()
            .await
            .map_err(|err| SyncError::fs(&target, err))?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<Removed, SyncError> {
        let target = self.path_for(key)?;
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Removed::Absent),
            Err(err) => return Err(SyncError::fs(&target, err)),
        };

        let (result, removed) = if metadata.is_dir() {
            let result = if self.prune_directories {
                tokio::fs::remove_dir_all(&target).await
            } else {
                tokio::fs::remove_dir(&target).await
            };
            (result, Removed::Directory)
        } else {
            (tokio::fs::remove_file(&target).await, Removed::File)
        };

        match result {
            Ok(()) => Ok(removed),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Removed::Absent),
            Err(err) => Err(SyncError::fs(&target, err)),
        }
    }
}

async fn ensure_dir(target: &Path) -> Result<bool, SyncError> {
    let mut missing = Vec::new();
    let mut cursor = Some(target);
    while let Some(dir) = cursor {
        match tokio::fs::metadata(dir).await {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(SyncError::fs(
                    dir,
                    io::Error::new(ErrorKind::NotADirectory, "path exists and is not a directory"),
                ));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                missing.push(dir.to_path_buf());
                cursor = dir.parent();
            }
            Err(err) => return Err(SyncError::fs(dir, err)),
        }
    }

    let created = !missing.is_empty();
    for dir in missing.into_iter().rev() {
        match tokio::fs::DirBuilder::new().mode(DIR_MODE).create(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(SyncError::fs(&dir, err)),
        }
        // Creation modes are filtered by the umask.
        tokio::fs::set_permissions(&dir, Permissions::from_mode(DIR_MODE))
            .await
            .map_err(|err| SyncError::fs(&dir, err))?;
    }
    Ok(created)
}
