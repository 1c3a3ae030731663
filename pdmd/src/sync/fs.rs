//! Local filesystem collaborator.
//!
//! `NativeFs` is the only production implementation. The engine talks to the
//! trait so tests can point it at a temp directory or a failing fake.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::model::ContentHash;
use super::paths::relative_path_for;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("path error: {0}")]
    Path(#[from] super::paths::PathError),
}

impl FsError {
    fn io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_path_buf()),
            _ => FsError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalListing {
    /// Vault-relative, `/`-separated.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: i64,
}

#[async_trait]
pub trait LocalFs: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<FileContent, FsError>;

    /// Writes to a `.partial` sibling first and renames over the target, so a
    /// failed write never leaves a truncated file in place.
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), FsError>;

    async fn set_readonly(&self, path: &Path, readonly: bool) -> Result<(), FsError>;

    async fn move_item(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    async fn copy_item(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    async fn delete_item(&self, path: &Path) -> Result<(), FsError>;

    async fn ensure_dir(&self, path: &Path) -> Result<(), FsError>;

    /// Recursive listing of everything under `root`; symlinks are skipped.
    async fn list_directory(&self, root: &Path) -> Result<Vec<LocalListing>, FsError>;

    async fn exists(&self, path: &Path) -> Result<bool, FsError>;
}

pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFs;

#[async_trait]
impl LocalFs for NativeFs {
    async fn read_file(&self, path: &Path) -> Result<FileContent, FsError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| FsError::io(path, err))?;
        Ok(FileContent {
            hash: hash_bytes(&bytes),
            bytes,
        })
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), FsError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| FsError::io(parent, err))?;
        }
        let partial = partial_path(path);
        if let Err(err) = write_partial(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(FsError::io(&partial, err));
        }
        // Replacing a read-only file fails on some platforms.
        if tokio::fs::metadata(path).await.is_ok() {
            self.set_readonly(path, false).await?;
        }
        if let Err(err) = tokio::fs::rename(&partial, path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(FsError::io(path, err));
        }
        Ok(())
    }

    async fn set_readonly(&self, path: &Path, readonly: bool) -> Result<(), FsError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| FsError::io(path, err))?;
        let mut perms = meta.permissions();
        if perms.readonly() == readonly {
            return Ok(());
        }
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(readonly);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|err| FsError::io(path, err))
    }

    async fn move_item(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        if tokio::fs::symlink_metadata(to).await.is_ok() {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| FsError::io(parent, err))?;
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(|err| FsError::io(from, err))
    }

    async fn copy_item(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        if tokio::fs::symlink_metadata(to).await.is_ok() {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        let meta = tokio::fs::metadata(from)
            .await
            .map_err(|err| FsError::io(from, err))?;
        if !meta.is_dir() {
            return copy_file_writable(self, from, to).await;
        }

        let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
        while let Some((src_dir, dst_dir)) = stack.pop() {
            tokio::fs::create_dir_all(&dst_dir)
                .await
                .map_err(|err| FsError::io(&dst_dir, err))?;
            let mut entries = tokio::fs::read_dir(&src_dir)
                .await
                .map_err(|err| FsError::io(&src_dir, err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| FsError::io(&src_dir, err))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| FsError::io(&entry.path(), err))?;
                let dst = dst_dir.join(entry.file_name());
                if file_type.is_dir() {
                    stack.push((entry.path(), dst));
                } else if file_type.is_file() {
                    copy_file_writable(self, &entry.path(), &dst).await?;
                }
            }
        }
        Ok(())
    }

    async fn delete_item(&self, path: &Path) -> Result<(), FsError> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|err| FsError::io(path, err))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|err| FsError::io(path, err))
        } else {
            if meta.permissions().readonly() {
                self.set_readonly(path, false).await?;
            }
            tokio::fs::remove_file(path)
                .await
                .map_err(|err| FsError::io(path, err))
        }
    }

    async fn ensure_dir(&self, path: &Path) -> Result<(), FsError> {
        if let Ok(meta) = tokio::fs::metadata(path).await
            && meta.is_file()
        {
            return Err(FsError::AlreadyExists(path.to_path_buf()));
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|err| FsError::io(path, err))
    }

    async fn list_directory(&self, root: &Path) -> Result<Vec<LocalListing>, FsError> {
        let mut stack = vec![root.to_path_buf()];
        let mut out = Vec::new();
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|err| FsError::io(&dir, err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| FsError::io(&dir, err))?
            {
                let path = entry.path();
                let meta = match tokio::fs::symlink_metadata(&path).await {
                    Ok(meta) => meta,
                    // Vanished between read_dir and stat.
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(FsError::io(&path, err)),
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                out.push(LocalListing {
                    path: relative_path_for(root, &path)?,
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    is_dir: meta.is_dir(),
                    modified,
                });
                if meta.is_dir() {
                    stack.push(path);
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn exists(&self, path: &Path) -> Result<bool, FsError> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FsError::io(path, err)),
        }
    }
}

async fn write_partial(partial: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(partial).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Copies keep the content but not the read-only bit: a copy is a new,
/// unsynced document the user owns.
async fn copy_file_writable(fs: &NativeFs, from: &Path, to: &Path) -> Result<(), FsError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| FsError::io(parent, err))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|err| FsError::io(from, err))?;
    fs.set_readonly(to, false).await
}
