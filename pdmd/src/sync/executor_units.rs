//! One function per command kind. Each unit owns exactly one index entry and
//! finishes with a confirmed [`EntryUpdate`].

use std::path::PathBuf;

use pdm_core::{CheckinRequest, SyncNewRequest};
use tracing::{debug, warn};

use crate::sync::fs::FsError;
use crate::sync::index::EntryUpdate;
use crate::sync::model::{LocalFacts, VaultFile, now_unix};
use crate::sync::paths::{extension, file_name, local_path_for, normalize_relative};
use crate::sync::remote::with_timeout;

use super::{BatchRequest, Command, CommandExecutor, Unit, UnitError, invalid};

impl CommandExecutor {
    pub(super) async fn run_unit(
        &self,
        request: &BatchRequest,
        unit: &Unit,
    ) -> Result<(), UnitError> {
        if let Command::NewFolder { .. } = request.command {
            return self.new_folder(request, &unit.path).await;
        }
        let file = unit
            .entry
            .as_ref()
            .ok_or_else(|| invalid(format!("{} has no index entry", unit.path)))?;
        let destination = || {
            unit.destination
                .as_deref()
                .ok_or_else(|| invalid(format!("{} has no destination", unit.path)))
        };

        match &request.command {
            Command::Checkout => self.checkout(request, file).await,
            Command::Checkin => self.checkin(request, file).await,
            Command::Sync => self.sync_new(request, file).await,
            Command::Download => self.download(request, file, false).await,
            Command::GetLatest => self.download(request, file, true).await,
            Command::Move { .. } | Command::Rename { .. } => {
                self.move_item(request, file, destination()?).await
            }
            Command::Copy { .. } => self.copy_item(request, file, destination()?).await,
            Command::NewFolder { .. } => Ok(()),
        }
    }

    fn local_path(&self, request: &BatchRequest, path: &str) -> Result<PathBuf, UnitError> {
        local_path_for(&request.vault.local_root, path)
            .map_err(|err| UnitError::from(FsError::from(err)))
    }

    async fn checkout(&self, request: &BatchRequest, file: &VaultFile) -> Result<(), UnitError> {
        self.locks
            .request_checkout(&request.vault, &request.user_id, file)
            .await?;
        Ok(())
    }

    /// Reads and hashes the local file, uploads changed content, then checks
    /// in any content, path and metadata changes.
    async fn checkin(&self, request: &BatchRequest, file: &VaultFile) -> Result<(), UnitError> {
        let path = file.relative_path();
        let record = file
            .server_record()
            .ok_or_else(|| invalid(format!("{path} is not on the server")))?;
        let content = self.fs.read_file(&self.local_path(request, path)?).await?;
        let size = content.bytes.len() as u64;

        let content_changed = !content.hash.eq_ignore_ascii_case(&record.content_hash);
        if content_changed {
            with_timeout(
                self.config.remote_timeout,
                self.remote
                    .upload_content(&request.vault.org_id, &content.hash, content.bytes),
            )
            .await?;
        }

        let name = file_name(path);
        let checkin = CheckinRequest {
            new_content_hash: content_changed.then(|| content.hash.clone()),
            new_size: content_changed.then_some(size),
            new_path: (!normalize_relative(&record.file_path)
                .is_ok_and(|server_path| server_path == path))
            .then(|| path.to_string()),
            new_name: (record.file_name != name).then(|| name.to_string()),
            metadata: file.pending_metadata().cloned(),
        };
        self.locks
            .request_checkin(
                &request.vault,
                &request.user_id,
                file,
                LocalFacts::read_now(content.hash, size),
                &checkin,
            )
            .await?;
        Ok(())
    }

    async fn sync_new(&self, request: &BatchRequest, file: &VaultFile) -> Result<(), UnitError> {
        let path = file.relative_path();
        let local = self.local_path(request, path)?;
        let content = self.fs.read_file(&local).await?;
        let size = content.bytes.len() as u64;
        let register = SyncNewRequest {
            org_id: request.vault.org_id.clone(),
            vault_id: request.vault.id.clone(),
            user_id: request.user_id.clone(),
            file_path: path.to_string(),
            file_name: file_name(path).to_string(),
            extension: extension(path),
            file_size: size,
            content_hash: content.hash.clone(),
        };
        let record = with_timeout(
            self.config.remote_timeout,
            self.remote.sync_new(&register, content.bytes),
        )
        .await?;

        if let Err(err) = self.fs.set_readonly(&local, true).await {
            warn!(path, "could not make synced file read-only: {err}");
        }
        self.index
            .apply(EntryUpdate::CheckedIn {
                path: path.to_string(),
                record,
                local: LocalFacts::read_now(content.hash, size),
            })
            .await?;
        Ok(())
    }

    /// Fetches verified content for the server's current version and replaces
    /// the local copy atomically.
    async fn download(
        &self,
        request: &BatchRequest,
        file: &VaultFile,
        replace_existing: bool,
    ) -> Result<(), UnitError> {
        let path = file.relative_path();
        let record = file
            .server_record()
            .ok_or_else(|| invalid(format!("{path} is not on the server")))?
            .clone();
        let local = self.local_path(request, path)?;
        let held_by_me = record.checked_out_by.as_deref() == Some(request.user_id.as_str());

        if replace_existing
            && let Some(facts) = file.local()
            && facts
                .hash
                .as_deref()
                .is_some_and(|hash| hash.eq_ignore_ascii_case(&record.content_hash))
        {
            debug!(path, version = record.version, "content already current");
            let facts = facts.clone();
            self.index
                .apply(EntryUpdate::Downloaded {
                    path: path.to_string(),
                    record,
                    local: facts,
                })
                .await?;
            return Ok(());
        }

        let bytes = with_timeout(
            self.config.remote_timeout,
            self.remote
                .fetch_content(&request.vault.org_id, &record.content_hash),
        )
        .await?;

        if let Some(parent) = local.parent() {
            self.fs.ensure_dir(parent).await?;
        }
        self.fs.write_file(&local, &bytes).await?;
        if !held_by_me && let Err(err) = self.fs.set_readonly(&local, true).await {
            warn!(path, "could not make downloaded file read-only: {err}");
        }

        let hash = record.content_hash.to_ascii_lowercase();
        self.index
            .apply(EntryUpdate::Downloaded {
                path: path.to_string(),
                local: LocalFacts::read_now(hash, bytes.len() as u64),
                record,
            })
            .await?;
        Ok(())
    }

    async fn move_item(
        &self,
        request: &BatchRequest,
        file: &VaultFile,
        destination: &str,
    ) -> Result<(), UnitError> {
        let path = file.relative_path();
        let from = self.local_path(request, path)?;
        let to = self.local_path(request, destination)?;
        self.fs.move_item(&from, &to).await?;
        self.index
            .apply(EntryUpdate::Moved {
                from: path.to_string(),
                to: destination.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn copy_item(
        &self,
        request: &BatchRequest,
        file: &VaultFile,
        destination: &str,
    ) -> Result<(), UnitError> {
        let path = file.relative_path();
        let from = self.local_path(request, path)?;
        let to = self.local_path(request, destination)?;
        self.fs.copy_item(&from, &to).await?;
        self.index
            .apply(EntryUpdate::Copied {
                from: path.to_string(),
                to: destination.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn new_folder(&self, request: &BatchRequest, path: &str) -> Result<(), UnitError> {
        self.fs.ensure_dir(&self.local_path(request, path)?).await?;
        self.index
            .apply(EntryUpdate::FolderCreated {
                path: path.to_string(),
                modified: now_unix(),
            })
            .await?;
        Ok(())
    }
}
