use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pdm_core::{CheckinRequest, ServerFileMetadata};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::fs::{FsError, LocalFs};
use super::index::{EntryUpdate, FileIndex, IndexError, IndexSnapshot};
use super::model::{LocalFacts, Vault, VaultFile};
use super::paths::local_path_for;
use super::remote::{RemoteError, RemoteVault, with_timeout};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0} has no server record")]
    NotOnServer(String),
    #[error("{path} is not checked out by you")]
    NotHeld { path: String },
    #[error("{path} is checked out by {holder}")]
    HeldByOther { path: String, holder: String },
    #[error("server error: {0}")]
    Remote(#[from] RemoteError),
    #[error("filesystem error: {0}")]
    Local(#[from] FsError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

/// Checkout ownership of a file as this client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutLock {
    Unlocked,
    HeldByMe,
    HeldByOther {
        user_id: String,
        display_name: Option<String>,
    },
    /// Checkout requested, server has not answered yet.
    PendingCheckout,
}

impl CheckoutLock {
    /// Derived strictly from the server record.
    pub fn from_record(record: Option<&ServerFileMetadata>, user_id: &str) -> Self {
        let Some(holder) = record.and_then(|record| record.checked_out_by.as_deref()) else {
            return CheckoutLock::Unlocked;
        };
        if holder == user_id {
            return CheckoutLock::HeldByMe;
        }
        CheckoutLock::HeldByOther {
            user_id: holder.to_string(),
            display_name: record
                .and_then(|record| record.checked_out_user.as_ref())
                .and_then(|user| user.full_name.clone().or_else(|| user.email.clone())),
        }
    }

    pub fn holder_label(&self) -> Option<String> {
        match self {
            CheckoutLock::HeldByOther {
                user_id,
                display_name,
            } => Some(display_name.clone().unwrap_or_else(|| user_id.clone())),
            _ => None,
        }
    }
}

/// True iff the file is purely local or checked out by `user_id`.
pub fn can_mutate(file: &VaultFile, user_id: &str) -> bool {
    match file.server_record() {
        None => true,
        Some(record) => record.checked_out_by.as_deref() == Some(user_id),
    }
}

/// Files at or beneath `path` that `user_id` may not mutate.
pub fn blocking_descendants(snapshot: &IndexSnapshot, path: &str, user_id: &str) -> Vec<String> {
    let own = snapshot.get(path).into_iter();
    own.chain(snapshot.descendants(path))
        .filter(|file| !file.is_directory() && file.is_local() && !can_mutate(file, user_id))
        .map(|file| file.relative_path().to_string())
        .collect()
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<String>>,
    path: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Mirrors server checkouts and performs lock transitions as server round trips.
pub struct LockCoordinator {
    remote: Arc<dyn RemoteVault>,
    fs: Arc<dyn LocalFs>,
    index: Arc<FileIndex>,
    pending: Mutex<HashSet<String>>,
    remote_timeout: Duration,
}

impl LockCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteVault>,
        fs: Arc<dyn LocalFs>,
        index: Arc<FileIndex>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            fs,
            index,
            pending: Mutex::new(HashSet::new()),
            remote_timeout,
        }
    }

    pub fn can_mutate(&self, file: &VaultFile, user_id: &str) -> bool {
        can_mutate(file, user_id)
    }

    /// The derived lock with the optimistic checkout overlay on top.
    pub fn lock_view(&self, file: &VaultFile, user_id: &str) -> CheckoutLock {
        let derived = CheckoutLock::from_record(file.server_record(), user_id);
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(file.relative_path());
        match derived {
            CheckoutLock::Unlocked if pending => CheckoutLock::PendingCheckout,
            other => other,
        }
    }

    fn begin_pending(&self, path: &str) -> PendingGuard<'_> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
        PendingGuard {
            pending: &self.pending,
            path: path.to_string(),
        }
    }

    /// Checks the file out on the server, then makes the local copy writable.
    /// A local failure releases the fresh checkout again.
    pub async fn request_checkout(
        &self,
        vault: &Vault,
        user_id: &str,
        file: &VaultFile,
    ) -> Result<ServerFileMetadata, LockError> {
        let path = file.relative_path();
        let record = file
            .server_record()
            .ok_or_else(|| LockError::NotOnServer(path.to_string()))?;
        match CheckoutLock::from_record(Some(record), user_id) {
            CheckoutLock::HeldByMe => return Ok(record.clone()),
            lock @ CheckoutLock::HeldByOther { .. } => {
                return Err(LockError::HeldByOther {
                    path: path.to_string(),
                    holder: lock.holder_label().unwrap_or_default(),
                });
            }
            _ => {}
        }

        let _pending = self.begin_pending(path);
        let confirmed = with_timeout(
            self.remote_timeout,
            self.remote.checkout(&record.id, user_id),
        )
        .await?;

        if file.is_local() {
            let local = local_path_for(&vault.local_root, path).map_err(FsError::from)?;
            if let Err(err) = self.fs.set_readonly(&local, false).await {
                warn!(path, "could not make checked-out file writable, releasing: {err}");
                let release = with_timeout(
                    self.remote_timeout,
                    self.remote
                        .checkin(&record.id, user_id, &CheckinRequest::default()),
                )
                .await;
                if let Err(release_err) = release {
                    warn!(path, "releasing checkout failed: {release_err}");
                }
                return Err(err.into());
            }
        }

        self.index
            .apply(EntryUpdate::ServerRecord {
                path: path.to_string(),
                record: confirmed.clone(),
            })
            .await?;
        info!(path, vault_id = %vault.id, "checked out");
        Ok(confirmed)
    }

    /// Publishes the check-in and releases the lock. The local copy becomes
    /// read-only and its recorded version follows the server.
    pub async fn request_checkin(
        &self,
        vault: &Vault,
        user_id: &str,
        file: &VaultFile,
        local: LocalFacts,
        request: &CheckinRequest,
    ) -> Result<ServerFileMetadata, LockError> {
        let path = file.relative_path();
        let record = file
            .server_record()
            .ok_or_else(|| LockError::NotOnServer(path.to_string()))?;
        match CheckoutLock::from_record(Some(record), user_id) {
            CheckoutLock::HeldByMe => {}
            lock @ CheckoutLock::HeldByOther { .. } => {
                return Err(LockError::HeldByOther {
                    path: path.to_string(),
                    holder: lock.holder_label().unwrap_or_default(),
                });
            }
            _ => {
                return Err(LockError::NotHeld {
                    path: path.to_string(),
                });
            }
        }

        let published = with_timeout(
            self.remote_timeout,
            self.remote.checkin(&record.id, user_id, request),
        )
        .await?;

        let local_path = local_path_for(&vault.local_root, path).map_err(FsError::from)?;
        if let Err(err) = self.fs.set_readonly(&local_path, true).await {
            // The server side is done; the next checkout makes it writable anyway.
            warn!(path, "could not make checked-in file read-only: {err}");
        }

        self.index
            .apply(EntryUpdate::CheckedIn {
                path: path.to_string(),
                record: published.clone(),
                local,
            })
            .await?;
        info!(path, version = published.version, "checked in");
        Ok(published)
    }

    /// Clears another user's checkout. Their working copy is not touched, so
    /// any edits they made there are orphaned.
    pub async fn force_release(
        &self,
        admin_user_id: &str,
        file: &VaultFile,
    ) -> Result<ServerFileMetadata, LockError> {
        let path = file.relative_path();
        let record = file
            .server_record()
            .ok_or_else(|| LockError::NotOnServer(path.to_string()))?;
        let released = with_timeout(
            self.remote_timeout,
            self.remote.force_release_checkout(&record.id, admin_user_id),
        )
        .await?;
        self.index
            .apply(EntryUpdate::ServerRecord {
                path: path.to_string(),
                record: released.clone(),
            })
            .await?;
        debug!(path, previous_holder = ?record.checked_out_by, "checkout force-released");
        Ok(released)
    }
}
