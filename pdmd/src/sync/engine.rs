//! Command surface exposed to the presentation layer.
//!
//! Every operation takes the vault id and user id explicitly. Commands return
//! a [`BatchHandle`] for progress and cancellation; check-ins issued while
//! the server is unreachable are staged instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pdm_core::ServerFileMetadata;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::batches::ActiveBatches;
use super::executor::{BatchHandle, BatchRequest, Command, CommandExecutor, ExecutorConfig};
use super::fs::LocalFs;
use super::index::{
    EntryUpdate, FileIndex, FolderCheckoutStatus, IndexConfig, IndexError, IndexEvent,
    IndexSnapshot,
};
use super::lock::{CheckoutLock, LockCoordinator, LockError};
use super::model::{Metadata, StagedCheckin, Vault, VaultFile};
use super::registry::{RegistryError, VaultRegistry};
use super::remote::{RemoteError, RemoteVault, with_timeout};
use super::staging::{OfflineStagingQueue, ReplayReport, StagingError};
use super::store::WorkingCopyStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("vault {0} is not the active vault")]
    NotActive(String),
    #[error("{0} is not in the vault index")]
    UnknownPath(String),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub index: IndexConfig,
    pub executor: ExecutorConfig,
}

/// What happened to a check-in request.
pub enum CheckinDispatch {
    Batch(BatchHandle),
    /// The server was unreachable; the files were staged for replay.
    Staged {
        staged: Vec<StagedCheckin>,
        refused: Vec<(String, StagingError)>,
    },
}

pub struct VaultEngine {
    remote: Arc<dyn RemoteVault>,
    fs: Arc<dyn LocalFs>,
    index: Arc<FileIndex>,
    locks: Arc<LockCoordinator>,
    executor: Arc<CommandExecutor>,
    staging: OfflineStagingQueue,
    registry: VaultRegistry,
    config: EngineConfig,
    online: AtomicBool,
}

impl VaultEngine {
    pub fn new(
        remote: Arc<dyn RemoteVault>,
        fs: Arc<dyn LocalFs>,
        config: EngineConfig,
        store: Option<Arc<WorkingCopyStore>>,
    ) -> Self {
        let mut index = FileIndex::new(config.index.clone());
        if let Some(store) = &store {
            index = index.with_store(store.clone());
        }
        let index = Arc::new(index);
        let batches = ActiveBatches::new();
        let locks = Arc::new(LockCoordinator::new(
            remote.clone(),
            fs.clone(),
            index.clone(),
            config.executor.remote_timeout,
        ));
        let executor = Arc::new(CommandExecutor::new(
            remote.clone(),
            fs.clone(),
            index.clone(),
            locks.clone(),
            batches.clone(),
            config.executor,
        ));
        let mut staging =
            OfflineStagingQueue::new(remote.clone(), fs.clone(), index.clone(), executor.clone());
        let mut registry = VaultRegistry::new(remote.clone(), fs.clone(), index.clone(), batches);
        if let Some(store) = store {
            staging = staging.with_store(store.clone());
            registry = registry.with_store(store);
        }
        Self {
            remote,
            fs,
            index,
            locks,
            executor,
            staging,
            registry,
            config,
            online: AtomicBool::new(true),
        }
    }

    /// Restores connected vaults and staged check-ins, then activates the
    /// vault that was active last time.
    pub async fn load(&self, user_id: &str) -> Result<Option<Vault>, EngineError> {
        let vaults = self.registry.load().await?;
        for vault in &vaults {
            let staged = self.staging.load(&vault.id).await?;
            if staged > 0 {
                info!(vault_id = %vault.id, staged, "staged check-ins restored");
            }
        }
        match self.registry.active() {
            Some(vault) => Ok(Some(self.registry.switch_active(&vault.id, user_id).await?)),
            None => Ok(None),
        }
    }

    pub fn registry(&self) -> &VaultRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn connect(&self, vault: Vault) -> Result<Vault, EngineError> {
        Ok(self.registry.connect(vault).await?)
    }

    pub async fn switch_active(&self, vault_id: &str, user_id: &str) -> Result<Vault, EngineError> {
        let vault = self.registry.switch_active(vault_id, user_id).await?;
        self.staging.load(vault_id).await?;
        Ok(vault)
    }

    pub async fn disconnect(&self, vault_id: &str, user_id: &str) -> Result<(), EngineError> {
        Ok(self.registry.disconnect(vault_id, user_id).await?)
    }

    fn active_vault(&self, vault_id: &str) -> Result<Vault, EngineError> {
        self.registry
            .active()
            .filter(|vault| vault.id == vault_id)
            .ok_or_else(|| EngineError::NotActive(vault_id.to_string()))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
        }
    }

    /// Probes the server; updates the online flag either way.
    pub async fn probe(&self) -> bool {
        let reachable = match with_timeout(self.config.executor.remote_timeout, self.remote.ping())
            .await
        {
            Ok(()) => true,
            Err(RemoteError::AuthExpired) => {
                warn!("server reachable but the session has expired");
                true
            }
            Err(_) => false,
        };
        self.set_online(reachable);
        reachable
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.index.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.index.subscribe()
    }

    pub fn file(&self, path: &str) -> Result<VaultFile, EngineError> {
        self.index
            .get(path)
            .ok_or_else(|| EngineError::UnknownPath(path.to_string()))
    }

    /// Rebuilds the active vault's index. A network failure marks the engine
    /// offline.
    pub async fn refresh(
        &self,
        vault_id: &str,
        user_id: &str,
    ) -> Result<Arc<IndexSnapshot>, EngineError> {
        let vault = self.active_vault(vault_id)?;
        let rebuilt = self
            .index
            .refresh(&vault, user_id, self.fs.as_ref(), self.remote.as_ref())
            .await;
        self.track_link(rebuilt)
    }

    /// Like [`VaultEngine::refresh`], but also moves the `CloudNew` threshold
    /// up to now.
    pub async fn full_sync(
        &self,
        vault_id: &str,
        user_id: &str,
    ) -> Result<Arc<IndexSnapshot>, EngineError> {
        let vault = self.active_vault(vault_id)?;
        let rebuilt = self
            .index
            .full_sync(&vault, user_id, self.fs.as_ref(), self.remote.as_ref())
            .await;
        self.track_link(rebuilt)
    }

    fn track_link(
        &self,
        rebuilt: Result<Arc<IndexSnapshot>, IndexError>,
    ) -> Result<Arc<IndexSnapshot>, EngineError> {
        match rebuilt {
            Ok(snapshot) => {
                self.set_online(true);
                Ok(snapshot)
            }
            Err(IndexError::Remote(err)) => {
                if matches!(err, RemoteError::Network(_) | RemoteError::Timeout(_)) {
                    self.set_online(false);
                }
                Err(IndexError::Remote(err).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn dispatch(
        &self,
        vault_id: &str,
        user_id: &str,
        command: Command,
        files: &[VaultFile],
    ) -> Result<BatchHandle, EngineError> {
        let vault = self.active_vault(vault_id)?;
        let request = BatchRequest {
            vault,
            user_id: user_id.to_string(),
            command,
            targets: files
                .iter()
                .map(|file| file.relative_path().to_string())
                .collect(),
        };
        Ok(self.executor.spawn(request))
    }

    pub fn checkout(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
    ) -> Result<BatchHandle, EngineError> {
        self.dispatch(vault_id, user_id, Command::Checkout, files)
    }

    /// Checks files in, or stages them when the server is unreachable.
    pub async fn checkin(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
    ) -> Result<CheckinDispatch, EngineError> {
        if self.is_online() {
            return Ok(CheckinDispatch::Batch(self.dispatch(
                vault_id,
                user_id,
                Command::Checkin,
                files,
            )?));
        }

        self.active_vault(vault_id)?;
        let snapshot = self.index.snapshot();
        let mut candidates = Vec::new();
        for file in files {
            if file.is_directory() {
                candidates.extend(
                    snapshot
                        .descendants(file.relative_path())
                        .into_iter()
                        .filter(|child| {
                            !child.is_directory() && child.checked_out_by() == Some(user_id)
                        })
                        .cloned(),
                );
            } else {
                candidates.push(file.clone());
            }
        }

        let mut staged = Vec::new();
        let mut refused = Vec::new();
        for file in candidates {
            match self.staging.stage(vault_id, &file).await {
                Ok(entry) => staged.push(entry),
                Err(err) => refused.push((file.relative_path().to_string(), err)),
            }
        }
        Ok(CheckinDispatch::Staged { staged, refused })
    }

    pub fn sync(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
    ) -> Result<BatchHandle, EngineError> {
        self.dispatch(vault_id, user_id, Command::Sync, files)
    }

    pub fn download(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
    ) -> Result<BatchHandle, EngineError> {
        self.dispatch(vault_id, user_id, Command::Download, files)
    }

    pub fn get_latest(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
    ) -> Result<BatchHandle, EngineError> {
        self.dispatch(vault_id, user_id, Command::GetLatest, files)
    }

    pub fn move_to(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
        destination: &str,
    ) -> Result<BatchHandle, EngineError> {
        let command = Command::Move {
            destination: destination.to_string(),
        };
        self.dispatch(vault_id, user_id, command, files)
    }

    pub fn copy_to(
        &self,
        vault_id: &str,
        user_id: &str,
        files: &[VaultFile],
        destination: &str,
    ) -> Result<BatchHandle, EngineError> {
        let command = Command::Copy {
            destination: destination.to_string(),
        };
        self.dispatch(vault_id, user_id, command, files)
    }

    pub fn rename(
        &self,
        vault_id: &str,
        user_id: &str,
        file: &VaultFile,
        new_name: &str,
    ) -> Result<BatchHandle, EngineError> {
        let command = Command::Rename {
            new_name: new_name.to_string(),
        };
        self.dispatch(vault_id, user_id, command, std::slice::from_ref(file))
    }

    pub fn new_folder(
        &self,
        vault_id: &str,
        user_id: &str,
        path: &str,
    ) -> Result<BatchHandle, EngineError> {
        let command = Command::NewFolder {
            path: path.to_string(),
        };
        self.dispatch(vault_id, user_id, command, &[])
    }

    pub async fn stage(
        &self,
        vault_id: &str,
        file: &VaultFile,
    ) -> Result<StagedCheckin, EngineError> {
        self.active_vault(vault_id)?;
        Ok(self.staging.stage(vault_id, file).await?)
    }

    pub async fn unstage(&self, vault_id: &str, path: &str) -> Result<(), EngineError> {
        Ok(self.staging.unstage(vault_id, path).await?)
    }

    pub fn staged(&self, vault_id: &str) -> Vec<StagedCheckin> {
        self.staging.list(vault_id)
    }

    pub async fn replay_staged(
        &self,
        vault_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, EngineError> {
        let vault = self.active_vault(vault_id)?;
        Ok(self.staging.replay_all(&vault, user_id, cancel).await?)
    }

    pub async fn force_release(
        &self,
        vault_id: &str,
        admin_user_id: &str,
        file: &VaultFile,
    ) -> Result<ServerFileMetadata, EngineError> {
        self.active_vault(vault_id)?;
        Ok(self.locks.force_release(admin_user_id, file).await?)
    }

    /// Records metadata to send with the file's next check-in. `None` drops
    /// anything pending.
    pub async fn set_pending_metadata(
        &self,
        vault_id: &str,
        path: &str,
        metadata: Option<Metadata>,
    ) -> Result<(), EngineError> {
        self.active_vault(vault_id)?;
        let touched = self
            .index
            .apply(EntryUpdate::PendingMetadata {
                path: path.to_string(),
                metadata,
            })
            .await?;
        if touched.is_empty() {
            return Err(EngineError::UnknownPath(path.to_string()));
        }
        Ok(())
    }

    pub fn lock_view(&self, file: &VaultFile, user_id: &str) -> CheckoutLock {
        self.locks.lock_view(file, user_id)
    }

    pub fn can_mutate(&self, file: &VaultFile, user_id: &str) -> bool {
        self.locks.can_mutate(file, user_id)
    }

    pub fn folder_checkout_status(&self, folder: &str, user_id: &str) -> FolderCheckoutStatus {
        self.index.snapshot().folder_checkout_status(folder, user_id)
    }
}
