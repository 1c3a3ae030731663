use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::batches::ActiveBatches;
use super::fs::{FsError, LocalFs};
use super::index::{FileIndex, IndexError, IndexSnapshot};
use super::model::{SyncStatus, Vault};
use super::remote::RemoteVault;
use super::store::{StoreError, WorkingCopyStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("vault {0} is not connected")]
    UnknownVault(String),
    #[error("vault {0} is already connected")]
    AlreadyConnected(String),
    #[error("vault {vault_id} has unreconciled files: {}", blocking.join(", "))]
    NotReconciled {
        vault_id: String,
        blocking: Vec<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Local(#[from] FsError),
}

#[derive(Default)]
struct RegistryState {
    vaults: BTreeMap<String, Vault>,
    active: Option<String>,
    working_root: Option<PathBuf>,
}

/// Connected vaults and the one the engine currently works in.
pub struct VaultRegistry {
    remote: Arc<dyn RemoteVault>,
    fs: Arc<dyn LocalFs>,
    index: Arc<FileIndex>,
    batches: ActiveBatches,
    store: Option<Arc<WorkingCopyStore>>,
    state: RwLock<RegistryState>,
    changing: Mutex<()>,
}

impl VaultRegistry {
    pub fn new(
        remote: Arc<dyn RemoteVault>,
        fs: Arc<dyn LocalFs>,
        index: Arc<FileIndex>,
        batches: ActiveBatches,
    ) -> Self {
        Self {
            remote,
            fs,
            index,
            batches,
            store: None,
            state: RwLock::new(RegistryState::default()),
            changing: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: Arc<WorkingCopyStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restores connected vaults from the store. The active vault is only
    /// recorded; call [`VaultRegistry::switch_active`] to build its index.
    pub async fn load(&self) -> Result<Vec<Vault>, RegistryError> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let vaults = store.list_vaults().await?;
        let mut state = self.write();
        state.vaults = vaults
            .iter()
            .map(|vault| (vault.id.clone(), vault.clone()))
            .collect();
        state.active = vaults
            .iter()
            .find(|vault| vault.is_active)
            .map(|vault| vault.id.clone());
        Ok(vaults)
    }

    pub fn vaults(&self) -> Vec<Vault> {
        self.read().vaults.values().cloned().collect()
    }

    pub fn get(&self, vault_id: &str) -> Option<Vault> {
        self.read().vaults.get(vault_id).cloned()
    }

    pub fn active(&self) -> Option<Vault> {
        let state = self.read();
        state
            .active
            .as_ref()
            .and_then(|id| state.vaults.get(id))
            .cloned()
    }

    /// Root the engine currently resolves vault-relative paths against.
    pub fn working_root(&self) -> Option<PathBuf> {
        self.read().working_root.clone()
    }

    /// Registers a vault and creates its local root. Does not activate it.
    pub async fn connect(&self, vault: Vault) -> Result<Vault, RegistryError> {
        let _changing = self.changing.lock().await;
        if self.read().vaults.contains_key(&vault.id) {
            return Err(RegistryError::AlreadyConnected(vault.id));
        }
        let vault = Vault {
            is_active: false,
            ..vault
        };
        self.fs.ensure_dir(&vault.local_root).await?;
        if let Some(store) = &self.store {
            store.upsert_vault(&vault).await?;
        }
        self.write().vaults.insert(vault.id.clone(), vault.clone());
        info!(vault_id = %vault.id, root = %vault.local_root.display(), "vault connected");
        Ok(vault)
    }

    /// Makes `vault_id` the active vault. Running batches are cancelled and
    /// awaited first; no batch can start until the new index is in place.
    /// A failed rebuild leaves the switch in effect with an empty index.
    pub async fn switch_active(&self, vault_id: &str, user_id: &str) -> Result<Vault, RegistryError> {
        let _changing = self.changing.lock().await;
        let vault = self
            .get(vault_id)
            .ok_or_else(|| RegistryError::UnknownVault(vault_id.to_string()))?;

        let drained = self.batches.drain().await;
        self.index.clear().await;
        if let Some(store) = &self.store {
            store.set_active_vault(Some(vault_id)).await?;
        }
        {
            let mut state = self.write();
            for (id, known) in state.vaults.iter_mut() {
                known.is_active = id == vault_id;
            }
            state.active = Some(vault_id.to_string());
            state.working_root = Some(vault.local_root.clone());
        }
        info!(vault_id, root = %vault.local_root.display(), "active vault switched");

        if let Err(err) = self
            .index
            .full_sync(&vault, user_id, self.fs.as_ref(), self.remote.as_ref())
            .await
        {
            warn!(vault_id, "initial rebuild failed: {err}");
        }
        drop(drained);
        Ok(Vault {
            is_active: true,
            ..vault
        })
    }

    /// Removes a fully reconciled vault and deletes its local files.
    pub async fn disconnect(&self, vault_id: &str, user_id: &str) -> Result<(), RegistryError> {
        let _changing = self.changing.lock().await;
        let vault = self
            .get(vault_id)
            .ok_or_else(|| RegistryError::UnknownVault(vault_id.to_string()))?;
        let is_active = self.read().active.as_deref() == Some(vault_id);

        let drained = if is_active {
            Some(self.batches.drain().await)
        } else {
            None
        };
        let snapshot = if is_active {
            self.index
                .refresh(&vault, user_id, self.fs.as_ref(), self.remote.as_ref())
                .await?
        } else {
            self.index
                .detached()
                .refresh(&vault, user_id, self.fs.as_ref(), self.remote.as_ref())
                .await?
        };

        let blocking = unreconciled(&snapshot, user_id);
        if !blocking.is_empty() {
            warn!(vault_id, blocking = blocking.len(), "disconnect refused");
            return Err(RegistryError::NotReconciled {
                vault_id: vault_id.to_string(),
                blocking,
            });
        }

        if self.fs.exists(&vault.local_root).await? {
            self.fs.delete_item(&vault.local_root).await?;
        }
        if let Some(store) = &self.store {
            store.remove_vault(vault_id).await?;
        }
        if is_active {
            self.index.clear().await;
        }
        {
            let mut state = self.write();
            state.vaults.remove(vault_id);
            if is_active {
                state.active = None;
                state.working_root = None;
            }
        }
        drop(drained);
        info!(vault_id, "vault disconnected");
        Ok(())
    }
}

/// Files that would lose work if the local root were deleted.
fn unreconciled(snapshot: &IndexSnapshot, user_id: &str) -> Vec<String> {
    snapshot
        .entries
        .values()
        .filter(|file| !file.is_directory())
        .filter(|file| {
            let settled = matches!(
                file.status(),
                SyncStatus::Synced | SyncStatus::CloudOnly | SyncStatus::CloudNew | SyncStatus::Ignored
            );
            !settled || file.checked_out_by() == Some(user_id)
        })
        .map(|file| file.relative_path().to_string())
        .collect()
}
