//! Check-ins recorded while the server is unreachable.
//!
//! Staging captures the local hash and the server version known at that
//! moment. Replay rebuilds the index from a fresh listing and only checks in
//! entries whose server version has not moved since.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::executor::{BatchRequest, BatchResult, Command, CommandExecutor, Outcome};
use super::fs::LocalFs;
use super::index::{FileIndex, IndexError};
use super::model::{StagedCheckin, Vault, VaultFile, now_unix};
use super::remote::RemoteVault;
use super::store::{StoreError, WorkingCopyStore};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("{path} cannot be staged: {reason}")]
    NotStageable { path: String, reason: &'static str },
    #[error("{0} is not staged")]
    NotStaged(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// A staged entry whose server state moved on since it was staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedConflict {
    pub path: String,
    pub staged_version: Option<u64>,
    /// `None` when the server no longer has a record for the path.
    pub server_version: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub batch: BatchResult,
    pub conflicts: Vec<StagedConflict>,
}

type StagedByPath = BTreeMap<String, StagedCheckin>;

pub struct OfflineStagingQueue {
    remote: Arc<dyn RemoteVault>,
    fs: Arc<dyn LocalFs>,
    index: Arc<FileIndex>,
    executor: Arc<CommandExecutor>,
    store: Option<Arc<WorkingCopyStore>>,
    entries: Mutex<BTreeMap<String, StagedByPath>>,
}

impl OfflineStagingQueue {
    pub fn new(
        remote: Arc<dyn RemoteVault>,
        fs: Arc<dyn LocalFs>,
        index: Arc<FileIndex>,
        executor: Arc<CommandExecutor>,
    ) -> Self {
        Self {
            remote,
            fs,
            index,
            executor,
            store: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<WorkingCopyStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StagedByPath>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restores the persisted entries of a vault.
    pub async fn load(&self, vault_id: &str) -> Result<usize, StagingError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let staged: StagedByPath = store
            .list_staged(vault_id)
            .await?
            .into_iter()
            .map(|entry| (entry.relative_path.clone(), entry))
            .collect();
        let count = staged.len();
        self.entries().insert(vault_id.to_string(), staged);
        Ok(count)
    }

    /// Records a check-in intent without talking to the server.
    pub async fn stage(
        &self,
        vault_id: &str,
        file: &VaultFile,
    ) -> Result<StagedCheckin, StagingError> {
        let path = file.relative_path();
        let refuse = |reason| StagingError::NotStageable {
            path: path.to_string(),
            reason,
        };
        if file.is_directory() {
            return Err(refuse("folders are not checked in"));
        }
        let Some(local_hash) = file.local_hash() else {
            return Err(refuse("no local copy"));
        };
        let Some(record) = file.server_record() else {
            return Err(refuse("not on the server yet"));
        };

        let staged = StagedCheckin {
            relative_path: path.to_string(),
            local_hash: local_hash.to_string(),
            staged_at: now_unix(),
            server_version_at_stage: Some(record.version),
            server_hash_at_stage: Some(record.content_hash.clone()),
        };
        if let Some(store) = &self.store {
            store.stage(vault_id, &staged).await?;
        }
        self.entries()
            .entry(vault_id.to_string())
            .or_default()
            .insert(path.to_string(), staged.clone());
        info!(vault_id, path, version = record.version, "check-in staged");
        Ok(staged)
    }

    pub async fn unstage(&self, vault_id: &str, path: &str) -> Result<(), StagingError> {
        let removed = self
            .entries()
            .get_mut(vault_id)
            .and_then(|staged| staged.remove(path));
        if removed.is_none() {
            return Err(StagingError::NotStaged(path.to_string()));
        }
        if let Some(store) = &self.store {
            store.unstage(vault_id, path).await?;
        }
        Ok(())
    }

    pub fn list(&self, vault_id: &str) -> Vec<StagedCheckin> {
        self.entries()
            .get(vault_id)
            .map(|staged| staged.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_staged(&self, vault_id: &str, path: &str) -> bool {
        self.entries()
            .get(vault_id)
            .is_some_and(|staged| staged.contains_key(path))
    }

    /// Re-validates every staged entry against a fresh server listing and
    /// checks in those that are still current. Conflicts and failures stay
    /// staged.
    pub async fn replay_all(
        &self,
        vault: &Vault,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, StagingError> {
        let staged = self.list(&vault.id);
        if staged.is_empty() {
            return Ok(ReplayReport::default());
        }

        let snapshot = self
            .index
            .refresh(vault, user_id, self.fs.as_ref(), self.remote.as_ref())
            .await?;

        let mut conflicts = Vec::new();
        let mut targets = Vec::new();
        for entry in staged {
            let current = snapshot
                .get(&entry.relative_path)
                .and_then(|file| file.server_record())
                .map(|record| record.version);
            if current.is_none() || current != entry.server_version_at_stage {
                warn!(
                    path = %entry.relative_path,
                    staged = ?entry.server_version_at_stage,
                    server = ?current,
                    "staged check-in conflicts with the server"
                );
                conflicts.push(StagedConflict {
                    path: entry.relative_path,
                    staged_version: entry.server_version_at_stage,
                    server_version: current,
                });
            } else {
                targets.push(entry.relative_path);
            }
        }

        let batch = if targets.is_empty() {
            BatchResult::default()
        } else {
            let request = BatchRequest {
                vault: vault.clone(),
                user_id: user_id.to_string(),
                command: Command::Checkin,
                targets,
            };
            self.executor.execute(request, cancel).await
        };

        for outcome in &batch.outcomes {
            if outcome.outcome == Outcome::Succeeded {
                self.unstage(&vault.id, &outcome.path).await?;
            }
        }
        info!(
            vault_id = %vault.id,
            replayed = batch.succeeded,
            conflicts = conflicts.len(),
            remaining = self.list(&vault.id).len(),
            "staged check-ins replayed"
        );
        Ok(ReplayReport { batch, conflicts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::batches::ActiveBatches;
    use crate::sync::executor::ExecutorConfig;
    use crate::sync::fs::NativeFs;
    use crate::sync::index::IndexConfig;
    use crate::sync::lock::LockCoordinator;
    use crate::sync::model::SyncStatus;
    use crate::sync::test_support::{FakeRemote, memory_store, vault_at};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const ME: &str = "u-me";

    struct Setup {
        dir: TempDir,
        remote: Arc<FakeRemote>,
        index: Arc<FileIndex>,
        queue: OfflineStagingQueue,
    }

    fn setup(store: Option<Arc<WorkingCopyStore>>) -> Setup {
        let dir = tempdir().unwrap();
        let remote = FakeRemote::new();
        let index = Arc::new(FileIndex::new(IndexConfig::default()));
        let fs: Arc<dyn LocalFs> = Arc::new(NativeFs);
        let timeout = Duration::from_secs(5);
        let locks = Arc::new(LockCoordinator::new(
            remote.clone(),
            fs.clone(),
            index.clone(),
            timeout,
        ));
        let executor = Arc::new(CommandExecutor::new(
            remote.clone(),
            fs.clone(),
            index.clone(),
            locks,
            ActiveBatches::new(),
            ExecutorConfig {
                concurrency: 2,
                remote_timeout: timeout,
            },
        ));
        let mut queue = OfflineStagingQueue::new(remote.clone(), fs, index.clone(), executor);
        if let Some(store) = store {
            queue = queue.with_store(store);
        }
        Setup {
            dir,
            remote,
            index,
            queue,
        }
    }

    impl Setup {
        fn vault(&self) -> Vault {
            vault_at(self.dir.path())
        }

        /// A file checked out by the current user with local edits.
        async fn edited_checkout(&self, path: &str) {
            self.remote.insert(path, b"server copy", 1);
            self.remote.set_checked_out(path, Some(ME));
            std::fs::write(self.dir.path().join(path), b"offline edit").unwrap();
            self.index
                .refresh(&self.vault(), ME, &NativeFs, self.remote.as_ref())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn advanced_server_version_is_a_conflict() {
        let s = setup(None);
        s.edited_checkout("d.txt").await;
        let file = s.index.get("d.txt").unwrap();
        let staged = s.queue.stage("v-1", &file).await.unwrap();
        assert_eq!(staged.server_version_at_stage, Some(1));

        s.remote.publish_new_version("d.txt", b"someone else");
        let report = s
            .queue
            .replay_all(&s.vault(), ME, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.conflicts,
            vec![StagedConflict {
                path: "d.txt".into(),
                staged_version: Some(1),
                server_version: Some(2),
            }]
        );
        assert_eq!(report.batch.total, 0);
        assert!(s.queue.is_staged("v-1", "d.txt"));
        assert!(!s.remote.calls().iter().any(|call| call.starts_with("checkin")));
    }

    #[tokio::test]
    async fn current_entries_are_checked_in_and_unstaged() {
        let s = setup(None);
        s.edited_checkout("d.txt").await;
        s.queue
            .stage("v-1", &s.index.get("d.txt").unwrap())
            .await
            .unwrap();

        let report = s
            .queue
            .replay_all(&s.vault(), ME, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.conflicts.is_empty());
        assert_eq!(report.batch.succeeded, 1);
        assert!(s.queue.list("v-1").is_empty());
        assert_eq!(s.remote.by_path("d.txt").unwrap().version, 2);
        assert_eq!(s.index.get("d.txt").unwrap().status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn removed_server_record_is_a_conflict() {
        let s = setup(None);
        s.edited_checkout("d.txt").await;
        s.queue
            .stage("v-1", &s.index.get("d.txt").unwrap())
            .await
            .unwrap();
        s.remote.remove("d.txt");

        let report = s
            .queue
            .replay_all(&s.vault(), ME, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].server_version, None);
        assert!(s.queue.is_staged("v-1", "d.txt"));
    }

    #[tokio::test]
    async fn failed_replay_keeps_the_entry() {
        let s = setup(None);
        s.edited_checkout("d.txt").await;
        s.queue
            .stage("v-1", &s.index.get("d.txt").unwrap())
            .await
            .unwrap();
        let id = s.remote.by_path("d.txt").unwrap().id;
        s.remote
            .fail_file(&id, crate::sync::remote::RemoteError::Network("reset".into()));

        let report = s
            .queue
            .replay_all(&s.vault(), ME, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.batch.failed, 1);
        assert!(s.queue.is_staged("v-1", "d.txt"));
    }

    #[tokio::test]
    async fn unreachable_server_leaves_everything_staged() {
        let s = setup(None);
        s.edited_checkout("d.txt").await;
        s.queue
            .stage("v-1", &s.index.get("d.txt").unwrap())
            .await
            .unwrap();
        s.remote.set_offline(true);

        let err = s
            .queue
            .replay_all(&s.vault(), ME, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StagingError::Index(_)));
        assert_eq!(s.queue.list("v-1").len(), 1);
    }

    #[tokio::test]
    async fn stage_then_unstage_keeps_status() {
        let s = setup(None);
        s.edited_checkout("d.txt").await;
        let before = s.index.get("d.txt").unwrap().status();

        s.queue
            .stage("v-1", &s.index.get("d.txt").unwrap())
            .await
            .unwrap();
        s.queue.unstage("v-1", "d.txt").await.unwrap();

        assert_eq!(s.index.get("d.txt").unwrap().status(), before);
        assert!(s.queue.list("v-1").is_empty());
        assert!(matches!(
            s.queue.unstage("v-1", "d.txt").await,
            Err(StagingError::NotStaged(_))
        ));
    }

    #[tokio::test]
    async fn folders_and_cloud_files_are_refused() {
        let s = setup(None);
        s.remote.insert("docs/remote.txt", b"r", 1);
        std::fs::write(s.dir.path().join("new.txt"), b"n").unwrap();
        s.index
            .refresh(&s.vault(), ME, &NativeFs, s.remote.as_ref())
            .await
            .unwrap();

        for path in ["docs", "docs/remote.txt", "new.txt"] {
            let file = s.index.get(path).unwrap();
            assert!(matches!(
                s.queue.stage("v-1", &file).await,
                Err(StagingError::NotStageable { .. })
            ));
        }
    }

    #[tokio::test]
    async fn staged_entries_survive_a_restart() {
        let store = Arc::new(memory_store().await);
        let s = setup(Some(store.clone()));
        s.edited_checkout("d.txt").await;
        s.queue
            .stage("v-1", &s.index.get("d.txt").unwrap())
            .await
            .unwrap();

        let restarted = setup(Some(store));
        assert_eq!(restarted.queue.load("v-1").await.unwrap(), 1);
        let staged = restarted.queue.list("v-1");
        assert_eq!(staged[0].relative_path, "d.txt");
        assert_eq!(staged[0].server_version_at_stage, Some(1));
    }
}
