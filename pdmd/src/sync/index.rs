//! The merged per-vault file view.
//!
//! A rebuild joins the local listing with the server listing and derives a
//! [`SyncStatus`] for every path through [`derive_sync_status`]. Between
//! rebuilds, confirmed command results are folded in with
//! [`FileIndex::apply`], which re-derives the touched entries the same way.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::{StreamExt, stream};
use pdm_core::ServerFileMetadata;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::fs::{FsError, LocalFs};
use super::ignore::IgnoreRules;
use super::model::{
    ContentHash, DeriveContext, EntryInputs, LocalEntry, LocalFacts, Metadata, StateChange,
    SyncStatus, Vault, VaultFile, WorkingCopyState, now_unix, parse_timestamp,
};
use super::paths::{file_name, is_within, local_path_for, normalize_relative, parent_path, rebase};
use super::remote::{RemoteError, RemoteVault};
use super::store::{StoreError, WorkingCopyStore};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("local listing failed: {0}")]
    Local(#[from] FsError),
    #[error("server listing failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index was cleared while rebuilding vault {0}")]
    Superseded(String),
    #[error("vault {0} kept changing while the index was rebuilt")]
    Contended(String),
}

/// Rebuilds retried after a confirmed result landed mid-scan.
const REBUILD_ATTEMPTS: usize = 4;

/// Derives the status of one entry. Pure: equal inputs give equal output.
pub fn derive_sync_status(inputs: &EntryInputs, ctx: &DeriveContext) -> SyncStatus {
    if inputs.ignored {
        return SyncStatus::Ignored;
    }
    if inputs.is_directory {
        return match (inputs.local.is_some(), inputs.has_server_descendants) {
            (true, true) => SyncStatus::Synced,
            (true, false) => SyncStatus::Added,
            (false, _) => SyncStatus::CloudOnly,
        };
    }
    match (&inputs.local, &inputs.server_record) {
        (Some(_), None) if inputs.previously_on_server => SyncStatus::DeletedRemote,
        (Some(_), None) => SyncStatus::Added,
        (None, Some(record)) => {
            let created = parse_timestamp(record.created_at.as_deref());
            match (created, ctx.cloud_new_after) {
                (Some(created), Some(after)) if created > after => SyncStatus::CloudNew,
                _ => SyncStatus::CloudOnly,
            }
        }
        (Some(local), Some(record)) => derive_present_both(inputs, local, record, ctx),
        (None, None) => SyncStatus::CloudOnly,
    }
}

fn derive_present_both(
    inputs: &EntryInputs,
    local: &LocalFacts,
    record: &ServerFileMetadata,
    ctx: &DeriveContext,
) -> SyncStatus {
    let held_by_me = record.checked_out_by.as_deref() == Some(ctx.current_user.as_str());
    let path_matches = server_path_matches(&inputs.relative_path, record);
    let behind = inputs
        .local_active_version
        .is_none_or(|version| version < record.version);

    match local.hash.as_deref() {
        Some(hash) if hash.eq_ignore_ascii_case(&record.content_hash) => {
            if path_matches {
                SyncStatus::Synced
            } else {
                SyncStatus::Moved
            }
        }
        Some(_) if held_by_me => SyncStatus::Modified,
        _ if behind && !held_by_me => SyncStatus::Outdated,
        None if path_matches => SyncStatus::Synced,
        None => SyncStatus::Moved,
        Some(_) => SyncStatus::Modified,
    }
}

fn server_path_matches(relative_path: &str, record: &ServerFileMetadata) -> bool {
    normalize_relative(&record.file_path).is_ok_and(|path| path == relative_path)
        && file_name(relative_path) == record.file_name
}

/// Read-only view of one vault's merged file set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexSnapshot {
    pub vault_id: String,
    pub entries: BTreeMap<String, VaultFile>,
    pub built_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderCheckoutStatus {
    Free,
    Mine,
    Others,
    Both,
}

/// Per-status file counts. Directories and ignored files are not counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts(HashMap<SyncStatus, usize>);

impl StatusCounts {
    fn add(&mut self, status: SyncStatus) {
        if status != SyncStatus::Ignored {
            *self.0.entry(status).or_default() += 1;
        }
    }

    pub fn get(&self, status: SyncStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

impl IndexSnapshot {
    pub fn empty(vault_id: &str) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            entries: BTreeMap::new(),
            built_at: 0,
        }
    }

    pub fn get(&self, path: &str) -> Option<&VaultFile> {
        self.entries.get(path)
    }

    pub fn children(&self, folder: &str) -> Vec<&VaultFile> {
        self.descendants(folder)
            .into_iter()
            .filter(|file| parent_path(file.relative_path()).unwrap_or("") == folder)
            .collect()
    }

    /// Everything strictly beneath `folder`, in path order.
    pub fn descendants(&self, folder: &str) -> Vec<&VaultFile> {
        let prefix = if folder.is_empty() {
            String::new()
        } else {
            format!("{folder}/")
        };
        self.entries
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(_, file)| file)
            .collect()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for file in self.entries.values().filter(|file| !file.is_directory()) {
            counts.add(file.status());
        }
        counts
    }

    pub fn folder_status_counts(&self, folder: &str) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for file in self
            .descendants(folder)
            .into_iter()
            .filter(|file| !file.is_directory())
        {
            counts.add(file.status());
        }
        counts
    }

    pub fn folder_checkout_status(&self, folder: &str, user_id: &str) -> FolderCheckoutStatus {
        let mut mine = false;
        let mut others = false;
        for holder in self
            .descendants(folder)
            .into_iter()
            .filter_map(|file| file.checked_out_by())
        {
            if holder == user_id {
                mine = true;
            } else {
                others = true;
            }
        }
        match (mine, others) {
            (false, false) => FolderCheckoutStatus::Free,
            (true, false) => FolderCheckoutStatus::Mine,
            (false, true) => FolderCheckoutStatus::Others,
            (true, true) => FolderCheckoutStatus::Both,
        }
    }
}

pub struct RebuildInput<'a> {
    pub vault_id: &'a str,
    pub local: &'a [LocalEntry],
    pub server: &'a [ServerFileMetadata],
    pub state: &'a WorkingCopyState,
    pub ignore: &'a IgnoreRules,
    pub ctx: &'a DeriveContext,
    pub built_at: i64,
}

/// Merges a local listing with a server listing. Pure with respect to its
/// inputs.
pub fn rebuild(input: RebuildInput<'_>) -> IndexSnapshot {
    let local: BTreeMap<&str, &LocalEntry> = input
        .local
        .iter()
        .map(|entry| (entry.relative_path.as_str(), entry))
        .collect();
    let placed = place_server_records(input.server, input.state, &local);

    let mut server_dirs = HashSet::new();
    for path in placed.keys() {
        let mut current = parent_path(path);
        while let Some(dir) = current {
            if !server_dirs.insert(dir.to_string()) {
                break;
            }
            current = parent_path(dir);
        }
    }

    let mut paths: BTreeSet<String> = local.keys().map(|path| path.to_string()).collect();
    paths.extend(placed.keys().cloned());
    paths.extend(server_dirs.iter().cloned());

    let mut entries = BTreeMap::new();
    for path in paths {
        let local_entry = local.get(path.as_str());
        let is_directory = match local_entry {
            Some(entry) => entry.is_directory,
            None => !placed.contains_key(&path),
        };
        let server_record = if is_directory {
            None
        } else {
            placed.get(&path).map(|record| (*record).clone())
        };
        let inputs = EntryInputs {
            is_directory,
            local: local_entry.map(|entry| entry.facts.clone()),
            has_server_descendants: is_directory && server_dirs.contains(&path),
            previously_on_server: input.state.known_server_paths.contains(&path),
            local_active_version: input.state.local_versions.get(&path).copied(),
            pending_metadata: input.state.pending_metadata.get(&path).cloned(),
            ignored: input.ignore.is_ignored(&path),
            server_record,
            relative_path: path.clone(),
        };
        let status = derive_sync_status(&inputs, input.ctx);
        entries.insert(path, VaultFile::new(inputs, status));
    }

    IndexSnapshot {
        vault_id: input.vault_id.to_string(),
        entries,
        built_at: input.built_at,
    }
}

/// Places each server record at the path it is joined on: the local path from
/// the move ledger when that file still exists, otherwise its server path.
fn place_server_records<'a>(
    server: &'a [ServerFileMetadata],
    state: &WorkingCopyState,
    local: &BTreeMap<&str, &LocalEntry>,
) -> BTreeMap<String, &'a ServerFileMetadata> {
    let moved_to: HashMap<&str, &str> = state
        .moves
        .iter()
        .filter(|(local_path, _)| local.contains_key(local_path.as_str()))
        .map(|(local_path, file_id)| (file_id.as_str(), local_path.as_str()))
        .collect();

    let mut placed = BTreeMap::new();
    for record in server {
        let path = match moved_to.get(record.id.as_str()) {
            Some(local_path) => local_path.to_string(),
            None => match normalize_relative(&record.file_path) {
                Ok(path) => path,
                Err(err) => {
                    warn!(file_id = %record.id, path = %record.file_path, "skipping server record: {err}");
                    continue;
                }
            },
        };
        if placed.contains_key(&path) {
            debug!(path = %path, file_id = %record.id, "duplicate server record for path");
            continue;
        }
        placed.insert(path, record);
    }
    placed
}

/// Ledger entries that no longer describe a pending move.
fn stale_moves(
    state: &WorkingCopyState,
    server: &[ServerFileMetadata],
    local: &[LocalEntry],
) -> Vec<StateChange> {
    let server_paths: HashMap<&str, &str> = server
        .iter()
        .map(|record| (record.id.as_str(), record.file_path.as_str()))
        .collect();
    let local_paths: HashSet<&str> = local
        .iter()
        .map(|entry| entry.relative_path.as_str())
        .collect();

    state
        .moves
        .iter()
        .filter(|(local_path, file_id)| {
            let on_server = server_paths.get(file_id.as_str());
            match on_server {
                None => true,
                Some(server_path) => {
                    !local_paths.contains(local_path.as_str())
                        || normalize_relative(server_path).is_ok_and(|path| &path == *local_path)
                }
            }
        })
        .map(|(local_path, _)| StateChange::Move {
            local_path: local_path.clone(),
            file_id: None,
        })
        .collect()
}

/// Paths that had a server record: everything on the server now, plus earlier
/// records whose local copy is still there.
fn known_server_paths(
    snapshot: &IndexSnapshot,
    state: &WorkingCopyState,
    local: &[LocalEntry],
) -> HashSet<String> {
    let mut known: HashSet<String> = snapshot
        .entries
        .values()
        .filter(|file| file.server_record().is_some())
        .map(|file| file.relative_path().to_string())
        .collect();
    known.extend(
        local
            .iter()
            .filter(|entry| state.known_server_paths.contains(&entry.relative_path))
            .map(|entry| entry.relative_path.clone()),
    );
    known
}

#[derive(Debug, Clone)]
pub struct CachedHash {
    pub size: u64,
    pub modified: i64,
    pub hash: ContentHash,
}

/// Content hashes keyed by vault-relative path, reused while size and
/// modification time are unchanged.
pub type HashCache = HashMap<String, CachedHash>;

/// Lists the vault root and hashes every non-ignored file, reading only files
/// whose size or modification time changed since the cached hash.
pub async fn scan_local(
    fs: &dyn LocalFs,
    root: &Path,
    ignore: &IgnoreRules,
    cache: &mut HashCache,
    concurrency: usize,
) -> Result<Vec<LocalEntry>, FsError> {
    let listing = fs.list_directory(root).await?;
    let mut entries = Vec::with_capacity(listing.len());
    let mut jobs: Vec<(usize, PathBuf)> = Vec::new();

    for item in listing {
        let mut facts = LocalFacts {
            hash: None,
            size: item.size,
            modified: item.modified,
        };
        if !item.is_dir && !ignore.is_ignored(&item.path) {
            match cache.get(&item.path) {
                Some(cached) if cached.size == item.size && cached.modified == item.modified => {
                    facts.hash = Some(cached.hash.clone());
                }
                _ => jobs.push((entries.len(), local_path_for(root, &item.path)?)),
            }
        }
        entries.push(LocalEntry {
            relative_path: item.path,
            is_directory: item.is_dir,
            facts,
        });
    }

    let hashed: Vec<(usize, Option<ContentHash>)> = stream::iter(jobs)
        .map(|(idx, path)| async move {
            match fs.read_file(&path).await {
                Ok(content) => (idx, Some(content.hash)),
                Err(err) => {
                    warn!(path = %path.display(), "could not hash local file: {err}");
                    (idx, None)
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    for (idx, hash) in hashed {
        entries[idx].facts.hash = hash;
    }

    cache.clear();
    for entry in &entries {
        if let Some(hash) = &entry.facts.hash {
            cache.insert(
                entry.relative_path.clone(),
                CachedHash {
                    size: entry.facts.size,
                    modified: entry.facts.modified,
                    hash: hash.clone(),
                },
            );
        }
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    Rebuilt { vault_id: String },
    Updated { paths: Vec<String> },
    Cleared,
}

/// A confirmed command result to fold into the index.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryUpdate {
    /// New server view of a file, e.g. after checkout or a forced release.
    ServerRecord {
        path: String,
        record: ServerFileMetadata,
    },
    /// The local content at `path` is now the server's current version, after
    /// a check-in or a first upload.
    CheckedIn {
        path: String,
        record: ServerFileMetadata,
        local: LocalFacts,
    },
    Downloaded {
        path: String,
        record: ServerFileMetadata,
        local: LocalFacts,
    },
    Moved {
        from: String,
        to: String,
    },
    Copied {
        from: String,
        to: String,
    },
    FolderCreated {
        path: String,
        modified: i64,
    },
    PendingMetadata {
        path: String,
        metadata: Option<Metadata>,
    },
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub ignore: IgnoreRules,
    /// Server records younger than this many seconds are `CloudNew`. Without
    /// it the threshold is the previous full rebuild.
    pub cloud_new_window: Option<i64>,
    pub hash_concurrency: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ignore: IgnoreRules::default(),
            cloud_new_window: None,
            hash_concurrency: 4,
        }
    }
}

struct IndexInner {
    snapshot: Arc<IndexSnapshot>,
    state: WorkingCopyState,
    ctx: DeriveContext,
    /// Bumped by every `apply` and `clear`.
    generation: u64,
}

/// The single owned index of the active vault.
pub struct FileIndex {
    config: IndexConfig,
    inner: RwLock<IndexInner>,
    scan: Mutex<HashCache>,
    events: broadcast::Sender<IndexEvent>,
    store: Option<Arc<WorkingCopyStore>>,
}

impl FileIndex {
    pub fn new(config: IndexConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            inner: RwLock::new(IndexInner {
                snapshot: Arc::new(IndexSnapshot::default()),
                state: WorkingCopyState::default(),
                ctx: DeriveContext {
                    current_user: String::new(),
                    cloud_new_after: None,
                },
                generation: 0,
            }),
            scan: Mutex::new(HashCache::new()),
            events,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<WorkingCopyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// A fresh index with the same configuration and store but no state.
    pub fn detached(&self) -> Self {
        let index = Self::new(self.config.clone());
        match &self.store {
            Some(store) => index.with_store(store.clone()),
            None => index,
        }
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.config.ignore
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.read().snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, path: &str) -> Option<VaultFile> {
        self.read().snapshot.get(path).cloned()
    }

    pub fn vault_id(&self) -> String {
        self.read().snapshot.vault_id.clone()
    }

    /// Fetches both listings and swaps in a new snapshot. On any failure the
    /// previous snapshot stays in place. The `CloudNew` threshold is left
    /// untouched; see [`FileIndex::full_sync`].
    pub async fn refresh(
        &self,
        vault: &Vault,
        user_id: &str,
        fs: &dyn LocalFs,
        remote: &dyn RemoteVault,
    ) -> Result<Arc<IndexSnapshot>, IndexError> {
        self.rebuild_vault(vault, user_id, fs, remote, false).await
    }

    /// A rebuild that also advances the vault's last full sync.
    pub async fn full_sync(
        &self,
        vault: &Vault,
        user_id: &str,
        fs: &dyn LocalFs,
        remote: &dyn RemoteVault,
    ) -> Result<Arc<IndexSnapshot>, IndexError> {
        self.rebuild_vault(vault, user_id, fs, remote, true).await
    }

    async fn rebuild_vault(
        &self,
        vault: &Vault,
        user_id: &str,
        fs: &dyn LocalFs,
        remote: &dyn RemoteVault,
        full_sync: bool,
    ) -> Result<Arc<IndexSnapshot>, IndexError> {
        let mut cache = self.scan.lock().await;

        if self.vault_id() != vault.id {
            let state = match &self.store {
                Some(store) => store.load_working_state(&vault.id).await?,
                None => WorkingCopyState::default(),
            };
            cache.clear();
            let mut inner = self.write();
            inner.state = state;
            inner.snapshot = Arc::new(IndexSnapshot::empty(&vault.id));
        }

        for attempt in 1..=REBUILD_ATTEMPTS {
            let started = self.read().generation;
            let local = scan_local(
                fs,
                &vault.local_root,
                &self.config.ignore,
                &mut cache,
                self.config.hash_concurrency,
            )
            .await?;
            let server = remote.list_vault_files(&vault.id).await?;
            let now = now_unix();

            let (snapshot, stale, known) = {
                let mut inner = self.write();
                if inner.snapshot.vault_id != vault.id {
                    return Err(IndexError::Superseded(vault.id.clone()));
                }
                if inner.generation != started {
                    debug!(vault_id = %vault.id, attempt, "results landed during rebuild, rescanning");
                    continue;
                }
                let ctx = DeriveContext {
                    current_user: user_id.to_string(),
                    cloud_new_after: match self.config.cloud_new_window {
                        Some(window) => Some(now - window),
                        None => inner.state.last_full_sync,
                    },
                };
                let stale = stale_moves(&inner.state, &server, &local);
                for change in &stale {
                    inner.state.apply(change);
                }
                let snapshot = Arc::new(rebuild(RebuildInput {
                    vault_id: &vault.id,
                    local: &local,
                    server: &server,
                    state: &inner.state,
                    ignore: &self.config.ignore,
                    ctx: &ctx,
                    built_at: now,
                }));
                let known = known_server_paths(&snapshot, &inner.state, &local);
                inner.state.known_server_paths = known.clone();
                if full_sync {
                    inner.state.last_full_sync = Some(now);
                }
                inner.ctx = ctx;
                inner.snapshot = snapshot.clone();
                (snapshot, stale, known)
            };

            if let Some(store) = &self.store {
                store.apply_changes(&vault.id, &stale).await?;
                store
                    .record_rebuild(&vault.id, &known, full_sync.then_some(now))
                    .await?;
            }
            info!(
                vault_id = %vault.id,
                entries = snapshot.entries.len(),
                full_sync,
                "index rebuilt"
            );
            let _ = self.events.send(IndexEvent::Rebuilt {
                vault_id: vault.id.clone(),
            });
            return Ok(snapshot);
        }
        Err(IndexError::Contended(vault.id.clone()))
    }

    /// Drops everything known about the current vault from memory.
    pub async fn clear(&self) {
        let mut cache = self.scan.lock().await;
        cache.clear();
        {
            let mut inner = self.write();
            inner.snapshot = Arc::new(IndexSnapshot::default());
            inner.state = WorkingCopyState::default();
            inner.generation += 1;
        }
        let _ = self.events.send(IndexEvent::Cleared);
    }

    /// Folds a confirmed result into the index and persists the working-copy
    /// state it implies. Returns the paths whose entries changed.
    pub async fn apply(&self, update: EntryUpdate) -> Result<Vec<String>, IndexError> {
        let (vault_id, changes, touched) = {
            let mut inner = self.write();
            inner.generation += 1;
            let vault_id = inner.snapshot.vault_id.clone();
            let mut changes = Vec::new();
            let touched = apply_update(&mut inner, &self.config.ignore, update, &mut changes);
            (vault_id, changes, touched)
        };

        if let Some(store) = &self.store
            && !vault_id.is_empty()
        {
            store.apply_changes(&vault_id, &changes).await?;
        }
        if !touched.is_empty() {
            let _ = self.events.send(IndexEvent::Updated {
                paths: touched.clone(),
            });
        }
        Ok(touched)
    }
}

fn apply_update(
    inner: &mut IndexInner,
    ignore: &IgnoreRules,
    update: EntryUpdate,
    changes: &mut Vec<StateChange>,
) -> Vec<String> {
    let IndexInner {
        snapshot,
        state,
        ctx,
        ..
    } = inner;
    let snap = Arc::make_mut(snapshot);
    let mut record = |change: StateChange| {
        state.apply(&change);
        changes.push(change);
    };
    let mut touched = Vec::new();

    match update {
        EntryUpdate::ServerRecord { path, record: server } => {
            if let Some(file) = snap.entries.remove(&path) {
                let mut inputs = file.into_inputs();
                inputs.server_record = Some(server);
                inputs.previously_on_server = true;
                upsert(snap, ctx, inputs);
                touched.push(path);
            }
        }
        EntryUpdate::CheckedIn {
            path,
            record: server,
            local,
        } => {
            let mut inputs = take_or_new_file(snap, &path, ignore);
            inputs.local_active_version = Some(server.version);
            inputs.pending_metadata = None;
            inputs.local = Some(local);
            inputs.previously_on_server = true;
            record(StateChange::LocalVersion {
                path: path.clone(),
                version: Some(server.version),
            });
            record(StateChange::PendingMetadata {
                path: path.clone(),
                metadata: None,
            });
            record(StateChange::Move {
                local_path: path.clone(),
                file_id: None,
            });
            inputs.server_record = Some(server);
            upsert(snap, ctx, inputs);
            touched.push(path.clone());
            touched.extend(refresh_ancestors(snap, ctx, &path, false));
        }
        EntryUpdate::Downloaded {
            path,
            record: server,
            local,
        } => {
            let mut inputs = take_or_new_file(snap, &path, ignore);
            inputs.local_active_version = Some(server.version);
            inputs.local = Some(local);
            inputs.previously_on_server = true;
            record(StateChange::LocalVersion {
                path: path.clone(),
                version: Some(server.version),
            });
            inputs.server_record = Some(server);
            upsert(snap, ctx, inputs);
            touched.push(path.clone());
            touched.extend(refresh_ancestors(snap, ctx, &path, true));
        }
        EntryUpdate::Moved { from, to } => {
            let moving: Vec<String> = snap
                .entries
                .iter()
                .filter(|(path, file)| is_within(path, &from) && file.is_local())
                .map(|(path, _)| path.clone())
                .collect();
            for old_path in moving {
                let Some(file) = snap.entries.remove(&old_path) else {
                    continue;
                };
                let new_path = rebase(&old_path, &from, &to);
                let mut inputs = file.into_inputs();
                if let Some(version) = inputs.local_active_version {
                    record(StateChange::LocalVersion {
                        path: old_path.clone(),
                        version: None,
                    });
                    record(StateChange::LocalVersion {
                        path: new_path.clone(),
                        version: Some(version),
                    });
                }
                if let Some(metadata) = inputs.pending_metadata.clone() {
                    record(StateChange::PendingMetadata {
                        path: old_path.clone(),
                        metadata: None,
                    });
                    record(StateChange::PendingMetadata {
                        path: new_path.clone(),
                        metadata: Some(metadata),
                    });
                }
                if let Some(server) = &inputs.server_record {
                    record(StateChange::Move {
                        local_path: old_path.clone(),
                        file_id: None,
                    });
                    let back_home = normalize_relative(&server.file_path)
                        .is_ok_and(|server_path| server_path == new_path);
                    if !back_home {
                        record(StateChange::Move {
                            local_path: new_path.clone(),
                            file_id: Some(server.id.clone()),
                        });
                    }
                }
                inputs.relative_path = new_path.clone();
                inputs.ignored = ignore.is_ignored(&new_path);
                inputs.previously_on_server = inputs.server_record.is_some();
                upsert(snap, ctx, inputs);
                touched.push(old_path);
                touched.push(new_path);
            }
            touched.extend(restore_remote_dirs(snap, ctx, &from));
            touched.extend(refresh_ancestors(snap, ctx, &from, false));
            touched.extend(refresh_dir_tree(snap, ctx, &to));
            touched.extend(refresh_ancestors(snap, ctx, &to, false));
        }
        EntryUpdate::Copied { from, to } => {
            let copies: Vec<EntryInputs> = snap
                .entries
                .iter()
                .filter(|(path, file)| is_within(path, &from) && file.is_local())
                .map(|(path, file)| {
                    let new_path = rebase(path, &from, &to);
                    EntryInputs {
                        is_directory: file.is_directory(),
                        local: file.local().cloned(),
                        server_record: None,
                        has_server_descendants: false,
                        previously_on_server: false,
                        local_active_version: None,
                        pending_metadata: None,
                        ignored: ignore.is_ignored(&new_path),
                        relative_path: new_path,
                    }
                })
                .collect();
            for inputs in copies {
                touched.push(inputs.relative_path.clone());
                upsert(snap, ctx, inputs);
            }
        }
        EntryUpdate::FolderCreated { path, modified } => {
            let inputs = EntryInputs {
                is_directory: true,
                local: Some(LocalFacts {
                    hash: None,
                    size: 0,
                    modified,
                }),
                server_record: None,
                has_server_descendants: false,
                previously_on_server: false,
                local_active_version: None,
                pending_metadata: None,
                ignored: ignore.is_ignored(&path),
                relative_path: path.clone(),
            };
            upsert(snap, ctx, inputs);
            touched.push(path);
        }
        EntryUpdate::PendingMetadata { path, metadata } => {
            if let Some(file) = snap.entries.remove(&path) {
                let mut inputs = file.into_inputs();
                inputs.pending_metadata = metadata.clone();
                record(StateChange::PendingMetadata {
                    path: path.clone(),
                    metadata,
                });
                upsert(snap, ctx, inputs);
                touched.push(path);
            }
        }
    }
    touched
}

fn upsert(snap: &mut IndexSnapshot, ctx: &DeriveContext, inputs: EntryInputs) {
    let status = derive_sync_status(&inputs, ctx);
    snap.entries
        .insert(inputs.relative_path.clone(), VaultFile::new(inputs, status));
}

fn take_or_new_file(snap: &mut IndexSnapshot, path: &str, ignore: &IgnoreRules) -> EntryInputs {
    match snap.entries.remove(path) {
        Some(file) => file.into_inputs(),
        None => EntryInputs {
            relative_path: path.to_string(),
            is_directory: false,
            local: None,
            server_record: None,
            has_server_descendants: false,
            previously_on_server: false,
            local_active_version: None,
            pending_metadata: None,
            ignored: ignore.is_ignored(path),
        },
    }
}

fn has_server_descendants(snap: &IndexSnapshot, dir: &str) -> bool {
    snap.descendants(dir)
        .into_iter()
        .any(|file| file.server_record().is_some())
}

/// Re-derives every ancestor folder of `path`, creating missing ones. With
/// `make_local`, ancestors are marked present on disk.
fn refresh_ancestors(
    snap: &mut IndexSnapshot,
    ctx: &DeriveContext,
    path: &str,
    make_local: bool,
) -> Vec<String> {
    let mut touched = Vec::new();
    let mut current = parent_path(path).map(str::to_string);
    while let Some(dir) = current {
        let server_below = has_server_descendants(snap, &dir);
        let mut inputs = match snap.entries.remove(&dir) {
            Some(file) => file.into_inputs(),
            None => EntryInputs {
                relative_path: dir.clone(),
                is_directory: true,
                local: None,
                server_record: None,
                has_server_descendants: false,
                previously_on_server: false,
                local_active_version: None,
                pending_metadata: None,
                ignored: false,
            },
        };
        inputs.has_server_descendants = server_below;
        if make_local && inputs.local.is_none() {
            inputs.local = Some(LocalFacts {
                hash: None,
                size: 0,
                modified: now_unix(),
            });
        }
        if inputs.local.is_none() && !server_below {
            // A remote-only folder with nothing left beneath it.
            touched.push(dir.clone());
        } else {
            upsert(snap, ctx, inputs);
            touched.push(dir.clone());
        }
        current = parent_path(&dir).map(str::to_string);
    }
    touched
}

/// Re-derives `root` and every folder beneath it.
fn refresh_dir_tree(snap: &mut IndexSnapshot, ctx: &DeriveContext, root: &str) -> Vec<String> {
    let dirs: Vec<String> = snap
        .entries
        .iter()
        .filter(|(path, file)| is_within(path, root) && file.is_directory())
        .map(|(path, _)| path.clone())
        .collect();
    let mut touched = Vec::new();
    for dir in dirs {
        let server_below = has_server_descendants(snap, &dir);
        if let Some(file) = snap.entries.remove(&dir) {
            let mut inputs = file.into_inputs();
            inputs.has_server_descendants = server_below;
            upsert(snap, ctx, inputs);
            touched.push(dir);
        }
    }
    touched
}

/// After moving local entries out of `from`, server-only files may remain
/// beneath it; give them remote-only parent folders again.
fn restore_remote_dirs(snap: &mut IndexSnapshot, ctx: &DeriveContext, from: &str) -> Vec<String> {
    let orphans: Vec<String> = snap
        .entries
        .iter()
        .filter(|(path, file)| is_within(path, from) && !file.is_directory())
        .map(|(path, _)| path.clone())
        .collect();
    let mut touched = Vec::new();
    for path in orphans {
        for dir in refresh_ancestors(snap, ctx, &path, false) {
            if !touched.contains(&dir) {
                touched.push(dir);
            }
        }
    }
    touched
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
