//! Bounded-parallel batch runner for file commands.
//!
//! A batch is planned against one index snapshot: targets are expanded,
//! de-duplicated and checked for eligibility up front. Eligible units then run
//! through `buffer_unordered`; cancellation is observed only when a unit is
//! about to start, so a unit in flight always reaches a terminal state.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batches::ActiveBatches;
use super::fs::{FsError, LocalFs};
use super::index::{FileIndex, IndexError, IndexSnapshot};
use super::lock::{CheckoutLock, LockCoordinator, LockError, blocking_descendants};
use super::model::{SyncStatus, Vault, VaultFile};
use super::paths::{is_within, join, normalize_relative, parent_path};
use super::remote::{RemoteError, RemoteVault};

#[path = "executor_units.rs"]
mod units;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Checkout,
    Checkin,
    /// First upload of local-only files.
    Sync,
    Download,
    GetLatest,
    Move { destination: String },
    Copy { destination: String },
    Rename { new_name: String },
    NewFolder { path: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Checkout => "checkout",
            Command::Checkin => "checkin",
            Command::Sync => "sync",
            Command::Download => "download",
            Command::GetLatest => "get_latest",
            Command::Move { .. } => "move",
            Command::Copy { .. } => "copy",
            Command::Rename { .. } => "rename",
            Command::NewFolder { .. } => "new_folder",
        }
    }

    /// Per-file commands apply to every file beneath a selected folder.
    fn expands_folders(&self) -> bool {
        matches!(
            self,
            Command::Checkout
                | Command::Checkin
                | Command::Sync
                | Command::Download
                | Command::GetLatest
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("session expired")]
    AuthExpired,
    #[error("checked out by {}", holder.as_deref().unwrap_or("another user"))]
    LockConflict { holder: Option<String> },
    #[error("server version changed since staging{}", server_version.map(|v| format!(" (now {v})")).unwrap_or_default())]
    Conflict { server_version: Option<u64> },
    #[error("network failure: {0}")]
    Network(String),
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("server call timed out")]
    Timeout,
    #[error("{0}")]
    Validation(String),
    #[error("vault root {0} is unreachable")]
    RootUnreachable(String),
}

impl From<RemoteError> for UnitError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::AuthExpired => UnitError::AuthExpired,
            RemoteError::LockConflict { holder } => UnitError::LockConflict { holder },
            RemoteError::Timeout(_) => UnitError::Timeout,
            other => UnitError::Network(other.to_string()),
        }
    }
}

impl From<FsError> for UnitError {
    fn from(err: FsError) -> Self {
        UnitError::Io(err.to_string())
    }
}

impl From<IndexError> for UnitError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Remote(remote) => remote.into(),
            other => UnitError::Io(other.to_string()),
        }
    }
}

impl From<LockError> for UnitError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::HeldByOther { holder, .. } => UnitError::LockConflict {
                holder: Some(holder),
            },
            LockError::NotHeld { .. } | LockError::NotOnServer(_) => {
                UnitError::Validation(err.to_string())
            }
            LockError::Remote(remote) => remote.into(),
            LockError::Local(fs) => fs.into(),
            LockError::Index(index) => index.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(UnitError),
    Skipped(UnitError),
    CancelledBeforeStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub path: String,
    pub outcome: Outcome,
}

/// Aggregate of one batch. The four counts always sum to `total`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub command: &'static str,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled_before_start: usize,
    pub outcomes: Vec<UnitOutcome>,
    /// Set when a batch-level failure stopped the remaining queue.
    pub aborted: Option<UnitError>,
}

impl BatchResult {
    fn new(command: &'static str, total: usize) -> Self {
        Self {
            command,
            total,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: UnitOutcome) {
        match &outcome.outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::CancelledBeforeStart => self.cancelled_before_start += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled_before_start
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.total
    }

    pub fn outcome_for(&self, path: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.path == path)
            .map(|outcome| &outcome.outcome)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub vault: Vault,
    pub user_id: String,
    pub command: Command,
    /// Vault-relative paths of the selected files and folders.
    pub targets: Vec<String>,
}

/// A running batch.
pub struct BatchHandle {
    pub progress: watch::Receiver<Progress>,
    pub cancel: CancellationToken,
    join: JoinHandle<BatchResult>,
}

impl BatchHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<BatchResult, JoinError> {
        self.join.await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub remote_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            remote_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Unit {
    pub path: String,
    pub entry: Option<VaultFile>,
    pub destination: Option<String>,
}

#[derive(Default)]
pub(crate) struct Plan {
    pub units: Vec<Unit>,
    pub skipped: Vec<UnitOutcome>,
}

impl Plan {
    fn skip(&mut self, path: &str, err: UnitError) {
        self.skipped.push(UnitOutcome {
            path: path.to_string(),
            outcome: Outcome::Skipped(err),
        });
    }
}

/// Expands, de-duplicates and validates the targets of a request.
pub(crate) fn plan(snapshot: &IndexSnapshot, request: &BatchRequest) -> Plan {
    let mut plan = Plan::default();
    let user = request.user_id.as_str();

    if let Command::NewFolder { path } = &request.command {
        match validate_new_folder(snapshot, path) {
            Ok(path) => plan.units.push(Unit {
                path,
                entry: None,
                destination: None,
            }),
            Err(err) => plan.skip(path, err),
        }
        return plan;
    }

    let targets: Vec<&String> = if request.command.expands_folders() {
        request.targets.iter().collect()
    } else {
        // A folder move carries its contents along; selecting both is one unit.
        request
            .targets
            .iter()
            .filter(|target| {
                !request
                    .targets
                    .iter()
                    .any(|other| other != *target && is_within(target, other))
            })
            .collect()
    };

    let mut seen = HashSet::new();
    for target in targets {
        let Some(file) = snapshot.get(target) else {
            if seen.insert(target.clone()) {
                plan.skip(
                    target,
                    UnitError::Validation(format!("{target} is not in the vault index")),
                );
            }
            continue;
        };

        if request.command.expands_folders() && file.is_directory() {
            for child in snapshot.descendants(target) {
                if child.is_directory()
                    || child.status() == SyncStatus::Ignored
                    || !relevant_in_folder(&request.command, child, user)
                {
                    continue;
                }
                if seen.insert(child.relative_path().to_string()) {
                    admit(&mut plan, snapshot, request, child);
                }
            }
            continue;
        }

        if seen.insert(target.clone()) {
            admit(&mut plan, snapshot, request, file);
        }
    }
    plan
}

fn admit(plan: &mut Plan, snapshot: &IndexSnapshot, request: &BatchRequest, file: &VaultFile) {
    match eligibility(snapshot, request, file) {
        Ok(destination) => plan.units.push(Unit {
            path: file.relative_path().to_string(),
            entry: Some(file.clone()),
            destination,
        }),
        Err(err) => plan.skip(file.relative_path(), err),
    }
}

/// Which files beneath a selected folder a per-file command is about.
fn relevant_in_folder(command: &Command, file: &VaultFile, user: &str) -> bool {
    let record = file.server_record();
    match command {
        Command::Checkout => record.is_some() && file.checked_out_by() != Some(user),
        Command::Checkin => file.is_local() && file.checked_out_by() == Some(user),
        Command::Sync => file.is_local() && record.is_none(),
        Command::Download => !file.is_local() && record.is_some(),
        Command::GetLatest => file.status() == SyncStatus::Outdated,
        _ => false,
    }
}

fn lock_conflict(file: &VaultFile, user: &str) -> Option<UnitError> {
    let lock = CheckoutLock::from_record(file.server_record(), user);
    lock.holder_label().map(|holder| UnitError::LockConflict {
        holder: Some(holder),
    })
}

fn invalid(message: impl Into<String>) -> UnitError {
    UnitError::Validation(message.into())
}

/// Returns the destination path for move-like commands.
fn eligibility(
    snapshot: &IndexSnapshot,
    request: &BatchRequest,
    file: &VaultFile,
) -> Result<Option<String>, UnitError> {
    let user = request.user_id.as_str();
    let path = file.relative_path();
    if file.status() == SyncStatus::Ignored {
        return Err(invalid(format!("{path} matches an ignore pattern")));
    }

    match &request.command {
        Command::Checkout => {
            if file.server_record().is_none() {
                return Err(invalid(format!("{path} is not on the server yet")));
            }
            if file.checked_out_by() == Some(user) {
                return Err(invalid(format!("{path} is already checked out by you")));
            }
            if let Some(conflict) = lock_conflict(file, user) {
                return Err(conflict);
            }
            Ok(None)
        }
        Command::Checkin => {
            if file.server_record().is_none() {
                return Err(invalid(format!("{path} is not on the server yet")));
            }
            if !file.is_local() {
                return Err(invalid(format!("{path} is not present locally")));
            }
            if let Some(conflict) = lock_conflict(file, user) {
                return Err(conflict);
            }
            if file.checked_out_by() != Some(user) {
                return Err(invalid(format!("{path} is not checked out by you")));
            }
            Ok(None)
        }
        Command::Sync => {
            if file.server_record().is_some() {
                return Err(invalid(format!("{path} is already on the server")));
            }
            if !file.is_local() {
                return Err(invalid(format!("{path} is not present locally")));
            }
            Ok(None)
        }
        Command::Download => {
            if file.server_record().is_none() {
                return Err(invalid(format!("{path} is not on the server")));
            }
            if file.is_local() {
                return Err(invalid(format!("{path} is already present locally")));
            }
            Ok(None)
        }
        Command::GetLatest => {
            let Some(record) = file.server_record() else {
                return Err(invalid(format!("{path} is not on the server")));
            };
            let edited = file
                .local_hash()
                .is_some_and(|hash| !hash.eq_ignore_ascii_case(&record.content_hash));
            if file.checked_out_by() == Some(user) && edited {
                return Err(invalid(format!(
                    "{path} has local edits under your checkout; check in first"
                )));
            }
            Ok(None)
        }
        Command::Move { destination } | Command::Copy { destination } => {
            let destination = normalize_folder(destination)?;
            let target = join(&destination, file.name());
            check_destination(snapshot, file, &destination, &target)?;
            if matches!(request.command, Command::Move { .. }) {
                check_mutable(snapshot, file, user)?;
            }
            Ok(Some(target))
        }
        Command::Rename { new_name } => {
            let new_name = new_name.trim();
            if new_name.is_empty() || new_name.contains(['/', '\\']) || new_name == "." || new_name == ".." {
                return Err(invalid(format!("{new_name:?} is not a valid name")));
            }
            let parent = parent_path(path).unwrap_or("");
            let target = join(parent, new_name);
            check_destination(snapshot, file, parent, &target)?;
            check_mutable(snapshot, file, user)?;
            Ok(Some(target))
        }
        Command::NewFolder { .. } => Err(invalid("new folder takes no targets")),
    }
}

fn normalize_folder(folder: &str) -> Result<String, UnitError> {
    if folder.trim_matches(['/', '\\']).is_empty() {
        return Ok(String::new());
    }
    normalize_relative(folder).map_err(|err| invalid(err.to_string()))
}

fn check_destination(
    snapshot: &IndexSnapshot,
    file: &VaultFile,
    folder: &str,
    target: &str,
) -> Result<(), UnitError> {
    let path = file.relative_path();
    if !file.is_local() {
        return Err(invalid(format!("{path} is not present locally")));
    }
    if !folder.is_empty()
        && !snapshot
            .get(folder)
            .is_some_and(|dir| dir.is_directory() && dir.is_local())
    {
        return Err(invalid(format!("destination folder {folder} does not exist")));
    }
    if file.is_directory() && is_within(folder, path) {
        return Err(invalid(format!("cannot move {path} into itself")));
    }
    if target == path {
        return Err(invalid(format!("{path} is already there")));
    }
    if snapshot.get(target).is_some_and(|existing| existing.is_local()) {
        return Err(invalid(format!("{target} already exists")));
    }
    Ok(())
}

fn check_mutable(snapshot: &IndexSnapshot, file: &VaultFile, user: &str) -> Result<(), UnitError> {
    let path = file.relative_path();
    if file.is_directory() {
        let blocking = blocking_descendants(snapshot, path, user);
        if !blocking.is_empty() {
            return Err(invalid(format!(
                "{path} contains files not checked out by you: {}",
                blocking.join(", ")
            )));
        }
        return Ok(());
    }
    if let Some(conflict) = lock_conflict(file, user) {
        return Err(conflict);
    }
    if file.server_record().is_some() && file.checked_out_by() != Some(user) {
        return Err(invalid(format!("{path} must be checked out first")));
    }
    Ok(())
}

fn validate_new_folder(snapshot: &IndexSnapshot, path: &str) -> Result<String, UnitError> {
    let path = normalize_relative(path).map_err(|err| invalid(err.to_string()))?;
    if snapshot.get(&path).is_some_and(|existing| existing.is_local()) {
        return Err(invalid(format!("{path} already exists")));
    }
    if let Some(parent) = parent_path(&path)
        && !snapshot
            .get(parent)
            .is_some_and(|dir| dir.is_directory() && dir.is_local())
    {
        return Err(invalid(format!("parent folder {parent} does not exist")));
    }
    Ok(path)
}

pub struct CommandExecutor {
    remote: Arc<dyn RemoteVault>,
    fs: Arc<dyn LocalFs>,
    index: Arc<FileIndex>,
    locks: Arc<LockCoordinator>,
    batches: ActiveBatches,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(
        remote: Arc<dyn RemoteVault>,
        fs: Arc<dyn LocalFs>,
        index: Arc<FileIndex>,
        locks: Arc<LockCoordinator>,
        batches: ActiveBatches,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            remote,
            fs,
            index,
            locks,
            batches,
            config,
        }
    }

    /// Runs the batch on its own task.
    pub fn spawn(self: &Arc<Self>, request: BatchRequest) -> BatchHandle {
        let cancel = CancellationToken::new();
        let (progress_tx, progress) = watch::channel(Progress::default());
        let this = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { this.run(request, &token, &progress_tx).await });
        BatchHandle {
            progress,
            cancel,
            join,
        }
    }

    async fn root_reachable(&self, root: &Path) -> bool {
        matches!(self.fs.exists(root).await, Ok(true))
    }

    pub async fn execute(&self, request: BatchRequest, cancel: &CancellationToken) -> BatchResult {
        let (progress, _) = watch::channel(Progress::default());
        self.run(request, cancel, &progress).await
    }

    async fn run(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
        progress: &watch::Sender<Progress>,
    ) -> BatchResult {
        let guard = self.batches.begin().await;
        let snapshot = self.index.snapshot();
        let Plan { units, skipped } = plan(&snapshot, &request);
        let mut result = BatchResult::new(request.command.name(), units.len() + skipped.len());
        for outcome in skipped {
            debug!(path = %outcome.path, kind = result.command, "unit skipped: {:?}", outcome.outcome);
            result.record(outcome);
        }
        let report = |result: &BatchResult| {
            progress.send_replace(Progress {
                completed: result.completed(),
                total: result.total,
            });
        };
        report(&result);

        if snapshot.vault_id != request.vault.id {
            warn!(vault_id = %request.vault.id, "batch targets a vault that is not active");
            result.aborted = Some(invalid(format!(
                "vault {} is not the active vault",
                request.vault.id
            )));
            for unit in units {
                result.record(UnitOutcome {
                    path: unit.path,
                    outcome: Outcome::CancelledBeforeStart,
                });
            }
            report(&result);
            return result;
        }

        if !self.root_reachable(&request.vault.local_root).await {
            warn!(vault_id = %request.vault.id, root = %request.vault.local_root.display(), "vault root unreachable");
            result.aborted = Some(UnitError::RootUnreachable(
                request.vault.local_root.display().to_string(),
            ));
            for unit in units {
                result.record(UnitOutcome {
                    path: unit.path,
                    outcome: Outcome::CancelledBeforeStart,
                });
            }
            report(&result);
            return result;
        }

        let halted: OnceLock<UnitError> = OnceLock::new();
        let request = &request;
        let guard = &guard;
        let halted_ref = &halted;
        let mut running = stream::iter(units)
            .map(|unit| async move {
                if cancel.is_cancelled() || guard.draining() || halted_ref.get().is_some() {
                    return UnitOutcome {
                        path: unit.path,
                        outcome: Outcome::CancelledBeforeStart,
                    };
                }
                let outcome = match self.run_unit(request, &unit).await {
                    Ok(()) => Outcome::Succeeded,
                    Err(UnitError::AuthExpired) => {
                        let _ = halted_ref.set(UnitError::AuthExpired);
                        Outcome::Failed(UnitError::AuthExpired)
                    }
                    Err(err) => {
                        let root = &request.vault.local_root;
                        if !self.root_reachable(root).await {
                            let _ = halted_ref
                                .set(UnitError::RootUnreachable(root.display().to_string()));
                        }
                        Outcome::Failed(err)
                    }
                };
                UnitOutcome {
                    path: unit.path,
                    outcome,
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(outcome) = running.next().await {
            if let Outcome::Failed(err) = &outcome.outcome {
                warn!(path = %outcome.path, kind = result.command, "unit failed: {err}");
            }
            result.record(outcome);
            report(&result);
        }
        drop(running);

        result.aborted = halted.into_inner();
        info!(
            kind = result.command,
            vault_id = %request.vault.id,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled_before_start,
            "batch finished"
        );
        result
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
