use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use pdm_core::ServerFileMetadata;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::paths::file_name;

/// Lower-hex SHA-256 of file content.
pub type ContentHash = String;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    Added,
    Modified,
    Moved,
    Outdated,
    CloudOnly,
    CloudNew,
    DeletedRemote,
    Ignored,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Added => "added",
            SyncStatus::Modified => "modified",
            SyncStatus::Moved => "moved",
            SyncStatus::Outdated => "outdated",
            SyncStatus::CloudOnly => "cloud_only",
            SyncStatus::CloudNew => "cloud_new",
            SyncStatus::DeletedRemote => "deleted_remote",
            SyncStatus::Ignored => "ignored",
        }
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, SyncStatus::CloudOnly | SyncStatus::CloudNew)
    }
}

/// What the local filesystem says about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFacts {
    /// `None` for directories and for files that could not be read.
    pub hash: Option<ContentHash>,
    pub size: u64,
    pub modified: i64,
}

impl LocalFacts {
    /// Facts for content that was just read or written.
    pub fn read_now(hash: ContentHash, size: u64) -> Self {
        Self {
            hash: Some(hash),
            size,
            modified: now_unix(),
        }
    }
}

/// One entry of a local scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub relative_path: String,
    pub is_directory: bool,
    pub facts: LocalFacts,
}

/// Everything the status of an entry is derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInputs {
    pub relative_path: String,
    pub is_directory: bool,
    pub local: Option<LocalFacts>,
    pub server_record: Option<ServerFileMetadata>,
    /// Directories only: some server file lives beneath this folder.
    pub has_server_descendants: bool,
    /// The path had a server record at the previous rebuild.
    pub previously_on_server: bool,
    pub local_active_version: Option<u64>,
    pub pending_metadata: Option<Metadata>,
    pub ignored: bool,
}

/// Per-user inputs to status derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveContext {
    pub current_user: String,
    /// Server records created after this unix time are `CloudNew`.
    pub cloud_new_after: Option<i64>,
}

/// A filesystem entry merged with server knowledge. The status is fixed at
/// construction; a changed input means a new `VaultFile`.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultFile {
    inputs: EntryInputs,
    status: SyncStatus,
}

impl VaultFile {
    pub(crate) fn new(inputs: EntryInputs, status: SyncStatus) -> Self {
        Self { inputs, status }
    }

    pub fn relative_path(&self) -> &str {
        &self.inputs.relative_path
    }

    pub fn name(&self) -> &str {
        file_name(&self.inputs.relative_path)
    }

    pub fn is_directory(&self) -> bool {
        self.inputs.is_directory
    }

    pub fn local(&self) -> Option<&LocalFacts> {
        self.inputs.local.as_ref()
    }

    pub fn local_hash(&self) -> Option<&str> {
        self.inputs.local.as_ref().and_then(|facts| facts.hash.as_deref())
    }

    pub fn is_local(&self) -> bool {
        self.inputs.local.is_some()
    }

    pub fn size(&self) -> u64 {
        match (&self.inputs.local, &self.inputs.server_record) {
            (Some(local), _) => local.size,
            (None, Some(server)) => server.file_size,
            (None, None) => 0,
        }
    }

    pub fn server_record(&self) -> Option<&ServerFileMetadata> {
        self.inputs.server_record.as_ref()
    }

    pub fn checked_out_by(&self) -> Option<&str> {
        self.inputs
            .server_record
            .as_ref()
            .and_then(|record| record.checked_out_by.as_deref())
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn pending_metadata(&self) -> Option<&Metadata> {
        self.inputs.pending_metadata.as_ref()
    }

    pub fn local_active_version(&self) -> Option<u64> {
        self.inputs.local_active_version
    }

    pub fn inputs(&self) -> &EntryInputs {
        &self.inputs
    }

    pub(crate) fn into_inputs(self) -> EntryInputs {
        self.inputs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: String,
    pub name: String,
    pub org_id: String,
    pub local_root: PathBuf,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCheckin {
    pub relative_path: String,
    pub local_hash: ContentHash,
    pub staged_at: i64,
    pub server_version_at_stage: Option<u64>,
    pub server_hash_at_stage: Option<ContentHash>,
}

/// Client-side knowledge about a vault's working copy that neither the
/// filesystem nor the server can reproduce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkingCopyState {
    pub local_versions: HashMap<String, u64>,
    pub pending_metadata: HashMap<String, Metadata>,
    /// Local path of a moved or renamed file -> server file id.
    pub moves: HashMap<String, String>,
    pub known_server_paths: HashSet<String>,
    pub last_full_sync: Option<i64>,
}

/// One persisted edit to [`WorkingCopyState`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    LocalVersion {
        path: String,
        version: Option<u64>,
    },
    PendingMetadata {
        path: String,
        metadata: Option<Metadata>,
    },
    Move {
        local_path: String,
        file_id: Option<String>,
    },
}

impl WorkingCopyState {
    pub fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::LocalVersion { path, version } => match version {
                Some(version) => {
                    self.local_versions.insert(path.clone(), *version);
                }
                None => {
                    self.local_versions.remove(path);
                }
            },
            StateChange::PendingMetadata { path, metadata } => match metadata {
                Some(metadata) => {
                    self.pending_metadata.insert(path.clone(), metadata.clone());
                }
                None => {
                    self.pending_metadata.remove(path);
                }
            },
            StateChange::Move {
                local_path,
                file_id,
            } => match file_id {
                Some(file_id) => {
                    self.moves.insert(local_path.clone(), file_id.clone());
                }
                None => {
                    self.moves.remove(local_path);
                }
            },
        }
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn parse_timestamp(value: Option<&str>) -> Option<i64> {
    let value = value?;
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|parsed| parsed.unix_timestamp())
}
