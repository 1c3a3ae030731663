use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use super::model::{Metadata, StagedCheckin, StateChange, Vault, WorkingCopyState};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pending metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Per-vault working-copy knowledge, connected vaults and offline check-ins.
pub struct WorkingCopyStore {
    pool: SqlitePool,
}

impl WorkingCopyStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_vault(&self, vault: &Vault) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vaults (id, name, org_id, local_root, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                org_id = excluded.org_id,
                local_root = excluded.local_root,
                is_active = excluded.is_active",
        )
        .bind(&vault.id)
        .bind(&vault.name)
        .bind(&vault.org_id)
        .bind(vault.local_root.to_string_lossy().into_owned())
        .bind(vault.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_vaults(&self) -> Result<Vec<Vault>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, org_id, local_root, is_active FROM vaults ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let local_root: String = row.try_get("local_root")?;
            out.push(Vault {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                org_id: row.try_get("org_id")?,
                local_root: PathBuf::from(local_root),
                is_active: row.try_get("is_active")?,
            });
        }
        Ok(out)
    }

    pub async fn set_active_vault(&self, vault_id: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE vaults SET is_active = (id = ?1)")
            .bind(vault_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the vault and everything recorded about its working copy.
    pub async fn remove_vault(&self, vault_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "file_state",
            "moves",
            "known_server_paths",
            "sync_cursor",
            "staged_checkins",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE vault_id = ?1"))
                .bind(vault_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM vaults WHERE id = ?1")
            .bind(vault_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_working_state(&self, vault_id: &str) -> Result<WorkingCopyState, StoreError> {
        let mut state = WorkingCopyState::default();

        let rows = sqlx::query(
            "SELECT path, local_active_version, pending_metadata FROM file_state WHERE vault_id = ?1",
        )
        .bind(vault_id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let path: String = row.try_get("path")?;
            let version: Option<i64> = row.try_get("local_active_version")?;
            let metadata: Option<String> = row.try_get("pending_metadata")?;
            if let Some(version) = version {
                state.local_versions.insert(path.clone(), version as u64);
            }
            if let Some(metadata) = metadata {
                let parsed: Metadata = serde_json::from_str(&metadata)?;
                state.pending_metadata.insert(path, parsed);
            }
        }

        let rows = sqlx::query("SELECT local_path, file_id FROM moves WHERE vault_id = ?1")
            .bind(vault_id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            state
                .moves
                .insert(row.try_get("local_path")?, row.try_get("file_id")?);
        }

        let rows = sqlx::query("SELECT path FROM known_server_paths WHERE vault_id = ?1")
            .bind(vault_id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            state.known_server_paths.insert(row.try_get("path")?);
        }

        state.last_full_sync =
            sqlx::query("SELECT last_full_sync FROM sync_cursor WHERE vault_id = ?1")
                .bind(vault_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get::<Option<i64>, _>("last_full_sync"))
                .transpose()?
                .flatten();

        Ok(state)
    }

    pub async fn apply_changes(
        &self,
        vault_id: &str,
        changes: &[StateChange],
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for change in changes {
            match change {
                StateChange::LocalVersion { path, version } => {
                    sqlx::query(
                        "INSERT INTO file_state (vault_id, path, local_active_version)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(vault_id, path) DO UPDATE SET
                            local_active_version = excluded.local_active_version",
                    )
                    .bind(vault_id)
                    .bind(path)
                    .bind(version.map(|v| v as i64))
                    .execute(&mut *tx)
                    .await?;
                }
                StateChange::PendingMetadata { path, metadata } => {
                    let encoded = metadata.as_ref().map(serde_json::to_string).transpose()?;
                    sqlx::query(
                        "INSERT INTO file_state (vault_id, path, pending_metadata)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(vault_id, path) DO UPDATE SET
                            pending_metadata = excluded.pending_metadata",
                    )
                    .bind(vault_id)
                    .bind(path)
                    .bind(encoded)
                    .execute(&mut *tx)
                    .await?;
                }
                StateChange::Move {
                    local_path,
                    file_id: Some(file_id),
                } => {
                    sqlx::query(
                        "INSERT INTO moves (vault_id, local_path, file_id) VALUES (?1, ?2, ?3)
                         ON CONFLICT(vault_id, local_path) DO UPDATE SET file_id = excluded.file_id",
                    )
                    .bind(vault_id)
                    .bind(local_path)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;
                }
                StateChange::Move {
                    local_path,
                    file_id: None,
                } => {
                    sqlx::query("DELETE FROM moves WHERE vault_id = ?1 AND local_path = ?2")
                        .bind(vault_id)
                        .bind(local_path)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        sqlx::query(
            "DELETE FROM file_state
             WHERE vault_id = ?1 AND local_active_version IS NULL AND pending_metadata IS NULL",
        )
        .bind(vault_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replaces the known server paths. `full_sync_at` also moves the sync
    /// cursor; a plain poll leaves it where it is.
    pub async fn record_rebuild(
        &self,
        vault_id: &str,
        server_paths: &HashSet<String>,
        full_sync_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM known_server_paths WHERE vault_id = ?1")
            .bind(vault_id)
            .execute(&mut *tx)
            .await?;
        for path in server_paths {
            sqlx::query("INSERT INTO known_server_paths (vault_id, path) VALUES (?1, ?2)")
                .bind(vault_id)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(at) = full_sync_at {
            sqlx::query(
                "INSERT INTO sync_cursor (vault_id, last_full_sync) VALUES (?1, ?2)
                 ON CONFLICT(vault_id) DO UPDATE SET last_full_sync = excluded.last_full_sync",
            )
            .bind(vault_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn stage(&self, vault_id: &str, staged: &StagedCheckin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO staged_checkins
                (vault_id, path, local_hash, staged_at, server_version, server_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(vault_id, path) DO UPDATE SET
                local_hash = excluded.local_hash,
                staged_at = excluded.staged_at,
                server_version = excluded.server_version,
                server_hash = excluded.server_hash",
        )
        .bind(vault_id)
        .bind(&staged.relative_path)
        .bind(&staged.local_hash)
        .bind(staged.staged_at)
        .bind(staged.server_version_at_stage.map(|v| v as i64))
        .bind(&staged.server_hash_at_stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unstage(&self, vault_id: &str, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM staged_checkins WHERE vault_id = ?1 AND path = ?2")
            .bind(vault_id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_staged(&self, vault_id: &str) -> Result<Vec<StagedCheckin>, StoreError> {
        let rows = sqlx::query(
            "SELECT path, local_hash, staged_at, server_version, server_hash
             FROM staged_checkins WHERE vault_id = ?1 ORDER BY path ASC",
        )
        .bind(vault_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let version: Option<i64> = row.try_get("server_version")?;
            out.push(StagedCheckin {
                relative_path: row.try_get("path")?,
                local_hash: row.try_get("local_hash")?,
                staged_at: row.try_get("staged_at")?,
                server_version_at_stage: version.map(|v| v as u64),
                server_hash_at_stage: row.try_get("server_hash")?,
            });
        }
        Ok(out)
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("pdmd").join("working-copy.db"))
}
