use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pdm_core::VaultClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sync::backoff::ReconnectBackoff;
use crate::sync::engine::{EngineConfig, VaultEngine};
use crate::sync::executor::ExecutorConfig;
use crate::sync::fs::NativeFs;
use crate::sync::ignore::IgnoreRules;
use crate::sync::index::{IndexConfig, StatusCounts};
use crate::sync::local_watcher::{next_batch, start_watcher};
use crate::sync::model::{SyncStatus, Vault};
use crate::sync::remote::HttpRemote;
use crate::sync::store::{WorkingCopyStore, default_db_path};
use crate::sync::transfer::{TransferClient, TransferConfig};

const DEFAULT_VAULTS_DIR_NAME: &str = "PDM Vaults";
const DEFAULT_BATCH_CONCURRENCY: u64 = 4;
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_SECS: u64 = 30;
const WATCH_QUIET: Duration = Duration::from_millis(750);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub token: String,
    pub org_id: String,
    pub user_id: String,
    pub vault_id: String,
    pub vault_name: String,
    pub vault_root: PathBuf,
    pub db_path: PathBuf,
    pub batch_concurrency: usize,
    pub download_concurrency: usize,
    pub remote_timeout: Duration,
    pub poll_interval: Duration,
    pub ignore_patterns: Vec<String>,
    pub cloud_new_window: Option<i64>,
    pub enable_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F, home: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{name} must be set"))
        };
        let vault_name = lookup("PDM_VAULT_NAME").unwrap_or_else(|| "Vault".to_string());
        let vault_root = lookup("PDM_VAULT_ROOT")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_VAULTS_DIR_NAME).join(&vault_name));
        let db_path = match lookup("PDM_DB_PATH") {
            Some(value) => expand_with_home(&value, home),
            None => default_db_path().context("failed to resolve database location")?,
        };
        let cloud_new_window = lookup("PDM_CLOUD_NEW_WINDOW_SECS")
            .map(|value| {
                value
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("invalid PDM_CLOUD_NEW_WINDOW_SECS: {value}"))
            })
            .transpose()?;

        Ok(Self {
            server_url: required("PDM_SERVER_URL")?,
            token: required("PDM_TOKEN")?,
            org_id: required("PDM_ORG_ID")?,
            user_id: required("PDM_USER_ID")?,
            vault_id: required("PDM_VAULT_ID")?,
            vault_name,
            vault_root,
            db_path,
            batch_concurrency: parse_u64(
                lookup("PDM_BATCH_CONCURRENCY"),
                DEFAULT_BATCH_CONCURRENCY,
            ) as usize,
            download_concurrency: parse_u64(
                lookup("PDM_DOWNLOAD_CONCURRENCY"),
                DEFAULT_DOWNLOAD_CONCURRENCY,
            ) as usize,
            remote_timeout: Duration::from_secs(parse_u64(
                lookup("PDM_REMOTE_TIMEOUT_SECS"),
                DEFAULT_REMOTE_TIMEOUT_SECS,
            )),
            poll_interval: Duration::from_secs(parse_u64(
                lookup("PDM_POLL_SECS"),
                DEFAULT_POLL_SECS,
            )),
            ignore_patterns: parse_list(lookup("PDM_IGNORE_PATTERNS")),
            cloud_new_window,
            enable_watcher: parse_bool(lookup("PDM_ENABLE_WATCHER"), true),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            index: IndexConfig {
                ignore: IgnoreRules::default().with_extra(self.ignore_patterns.iter().cloned()),
                cloud_new_window: self.cloud_new_window,
                ..IndexConfig::default()
            },
            executor: ExecutorConfig {
                concurrency: self.batch_concurrency,
                remote_timeout: self.remote_timeout,
            },
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            download_concurrency: self.download_concurrency,
        }
    }

    fn vault(&self) -> Vault {
        Vault {
            id: self.vault_id.clone(),
            name: self.vault_name.clone(),
            org_id: self.org_id.clone(),
            local_root: self.vault_root.clone(),
            is_active: false,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<VaultEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = WorkingCopyStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
        let client = VaultClient::with_base_url(&config.server_url, config.token.clone())
            .context("failed to build vault client")?;
        let engine = VaultEngine::new(
            Arc::new(
                HttpRemote::new(client)
                    .with_transfer(TransferClient::with_config(config.transfer_config())),
            ),
            Arc::new(NativeFs),
            config.engine_config(),
            Some(Arc::new(store)),
        );
        Self::with_engine(config, Arc::new(engine)).await
    }

    /// Connects and activates the configured vault on an existing engine.
    pub async fn with_engine(config: DaemonConfig, engine: Arc<VaultEngine>) -> anyhow::Result<Self> {
        let active = engine
            .load(&config.user_id)
            .await
            .context("failed to restore connected vaults")?;
        if engine.registry().get(&config.vault_id).is_none() {
            engine
                .connect(config.vault())
                .await
                .context("failed to connect vault")?;
        }
        if active.as_ref().map(|vault| vault.id.as_str()) != Some(config.vault_id.as_str()) {
            engine
                .switch_active(&config.vault_id, &config.user_id)
                .await
                .context("failed to activate vault")?;
        }
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Arc<VaultEngine> {
        &self.engine
    }

    /// One full sync of the active vault.
    pub async fn run_once(&self) -> anyhow::Result<StatusCounts> {
        let snapshot = self
            .engine
            .full_sync(&self.config.vault_id, &self.config.user_id)
            .await
            .context("index rebuild failed")?;
        let counts = snapshot.status_counts();
        info!(
            vault_id = %self.config.vault_id,
            counts = %format_status_counts(&counts),
            "vault status"
        );
        Ok(counts)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            vault_id = %self.config.vault_id,
            root = %self.config.vault_root.display(),
            watcher = self.config.enable_watcher,
            "pdmd started"
        );
        if let Err(err) = self.run_once().await {
            warn!("initial rebuild failed: {err:#}");
        }

        let vault_id = self.config.vault_id.clone();
        let user_id = self.config.user_id.clone();

        let engine_for_poll = Arc::clone(&self.engine);
        let poll_interval = self.config.poll_interval;
        let (poll_vault, poll_user) = (vault_id.clone(), user_id.clone());
        let poll_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if engine_for_poll.is_online() {
                    refresh_active(&engine_for_poll, &poll_vault, &poll_user, "poll").await;
                }
            }
        });

        let engine_for_link = Arc::clone(&self.engine);
        let (link_vault, link_user) = (vault_id.clone(), user_id.clone());
        let link_handle = tokio::spawn(async move {
            let mut backoff = ReconnectBackoff::default();
            loop {
                if engine_for_link.is_online() {
                    backoff.reset();
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                let delay = backoff.next_delay();
                debug!(attempt = backoff.attempts(), ?delay, "server unreachable, waiting");
                tokio::time::sleep(delay).await;
                if engine_for_link.probe().await {
                    info!(attempts = backoff.attempts(), "server reachable again");
                    replay_after_reconnect(&engine_for_link, &link_vault, &link_user).await;
                }
            }
        });

        let (watcher, watch_handle) = if self.config.enable_watcher {
            match start_watcher(
                &self.config.vault_root,
                self.engine.config().index.ignore.clone(),
            ) {
                Ok((watcher, mut rx)) => {
                    let engine_for_watch = Arc::clone(&self.engine);
                    let handle = tokio::spawn(async move {
                        while let Some(changes) = next_batch(&mut rx, WATCH_QUIET).await {
                            debug!(changes = changes.len(), "local changes");
                            if engine_for_watch.is_online() {
                                refresh_active(&engine_for_watch, &vault_id, &user_id, "local change")
                                    .await;
                            }
                        }
                    });
                    (Some(watcher), Some(handle))
                }
                Err(err) => {
                    warn!("failed to start local watcher: {err}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        poll_handle.abort();
        link_handle.abort();
        if let Some(handle) = watch_handle {
            handle.abort();
        }
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
