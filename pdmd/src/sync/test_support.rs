use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pdm_core::{CheckedOutUser, CheckinRequest, ServerFileMetadata, SyncNewRequest};

use super::fs::hash_bytes;
use super::model::Vault;
use super::paths::{extension, file_name};
use super::remote::{RemoteError, RemoteVault};
use super::store::WorkingCopyStore;

type CheckinHook = Box<dyn Fn(usize) + Send + Sync>;

/// In-memory vault server.
#[derive(Default)]
pub struct FakeRemote {
    files: Mutex<BTreeMap<String, ServerFileMetadata>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    auth_expired: AtomicBool,
    failures: Mutex<HashMap<String, RemoteError>>,
    delay: Mutex<Option<Duration>>,
    checkins: AtomicU64,
    on_checkin: Mutex<Option<CheckinHook>>,
    calls: Mutex<Vec<String>>,
}

pub fn record(id: &str, path: &str, bytes: &[u8], version: u64) -> ServerFileMetadata {
    ServerFileMetadata {
        id: id.to_string(),
        file_path: path.to_string(),
        file_name: file_name(path).to_string(),
        extension: Some(extension(path)),
        content_hash: hash_bytes(bytes),
        version,
        file_size: bytes.len() as u64,
        checked_out_by: None,
        checked_out_user: None,
        created_at: Some("2024-01-01T00:00:00Z".into()),
        updated_at: None,
    }
}

pub fn vault_at(root: &Path) -> Vault {
    Vault {
        id: "v-1".into(),
        name: "Main".into(),
        org_id: "o-1".into(),
        local_root: root.to_path_buf(),
        is_active: true,
    }
}

pub async fn memory_store() -> WorkingCopyStore {
    WorkingCopyStore::new("sqlite::memory:").await.unwrap()
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: &str, bytes: &[u8], version: u64) -> ServerFileMetadata {
        let id = format!("f-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = record(&id, path, bytes, version);
        self.blobs
            .lock()
            .unwrap()
            .insert(record.content_hash.clone(), bytes.to_vec());
        self.files.lock().unwrap().insert(id, record.clone());
        record
    }

    pub fn by_path(&self, path: &str) -> Option<ServerFileMetadata> {
        self.files
            .lock()
            .unwrap()
            .values()
            .find(|record| record.file_path == path)
            .cloned()
    }

    fn update_by_path(&self, path: &str, edit: impl FnOnce(&mut ServerFileMetadata)) {
        let mut files = self.files.lock().unwrap();
        let record = files
            .values_mut()
            .find(|record| record.file_path == path)
            .expect("fake file exists");
        edit(record);
    }

    pub fn set_checked_out(&self, path: &str, user: Option<&str>) {
        self.update_by_path(path, |record| {
            record.checked_out_by = user.map(str::to_string);
            record.checked_out_user = user.map(|user| CheckedOutUser {
                full_name: Some(format!("User {user}")),
                email: None,
                avatar_url: None,
            });
        });
    }

    /// Another client checks in new content.
    pub fn publish_new_version(&self, path: &str, bytes: &[u8]) {
        let hash = hash_bytes(bytes);
        self.blobs
            .lock()
            .unwrap()
            .insert(hash.clone(), bytes.to_vec());
        self.update_by_path(path, |record| {
            record.content_hash = hash;
            record.file_size = bytes.len() as u64;
            record.version += 1;
        });
    }

    pub fn remove(&self, path: &str) {
        self.files
            .lock()
            .unwrap()
            .retain(|_, record| record.file_path != path);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn expire_auth(&self) {
        self.auth_expired.store(true, Ordering::SeqCst);
    }

    pub fn fail_file(&self, file_id: &str, err: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .insert(file_id.to_string(), err);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Runs after every accepted check-in with the running check-in count.
    pub fn on_checkin(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_checkin.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: String, file_id: Option<&str>) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("offline".into()));
        }
        if self.auth_expired.load(Ordering::SeqCst) {
            return Err(RemoteError::AuthExpired);
        }
        if let Some(file_id) = file_id
            && let Some(err) = self.failures.lock().unwrap().get(file_id).cloned()
        {
            return Err(err);
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteVault for FakeRemote {
    async fn list_vault_files(
        &self,
        vault_id: &str,
    ) -> Result<Vec<ServerFileMetadata>, RemoteError> {
        self.enter(format!("list {vault_id}"), None).await?;
        Ok(self.files.lock().unwrap().values().cloned().collect())
    }

    async fn checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<ServerFileMetadata, RemoteError> {
        self.enter(format!("checkout {file_id}"), Some(file_id))
            .await?;
        let mut files = self.files.lock().unwrap();
        let record = files.get_mut(file_id).ok_or(RemoteError::NotFound)?;
        match record.checked_out_by.as_deref() {
            Some(holder) if holder != user_id => Err(RemoteError::LockConflict {
                holder: Some(holder.to_string()),
            }),
            _ => {
                record.checked_out_by = Some(user_id.to_string());
                Ok(record.clone())
            }
        }
    }

    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: &CheckinRequest,
    ) -> Result<ServerFileMetadata, RemoteError> {
        self.enter(format!("checkin {file_id}"), Some(file_id))
            .await?;
        let result = {
            let mut files = self.files.lock().unwrap();
            let record = files.get_mut(file_id).ok_or(RemoteError::NotFound)?;
            if record.checked_out_by.as_deref() != Some(user_id) {
                return Err(RemoteError::LockConflict {
                    holder: record.checked_out_by.clone(),
                });
            }
            if let Some(hash) = &request.new_content_hash
                && hash != &record.content_hash
            {
                record.content_hash = hash.clone();
                record.version += 1;
            }
            if let Some(size) = request.new_size {
                record.file_size = size;
            }
            if let Some(path) = &request.new_path {
                record.file_path = path.clone();
            }
            if let Some(name) = &request.new_name {
                record.file_name = name.clone();
            }
            record.checked_out_by = None;
            record.checked_out_user = None;
            record.clone()
        };
        let count = self.checkins.fetch_add(1, Ordering::SeqCst) as usize + 1;
        if let Some(hook) = self.on_checkin.lock().unwrap().as_ref() {
            hook(count);
        }
        Ok(result)
    }

    async fn sync_new(
        &self,
        request: &SyncNewRequest,
        bytes: Vec<u8>,
    ) -> Result<ServerFileMetadata, RemoteError> {
        self.enter(format!("sync_new {}", request.file_path), None)
            .await?;
        let id = format!("f-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut record = record(&id, &request.file_path, &bytes, 1);
        record.content_hash = request.content_hash.clone();
        record.created_at = Some("2030-01-01T00:00:00Z".into());
        self.blobs
            .lock()
            .unwrap()
            .insert(request.content_hash.clone(), bytes);
        self.files.lock().unwrap().insert(id, record.clone());
        Ok(record)
    }

    async fn upload_content(
        &self,
        _org_id: &str,
        content_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.enter(format!("upload {content_hash}"), None).await?;
        self.blobs
            .lock()
            .unwrap()
            .insert(content_hash.to_string(), bytes);
        Ok(())
    }

    async fn fetch_content(
        &self,
        _org_id: &str,
        content_hash: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        self.enter(format!("fetch {content_hash}"), None).await?;
        self.blobs
            .lock()
            .unwrap()
            .get(content_hash)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn force_release_checkout(
        &self,
        file_id: &str,
        _admin_user_id: &str,
    ) -> Result<ServerFileMetadata, RemoteError> {
        self.enter(format!("force_release {file_id}"), None).await?;
        let mut files = self.files.lock().unwrap();
        let record = files.get_mut(file_id).ok_or(RemoteError::NotFound)?;
        record.checked_out_by = None;
        record.checked_out_user = None;
        Ok(record.clone())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.enter("ping".into(), None).await
    }
}
