//! Server collaborator: the vault API plus blob storage.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use pdm_core::{
    ApiErrorClass, CheckinRequest, PdmError, ServerFileMetadata, SyncNewRequest, VaultClient,
};
use reqwest::StatusCode;
use thiserror::Error;

use super::transfer::{TransferClient, TransferError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("session expired or credentials rejected")]
    AuthExpired,
    #[error("file is checked out by {}", holder.as_deref().unwrap_or("another user"))]
    LockConflict { holder: Option<String> },
    #[error("not found on server")]
    NotFound,
    #[error("network failure: {0}")]
    Network(String),
    #[error("content integrity check failed: {0}")]
    Integrity(String),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("server did not answer within {0:?}")]
    Timeout(Duration),
}

/// Bounds a single server call. Elapsed calls surface as [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| RemoteError::Timeout(limit))?
}

impl From<PdmError> for RemoteError {
    fn from(err: PdmError) -> Self {
        match err.classification() {
            Some(ApiErrorClass::Auth) => RemoteError::AuthExpired,
            Some(ApiErrorClass::LockConflict) => RemoteError::LockConflict {
                holder: err.lock_holder(),
            },
            Some(ApiErrorClass::Transient) => RemoteError::Network(err.to_string()),
            Some(ApiErrorClass::Permanent) => match &err {
                PdmError::Api { status, .. } if *status == StatusCode::NOT_FOUND => {
                    RemoteError::NotFound
                }
                _ => RemoteError::Rejected(err.to_string()),
            },
            None => RemoteError::Network(err.to_string()),
        }
    }
}

impl From<TransferError> for RemoteError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::IntegrityMismatch { expected, actual } => {
                RemoteError::Integrity(format!("expected {expected}, got {actual}"))
            }
            TransferError::Request(inner) if inner.status() == Some(StatusCode::NOT_FOUND) => {
                RemoteError::NotFound
            }
            other => RemoteError::Network(other.to_string()),
        }
    }
}

#[async_trait]
pub trait RemoteVault: Send + Sync {
    async fn list_vault_files(&self, vault_id: &str)
    -> Result<Vec<ServerFileMetadata>, RemoteError>;

    async fn checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<ServerFileMetadata, RemoteError>;

    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: &CheckinRequest,
    ) -> Result<ServerFileMetadata, RemoteError>;

    async fn sync_new(
        &self,
        request: &SyncNewRequest,
        bytes: Vec<u8>,
    ) -> Result<ServerFileMetadata, RemoteError>;

    /// Puts new content into blob storage ahead of a content-changing check-in.
    async fn upload_content(
        &self,
        org_id: &str,
        content_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<(), RemoteError>;

    /// Resolves the download URL for a content hash and fetches verified bytes.
    async fn fetch_content(&self, org_id: &str, content_hash: &str)
    -> Result<Vec<u8>, RemoteError>;

    async fn force_release_checkout(
        &self,
        file_id: &str,
        admin_user_id: &str,
    ) -> Result<ServerFileMetadata, RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;
}

pub struct HttpRemote {
    client: VaultClient,
    transfer: TransferClient,
}

impl HttpRemote {
    pub fn new(client: VaultClient) -> Self {
        Self {
            client,
            transfer: TransferClient::new(),
        }
    }

    pub fn with_transfer(mut self, transfer: TransferClient) -> Self {
        self.transfer = transfer;
        self
    }
}

#[async_trait]
impl RemoteVault for HttpRemote {
    async fn list_vault_files(
        &self,
        vault_id: &str,
    ) -> Result<Vec<ServerFileMetadata>, RemoteError> {
        Ok(self.client.list_vault_files(vault_id).await?)
    }

    async fn checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<ServerFileMetadata, RemoteError> {
        Ok(self.client.checkout(file_id, user_id).await?)
    }

    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: &CheckinRequest,
    ) -> Result<ServerFileMetadata, RemoteError> {
        Ok(self.client.checkin(file_id, user_id, request).await?)
    }

    async fn sync_new(
        &self,
        request: &SyncNewRequest,
        bytes: Vec<u8>,
    ) -> Result<ServerFileMetadata, RemoteError> {
        Ok(self.client.sync_new(request, bytes).await?)
    }

    async fn upload_content(
        &self,
        org_id: &str,
        content_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<(), RemoteError> {
        Ok(self.client.upload_blob(org_id, content_hash, bytes).await?)
    }

    async fn fetch_content(
        &self,
        org_id: &str,
        content_hash: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        let link = self.client.get_download_url(org_id, content_hash).await?;
        Ok(self.transfer.fetch_verified(&link.url, content_hash).await?)
    }

    async fn force_release_checkout(
        &self,
        file_id: &str,
        admin_user_id: &str,
    ) -> Result<ServerFileMetadata, RemoteError> {
        Ok(self
            .client
            .force_release_checkout(file_id, admin_user_id)
            .await?)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(self.client.ping().await?)
    }
}
