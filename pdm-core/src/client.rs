use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum PdmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    LockConflict,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct VaultClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl VaultClient {
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, PdmError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn ping(&self) -> Result<(), PdmError> {
        let url = self.endpoint("/v1/health")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn list_vault_files(
        &self,
        vault_id: &str,
    ) -> Result<Vec<ServerFileMetadata>, PdmError> {
        let url = self.endpoint(&format!("/v1/vaults/{vault_id}/files"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: FileListResponse = Self::handle_response(response).await?;
        Ok(payload.files)
    }

    pub async fn checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<ServerFileMetadata, PdmError> {
        let url = self.endpoint(&format!("/v1/files/{file_id}/checkout"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&UserBody { user_id })
            .send()
            .await?;
        let payload: RecordResponse = Self::handle_response(response).await?;
        Ok(payload.server_record)
    }

    pub async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: &CheckinRequest,
    ) -> Result<ServerFileMetadata, PdmError> {
        let url = self.endpoint(&format!("/v1/files/{file_id}/checkin"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&CheckinBody { user_id, request })
            .send()
            .await?;
        let payload: RecordResponse = Self::handle_response(response).await?;
        Ok(payload.server_record)
    }

    /// Uploads the bytes to blob storage, then registers the file record.
    pub async fn sync_new(
        &self,
        request: &SyncNewRequest,
        bytes: Vec<u8>,
    ) -> Result<ServerFileMetadata, PdmError> {
        self.upload_blob(&request.org_id, &request.content_hash, bytes)
            .await?;
        let url = self.endpoint(&format!(
            "/v1/orgs/{}/vaults/{}/files",
            request.org_id, request.vault_id
        ))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        let payload: RecordResponse = Self::handle_response(response).await?;
        Ok(payload.server_record)
    }

    pub async fn upload_blob(
        &self,
        org_id: &str,
        content_hash: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PdmError> {
        let url = self.endpoint(&format!("/v1/orgs/{org_id}/blobs/{content_hash}"))?;
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(bytes)
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn get_download_url(
        &self,
        org_id: &str,
        content_hash: &str,
    ) -> Result<DownloadLink, PdmError> {
        let url = self.endpoint(&format!(
            "/v1/orgs/{org_id}/blobs/{content_hash}/download-url"
        ))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn force_release_checkout(
        &self,
        file_id: &str,
        admin_user_id: &str,
    ) -> Result<ServerFileMetadata, PdmError> {
        let url = self.endpoint(&format!("/v1/files/{file_id}/force-release"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&UserBody {
                user_id: admin_user_id,
            })
            .send()
            .await?;
        let payload: RecordResponse = Self::handle_response(response).await?;
        Ok(payload.server_record)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PdmError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PdmError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PdmError::Api { status, body })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), PdmError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PdmError::Api { status, body })
        }
    }
}

impl PdmError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            PdmError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    /// Display name of the current lock holder, when the server reported one
    /// alongside a lock conflict.
    pub fn lock_holder(&self) -> Option<String> {
        let PdmError::Api { status, body } = self else {
            return None;
        };
        if classify_api_status(*status) != ApiErrorClass::LockConflict {
            return None;
        }
        let parsed: LockConflictBody = serde_json::from_str(body).ok()?;
        parsed
            .checked_out_user
            .and_then(|user| user.full_name.or(user.email))
            .or(parsed.checked_out_by)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if matches!(status, StatusCode::CONFLICT | StatusCode::LOCKED) {
        ApiErrorClass::LockConflict
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerFileMetadata {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub extension: Option<String>,
    pub content_hash: String,
    pub version: u64,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub checked_out_by: Option<String>,
    #[serde(default)]
    pub checked_out_user: Option<CheckedOutUser>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CheckedOutUser {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CheckinRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncNewRequest {
    pub org_id: String,
    pub vault_id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_name: String,
    pub extension: String,
    pub file_size: u64,
    pub content_hash: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DownloadLink {
    pub url: Url,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    files: Vec<ServerFileMetadata>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    server_record: ServerFileMetadata,
}

#[derive(Debug, Serialize)]
struct UserBody<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CheckinBody<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    request: &'a CheckinRequest,
}

#[derive(Debug, Deserialize)]
struct LockConflictBody {
    #[serde(default)]
    checked_out_by: Option<String>,
    #[serde(default)]
    checked_out_user: Option<CheckedOutUser>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::LOCKED),
            ApiErrorClass::LockConflict
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn lock_holder_prefers_display_name() {
        let err = PdmError::Api {
            status: StatusCode::CONFLICT,
            body: r#"{"checked_out_by":"u-2","checked_out_user":{"full_name":"Dana"}}"#.into(),
        };
        assert_eq!(err.lock_holder().as_deref(), Some("Dana"));

        let bare = PdmError::Api {
            status: StatusCode::CONFLICT,
            body: r#"{"checked_out_by":"u-2"}"#.into(),
        };
        assert_eq!(bare.lock_holder().as_deref(), Some("u-2"));
    }

    #[test]
    fn lock_holder_is_none_for_other_errors() {
        let err = PdmError::Api {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: r#"{"checked_out_by":"u-2"}"#.into(),
        };
        assert_eq!(err.lock_holder(), None);
    }
}
