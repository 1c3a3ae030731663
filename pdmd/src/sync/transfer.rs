use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// Fetches blob content from signed storage URLs.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
        }
    }

    /// Streams the body into memory and verifies its SHA-256 against the
    /// content hash the server published.
    pub async fn fetch_verified(
        &self,
        href: &Url,
        expected_sha256: &str,
    ) -> Result<Vec<u8>, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = self
            .http
            .get(href.clone())
            .send()
            .await?
            .error_for_status()?;

        let mut body = Vec::new();
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }

        let actual = format!("{:x}", hasher.finalize());
        let expected = expected_sha256.to_ascii_lowercase();
        if actual != expected {
            return Err(TransferError::IntegrityMismatch { expected, actual });
        }
        Ok(body)
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fs::hash_bytes;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_and_verifies_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let client = TransferClient::new();
        let url = Url::parse(&format!("{}/blob", server.uri())).unwrap();
        let body = client
            .fetch_verified(&url, &hash_bytes(b"hello"))
            .await
            .unwrap();

        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn fails_when_hash_does_not_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let client = TransferClient::new();
        let url = Url::parse(&format!("{}/blob", server.uri())).unwrap();
        let err = client
            .fetch_verified(&url, "deadbeef")
            .await
            .expect_err("expected hash mismatch");

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = TransferClient::new();
        let url = Url::parse(&format!("{}/blob", server.uri())).unwrap();
        let err = client.fetch_verified(&url, "00").await.unwrap_err();

        assert!(matches!(err, TransferError::Request(_)));
    }
}
