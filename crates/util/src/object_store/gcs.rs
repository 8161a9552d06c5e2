use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, header};
use tracing::{debug, warn};
use url::Url;

use super::{GcsBucket, ObjectStore, ObjectStoreError, validate_object_path};

/// Environment variable holding the OAuth bearer token for uploads.
pub const GCS_ACCESS_TOKEN_ENV: &str = "GCS_ACCESS_TOKEN";

const DEFAULT_UPLOAD_BASE: &str = "https://storage.googleapis.com";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Uploads objects through the Cloud Storage JSON API (`uploadType=media`).
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    bucket: GcsBucket,
    http: Client,
    access_token: String,
    upload_base: Url,
}

impl GcsObjectStore {
    /// Creates a store authenticated with a bearer token.
    pub fn new(bucket: GcsBucket, access_token: impl Into<String>) -> Result<Self, ObjectStoreError> {
        let http = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|error| ObjectStoreError::Config(format!("build http client: {error}")))?;
        let upload_base = Url::parse(DEFAULT_UPLOAD_BASE).map_err(|error| ObjectStoreError::Config(error.to_string()))?;
        Ok(Self {
            bucket,
            http,
            access_token: access_token.into(),
            upload_base,
        })
    }

    /// Creates a store using the token from [`GCS_ACCESS_TOKEN_ENV`].
    pub fn from_env(bucket: GcsBucket) -> Result<Self, ObjectStoreError> {
        let token = env::var(GCS_ACCESS_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ObjectStoreError::Config(format!("{GCS_ACCESS_TOKEN_ENV} is not set")))?;
        Self::new(bucket, token.trim())
    }

    /// Points uploads at another endpoint, such as a storage emulator.
    pub fn with_upload_base(mut self, base: &str) -> Result<Self, ObjectStoreError> {
        self.upload_base = Url::parse(base).map_err(|error| ObjectStoreError::Config(format!("invalid upload base '{base}': {error}")))?;
        Ok(self)
    }

    fn upload_url(&self) -> Result<Url, ObjectStoreError> {
        let path = format!("upload/storage/v1/b/{}/o", self.bucket.name());
        self.upload_base
            .join(&path)
            .map_err(|error| ObjectStoreError::Config(format!("invalid upload url: {error}")))
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn bucket(&self) -> &GcsBucket {
        &self.bucket
    }

    async fn upload(&self, object_path: &str, bytes: &[u8], content_type: &str) -> Result<String, ObjectStoreError> {
        validate_object_path(object_path)?;
        let url = self.upload_url()?;

        let response = self
            .http
            .post(url)
            .query(&[("uploadType", "media"), ("name", object_path)])
            .bearer_auth(&self.access_token)
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|error| ObjectStoreError::write(object_path, error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(object_path, status = status.as_u16(), "gcs_upload_rejected");
            return Err(ObjectStoreError::write(object_path, format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }

        debug!(object_path, size = bytes.len(), "gcs_upload_completed");
        Ok(self.bucket.uri_for(object_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_url_targets_bucket() {
        let store = GcsObjectStore::new(GcsBucket::parse("charts").unwrap(), "token").unwrap();
        assert_eq!(
            store.upload_url().unwrap().as_str(),
            "https://storage.googleapis.com/upload/storage/v1/b/charts/o"
        );
    }

    #[test]
    fn from_env_requires_token() {
        temp_env::with_var(GCS_ACCESS_TOKEN_ENV, None::<&str>, || {
            let error = GcsObjectStore::from_env(GcsBucket::parse("charts").unwrap()).unwrap_err();
            assert!(matches!(error, ObjectStoreError::Config(_)));
        });
        temp_env::with_var(GCS_ACCESS_TOKEN_ENV, Some("abc"), || {
            assert!(GcsObjectStore::from_env(GcsBucket::parse("charts").unwrap()).is_ok());
        });
    }
}
