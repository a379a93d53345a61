//! GCS client with V4 signed URLs.
//!
//! All object traffic goes over signed URLs so the worker only needs the
//! service-account key, no SDK. Signing is local (RSA-SHA256), uploads and
//! downloads are plain HTTP against the signed URL.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::auth::ServiceAccountKey;
use crate::error::{AppError, Result};
use crate::storage::{parse_gcs_uri, ObjectStore, StoredObject};

const GCS_HOST: &str = "storage.googleapis.com";

/// Characters that must be percent-encoded in the path component
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// GCS client for uploading, downloading and signing object URLs.
pub struct GcsClient {
    client_email: String,
    private_key: RsaPrivateKey,
    bucket: String,
    default_ttl: Duration,
    http: Client,
}

impl GcsClient {
    pub fn new(key: &ServiceAccountKey, bucket: &str, default_ttl: Duration) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key).map_err(|e| {
            AppError::Validation(format!("failed to parse service account private key: {e}"))
        })?;

        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        info!(bucket = %bucket, "GCS client initialized");

        Ok(Self {
            client_email: key.client_email.clone(),
            private_key,
            bucket: bucket.to_string(),
            default_ttl,
            http,
        })
    }

    /// Generate a V4 signed URL for the given method.
    fn sign_url(
        &self,
        method: &str,
        bucket: &str,
        object_path: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let datestamp = now.format("%Y%m%d").to_string();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();

        let credential_scope = format!("{datestamp}/auto/storage/goog4_request");
        let credential = format!("{}/{}", self.client_email, credential_scope);

        let encoded_object = utf8_percent_encode(object_path, PATH_SET).to_string();
        let canonical_uri = format!("/{}/{}", bucket, encoded_object.trim_start_matches('/'));

        let canonical_headers = format!("host:{GCS_HOST}\n");
        let signed_headers = "host";

        let mut query_items = vec![
            ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
            (
                "X-Goog-Credential",
                urlencoding::encode(&credential).into_owned(),
            ),
            ("X-Goog-Date", timestamp.clone()),
            ("X-Goog-Expires", expires_in.as_secs().to_string()),
            ("X-Goog-SignedHeaders", signed_headers.to_string()),
        ];
        query_items.sort_by(|a, b| a.0.cmp(b.0));
        let canonical_query = query_items
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\nUNSIGNED-PAYLOAD"
        );
        let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign =
            format!("GOOG4-RSA-SHA256\n{timestamp}\n{credential_scope}\n{canonical_hash}");

        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key.sign(string_to_sign.as_bytes()).to_bytes();
        let signature_hex = hex::encode(signature);

        Ok(format!(
            "https://{GCS_HOST}{canonical_uri}?{canonical_query}&X-Goog-Signature={signature_hex}"
        ))
    }
}

#[async_trait::async_trait]
impl ObjectStore for GcsClient {
    async fn upload(
        &self,
        data: Bytes,
        object_name: &str,
        mime_type: &str,
    ) -> Result<StoredObject> {
        let url = self.sign_url("PUT", &self.bucket, object_name, Duration::from_secs(300))?;

        debug!(object_name = %object_name, size = data.len(), "uploading to GCS");

        let response = self
            .http
            .put(&url)
            .header("Content-Type", mime_type)
            .body(data)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "GCS upload failed with {status}: {body}"
            )));
        }

        let gcs_uri = format!("gs://{}/{}", self.bucket, object_name);
        info!(gcs_uri = %gcs_uri, "uploaded to GCS");

        Ok(StoredObject {
            gcs_uri,
            bucket: self.bucket.clone(),
            object_name: object_name.to_string(),
        })
    }

    async fn download(&self, gcs_uri: &str) -> Result<Bytes> {
        let (bucket, object_name) = parse_gcs_uri(gcs_uri)?;
        let url = self.sign_url("GET", &bucket, &object_name, Duration::from_secs(300))?;

        debug!(gcs_uri = %gcs_uri, "downloading from GCS");

        let response = self.http.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("object not found: {gcs_uri}")));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "GCS download failed with {status}: {body}"
            )));
        }

        let bytes = response.bytes().await?;
        debug!(gcs_uri = %gcs_uri, size = bytes.len(), "downloaded from GCS");
        Ok(bytes)
    }

    fn signed_read_url(
        &self,
        object_name: &str,
        bucket: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<String> {
        self.sign_url(
            "GET",
            bucket.unwrap_or(&self.bucket),
            object_name,
            ttl.unwrap_or(self.default_ttl),
        )
    }

    fn signed_write_url(
        &self,
        object_name: &str,
        _content_type: &str,
        ttl: Option<Duration>,
    ) -> Result<String> {
        self.sign_url(
            "PUT",
            &self.bucket,
            object_name,
            ttl.unwrap_or(self.default_ttl),
        )
    }

    async fn delete(&self, gcs_uri: &str) -> Result<bool> {
        let (bucket, object_name) = parse_gcs_uri(gcs_uri)?;
        let url = self.sign_url("DELETE", &bucket, &object_name, Duration::from_secs(300))?;

        let response = self.http.delete(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "GCS delete failed with {status}: {body}"
            )));
        }

        info!(gcs_uri = %gcs_uri, "deleted from GCS");
        Ok(true)
    }

    async fn exists(&self, gcs_uri: &str) -> Result<bool> {
        let (bucket, object_name) = parse_gcs_uri(gcs_uri)?;
        let url = self.sign_url("HEAD", &bucket, &object_name, Duration::from_secs(300))?;

        let response = self.http.head(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::Backend(format!(
                "GCS existence check failed with {status}"
            )));
        }
        Ok(true)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
