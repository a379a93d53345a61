//! Firestore REST client.
//!
//! Talks to the Firestore v1 REST API with OAuth tokens from [`GcpAuth`] and
//! converts between plain JSON and Firestore's typed value representation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::auth::GcpAuth;
use crate::db::DocumentStore;
use crate::error::{AppError, Result};

const FIRESTORE_BASE: &str = "https://firestore.googleapis.com/v1";
const PAGE_SIZE: u32 = 300;

pub struct FirestoreClient {
    auth: Arc<GcpAuth>,
    http: reqwest::Client,
    /// `projects/{project}/databases/(default)/documents`
    root: String,
}

impl FirestoreClient {
    pub fn new(auth: Arc<GcpAuth>, project_id: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self {
            auth,
            http,
            root: format!("projects/{project_id}/databases/(default)/documents"),
        })
    }

    fn doc_url(&self, path: &str) -> String {
        format!("{FIRESTORE_BASE}/{}/{}", self.root, path)
    }

    async fn bearer(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.auth.access_token().await?))
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn get_doc(&self, path: &str) -> Result<Option<Value>> {
        let response = self
            .http
            .get(self.doc_url(path))
            .header("Authorization", self.bearer().await?)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "firestore get failed with {status}: {body}"
            )));
        }

        let doc: Value = response.json().await?;
        Ok(Some(decode_document(&doc)))
    }

    async fn set_doc(&self, path: &str, doc: Value) -> Result<()> {
        // PATCH without an update mask replaces the whole document.
        let body = json!({ "fields": encode_fields(&doc)? });

        let response = self
            .http
            .patch(self.doc_url(path))
            .header("Authorization", self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "firestore set failed with {status}: {text}"
            )));
        }

        debug!(path = %path, "wrote document");
        Ok(())
    }

    async fn merge_doc(&self, path: &str, fields: Value) -> Result<()> {
        let object = fields
            .as_object()
            .ok_or_else(|| AppError::Validation("merge payload must be an object".to_string()))?;

        let mut url = format!("{}?currentDocument.exists=true", self.doc_url(path));
        for key in object.keys() {
            url.push_str("&updateMask.fieldPaths=");
            url.push_str(&urlencoding::encode(key));
        }

        let body = json!({ "fields": encode_fields(&fields)? });
        let response = self
            .http
            .patch(&url)
            .header("Authorization", self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("document not found: {path}")));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "firestore merge failed with {status}: {text}"
            )));
        }

        Ok(())
    }

    async fn delete_doc(&self, path: &str) -> Result<bool> {
        let url = format!("{}?currentDocument.exists=true", self.doc_url(path));
        let response = self
            .http
            .delete(&url)
            .header("Authorization", self.bearer().await?)
            .send()
            .await?;

        // Failed existence precondition surfaces as 404 (or 409 on some
        // backends); both mean there was nothing to delete.
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::CONFLICT
        {
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "firestore delete failed with {status}: {text}"
            )));
        }

        Ok(true)
    }

    async fn list_docs(&self, collection_path: &str) -> Result<Vec<Value>> {
        let mut docs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}?pageSize={PAGE_SIZE}", self.doc_url(collection_path));
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(&urlencoding::encode(token));
            }

            let response = self
                .http
                .get(&url)
                .header("Authorization", self.bearer().await?)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(AppError::Backend(format!(
                    "firestore list failed with {status}: {text}"
                )));
            }

            let page: Value = response.json().await?;
            if let Some(items) = page.get("documents").and_then(Value::as_array) {
                docs.extend(items.iter().map(decode_document));
            }

            match page.get("nextPageToken").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(docs)
    }
}

/// Encode a JSON object into Firestore's `fields` map.
pub fn encode_fields(doc: &Value) -> Result<Value> {
    let object = doc
        .as_object()
        .ok_or_else(|| AppError::Validation("document must be a JSON object".to_string()))?;

    let mut fields = Map::new();
    for (key, value) in object {
        fields.insert(key.clone(), encode_value(value));
    }
    Ok(Value::Object(fields))
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                // Firestore integers travel as strings.
                json!({ "integerValue": i.to_string() })
            } else {
                json!({ "doubleValue": n.as_f64() })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => {
            let mut fields = Map::new();
            for (k, v) in map {
                fields.insert(k.clone(), encode_value(v));
            }
            json!({ "mapValue": { "fields": fields } })
        }
    }
}

/// Decode a Firestore document resource into a plain JSON object.
pub fn decode_document(doc: &Value) -> Value {
    let mut out = Map::new();
    if let Some(fields) = doc.get("fields").and_then(Value::as_object) {
        for (key, value) in fields {
            out.insert(key.clone(), decode_value(value));
        }
    }
    Value::Object(out)
}

fn decode_value(value: &Value) -> Value {
    let Some(object) = value.as_object() else {
        return Value::Null;
    };

    if let Some((kind, inner)) = object.iter().next() {
        match kind.as_str() {
            "nullValue" => Value::Null,
            "booleanValue" => inner.clone(),
            "integerValue" => match inner {
                Value::String(s) => s
                    .parse::<i64>()
                    .map(|i| Value::Number(i.into()))
                    .unwrap_or(Value::Null),
                Value::Number(_) => inner.clone(),
                _ => Value::Null,
            },
            "doubleValue" => inner.clone(),
            "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
            "arrayValue" => {
                let items = inner
                    .get("values")
                    .and_then(Value::as_array)
                    .map(|v| v.iter().map(decode_value).collect())
                    .unwrap_or_default();
                Value::Array(items)
            }
            "mapValue" => {
                let mut map = Map::new();
                if let Some(fields) = inner.get("fields").and_then(Value::as_object) {
                    for (k, v) in fields {
                        map.insert(k.clone(), decode_value(v));
                    }
                }
                Value::Object(map)
            }
            _ => Value::Null,
        }
    } else {
        Value::Null
    }
}
