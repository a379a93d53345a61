//! Document store gateway and typed repositories.
//!
//! Documents live under deterministic hierarchical paths:
//!
//! ```text
//! users/{uid}/projects/{pid}/assets/{aid}
//! users/{uid}/projects/{pid}/assets/{aid}/pipeline/state
//! users/{uid}/projects/{pid}/transcodeJobs/{jobId}
//! users/{uid}/projects/{pid}/conversionJobs/{jobId}
//! users/{uid}/projects/{pid}/transcriptions/{jobId}
//! ```

pub mod asset_repo;
pub mod firestore;
pub mod job_repo;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use asset_repo::AssetRepo;
pub use firestore::FirestoreClient;
pub use job_repo::JobRepo;

pub fn asset_collection(user_id: &str, project_id: &str) -> String {
    format!("users/{user_id}/projects/{project_id}/assets")
}

pub fn asset_doc(user_id: &str, project_id: &str, asset_id: &str) -> String {
    format!("users/{user_id}/projects/{project_id}/assets/{asset_id}")
}

pub fn pipeline_state_doc(user_id: &str, project_id: &str, asset_id: &str) -> String {
    format!("users/{user_id}/projects/{project_id}/assets/{asset_id}/pipeline/state")
}

pub fn job_collection(user_id: &str, project_id: &str, collection: &str) -> String {
    format!("users/{user_id}/projects/{project_id}/{collection}")
}

/// Narrow interface over the document database. Documents are plain JSON
/// objects; paths are `/`-separated as above.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` when it does not exist.
    async fn get_doc(&self, path: &str) -> Result<Option<Value>>;

    /// Create or fully overwrite a document.
    async fn set_doc(&self, path: &str, doc: Value) -> Result<()>;

    /// Merge top-level fields into an existing document (last-writer-wins per
    /// field). Fails with `NotFound` when the document does not exist.
    async fn merge_doc(&self, path: &str, fields: Value) -> Result<()>;

    /// Delete a document. `Ok(true)` when it existed.
    async fn delete_doc(&self, path: &str) -> Result<bool>;

    /// All documents in a collection; ordering is unspecified.
    async fn list_docs(&self, collection_path: &str) -> Result<Vec<Value>>;
}
