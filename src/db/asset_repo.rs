//! Asset record CRUD over the document store.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::db::{asset_collection, asset_doc, DocumentStore};
use crate::error::{AppError, Result};
use crate::models::{now_iso, Asset};

#[derive(Clone)]
pub struct AssetRepo {
    docs: Arc<dyn DocumentStore>,
}

impl AssetRepo {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// Save an asset record, stamping `uploadedAt` (if unset) and `updatedAt`.
    pub async fn save(&self, user_id: &str, project_id: &str, asset: &Asset) -> Result<Asset> {
        if asset.id.is_empty() {
            return Err(AppError::Validation("asset must include an id".to_string()));
        }

        let mut asset = asset.clone();
        let now = now_iso();
        if asset.uploaded_at.is_empty() {
            asset.uploaded_at = now.clone();
        }
        asset.updated_at = now;

        let doc = serde_json::to_value(&asset)?;
        self.docs
            .set_doc(&asset_doc(user_id, project_id, &asset.id), doc)
            .await?;

        info!(asset_id = %asset.id, user_id = %user_id, project_id = %project_id, "saved asset");
        Ok(asset)
    }

    /// Fetch an asset, or `None` when it does not exist.
    pub async fn try_get(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
    ) -> Result<Option<Asset>> {
        match self
            .docs
            .get_doc(&asset_doc(user_id, project_id, asset_id))
            .await?
        {
            Some(mut doc) => {
                // The id is authoritative from the path.
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(asset_id.to_string()));
                }
                Ok(Some(serde_json::from_value(doc)?))
            }
            None => Ok(None),
        }
    }

    /// Fetch an asset, failing with `NotFound` when absent.
    pub async fn get(&self, user_id: &str, project_id: &str, asset_id: &str) -> Result<Asset> {
        self.try_get(user_id, project_id, asset_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("asset not found: {asset_id}")))
    }

    /// All asset records under a project; ordering is unspecified.
    pub async fn list(&self, user_id: &str, project_id: &str) -> Result<Vec<Asset>> {
        let docs = self
            .docs
            .list_docs(&asset_collection(user_id, project_id))
            .await?;

        let mut assets = Vec::with_capacity(docs.len());
        for doc in docs {
            assets.push(serde_json::from_value(doc)?);
        }
        Ok(assets)
    }

    /// Merge fields into an asset record (last-writer-wins per field) and
    /// return the updated record. `updatedAt` is bumped automatically.
    pub async fn update(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
        updates: Value,
    ) -> Result<Asset> {
        let mut updates = updates;
        match updates.as_object_mut() {
            Some(obj) => {
                obj.insert("updatedAt".to_string(), Value::String(now_iso()));
            }
            None => {
                return Err(AppError::Validation(
                    "asset updates must be an object".to_string(),
                ))
            }
        }

        let path = asset_doc(user_id, project_id, asset_id);
        match self.docs.merge_doc(&path, updates).await {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {
                return Err(AppError::NotFound(format!("asset not found: {asset_id}")))
            }
            Err(e) => return Err(e),
        }

        self.get(user_id, project_id, asset_id).await
    }

    /// Delete an asset record. `Ok(true)` when it existed.
    pub async fn delete(&self, user_id: &str, project_id: &str, asset_id: &str) -> Result<bool> {
        let deleted = self
            .docs
            .delete_doc(&asset_doc(user_id, project_id, asset_id))
            .await?;
        if deleted {
            info!(asset_id = %asset_id, "deleted asset");
        }
        Ok(deleted)
    }
}
