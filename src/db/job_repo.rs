//! External-job record storage.
//!
//! One repository per remote-service kind; the collection name is the only
//! difference between transcode, conversion and transcription job stores.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::db::{job_collection, DocumentStore};
use crate::error::{AppError, Result};
use crate::models::{now_iso, JobRecord};

pub const TRANSCODE_JOBS: &str = "transcodeJobs";
pub const CONVERSION_JOBS: &str = "conversionJobs";
pub const TRANSCRIPTION_JOBS: &str = "transcriptions";

#[derive(Clone)]
pub struct JobRepo {
    docs: Arc<dyn DocumentStore>,
    collection: &'static str,
}

impl JobRepo {
    pub fn new(docs: Arc<dyn DocumentStore>, collection: &'static str) -> Self {
        Self { docs, collection }
    }

    fn doc_path(&self, user_id: &str, project_id: &str, job_id: &str) -> String {
        format!("{}/{job_id}", job_collection(user_id, project_id, self.collection))
    }

    pub async fn save(&self, job: &JobRecord) -> Result<()> {
        let doc = serde_json::to_value(job)?;
        self.docs
            .set_doc(&self.doc_path(&job.user_id, &job.project_id, &job.id), doc)
            .await?;
        info!(job_id = %job.id, asset_id = %job.asset_id, collection = self.collection, "saved job");
        Ok(())
    }

    pub async fn get(
        &self,
        user_id: &str,
        project_id: &str,
        job_id: &str,
    ) -> Result<Option<JobRecord>> {
        match self
            .docs
            .get_doc(&self.doc_path(user_id, project_id, job_id))
            .await?
        {
            Some(doc) => Ok(Some(job_from_doc(doc, user_id, project_id)?)),
            None => Ok(None),
        }
    }

    /// Merge fields into a job record, bumping `updatedAt`.
    pub async fn update(
        &self,
        user_id: &str,
        project_id: &str,
        job_id: &str,
        updates: Value,
    ) -> Result<()> {
        let mut updates = updates;
        match updates.as_object_mut() {
            Some(obj) => {
                obj.insert("updatedAt".to_string(), Value::String(now_iso()));
            }
            None => {
                return Err(AppError::Validation(
                    "job updates must be an object".to_string(),
                ))
            }
        }

        self.docs
            .merge_doc(&self.doc_path(user_id, project_id, job_id), updates)
            .await?;
        debug!(job_id = %job_id, collection = self.collection, "updated job");
        Ok(())
    }

    /// The most recently created job for an asset, optionally restricted to a
    /// config hash. Sorting happens client-side over the job list, the way the
    /// document store's unordered listing requires.
    pub async fn find_latest_for_asset(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
        config_hash: Option<&str>,
    ) -> Result<Option<JobRecord>> {
        let mut jobs = self.list_for_asset(user_id, project_id, asset_id).await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(jobs.into_iter().find(|job| match config_hash {
            Some(hash) => job.config_hash() == Some(hash),
            None => true,
        }))
    }

    pub async fn list_for_asset(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
    ) -> Result<Vec<JobRecord>> {
        let docs = self
            .docs
            .list_docs(&job_collection(user_id, project_id, self.collection))
            .await?;

        let mut jobs = Vec::new();
        for doc in docs {
            let job = job_from_doc(doc, user_id, project_id)?;
            if job.asset_id == asset_id {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

fn job_from_doc(doc: Value, user_id: &str, project_id: &str) -> Result<JobRecord> {
    let mut job: JobRecord = serde_json::from_value(doc)?;
    if job.user_id.is_empty() {
        job.user_id = user_id.to_string();
    }
    if job.project_id.is_empty() {
        job.project_id = project_id.to_string();
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::test_support::MemoryDocs;
    use serde_json::json;

    fn job(id: &str, asset_id: &str, created_at: &str, hash: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            asset_id: asset_id.to_string(),
            status: JobStatus::Processing,
            config: json!({"outputFormat": "mp4", "hash": hash})
                .as_object()
                .unwrap()
                .clone(),
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
            user_id: "u1".to_string(),
            project_id: "p1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_get_update() {
        let repo = JobRepo::new(Arc::new(MemoryDocs::new()), TRANSCODE_JOBS);
        repo.save(&job("j1", "a1", "2024-01-01T00:00:00Z", "hash1"))
            .await
            .unwrap();

        let fetched = repo.get("u1", "p1", "j1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Processing);

        repo.update("u1", "p1", "j1", json!({"status": "completed"}))
            .await
            .unwrap();
        let fetched = repo.get("u1", "p1", "j1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert!(fetched.updated_at > fetched.created_at);
    }

    #[tokio::test]
    async fn latest_job_wins() {
        let repo = JobRepo::new(Arc::new(MemoryDocs::new()), TRANSCODE_JOBS);
        repo.save(&job("j1", "a1", "2024-01-01T00:00:00Z", "hash1"))
            .await
            .unwrap();
        repo.save(&job("j2", "a1", "2024-01-02T00:00:00Z", "hash1"))
            .await
            .unwrap();
        repo.save(&job("j3", "other", "2024-01-03T00:00:00Z", "hash1"))
            .await
            .unwrap();

        let latest = repo
            .find_latest_for_asset("u1", "p1", "a1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "j2");
    }

    #[tokio::test]
    async fn hash_filter_skips_other_configs() {
        let repo = JobRepo::new(Arc::new(MemoryDocs::new()), TRANSCODE_JOBS);
        repo.save(&job("j1", "a1", "2024-01-01T00:00:00Z", "hash1"))
            .await
            .unwrap();
        repo.save(&job("j2", "a1", "2024-01-02T00:00:00Z", "hash2"))
            .await
            .unwrap();

        let by_hash = repo
            .find_latest_for_asset("u1", "p1", "a1", Some("hash1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.id, "j1");

        assert!(repo
            .find_latest_for_asset("u1", "p1", "a1", Some("missing"))
            .await
            .unwrap()
            .is_none());
    }
}
