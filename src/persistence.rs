//! Request and finding persistence
//!
//! The relational tables themselves live outside this crate; these traits
//! are the worker's view of them. Requests are advanced in place until they
//! reach a terminal state; findings are append-only.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{AnalysisRequest, Finding};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn load(&self, job_id: Uuid) -> Result<Option<AnalysisRequest>, StoreError>;

    /// Insert or update; terminal records are never mutated again.
    async fn save(&self, request: &AnalysisRequest) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FindingStore: Send + Sync {
    async fn insert_all(&self, findings: &[Finding]) -> Result<(), StoreError>;

    async fn for_request(&self, request_id: Uuid) -> Result<Vec<Finding>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    requests: RwLock<HashMap<Uuid, AnalysisRequest>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn load(&self, job_id: Uuid) -> Result<Option<AnalysisRequest>, StoreError> {
        Ok(self.requests.read().await.get(&job_id).cloned())
    }

    async fn save(&self, request: &AnalysisRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        if let Some(existing) = requests.get(&request.job_id) {
            if existing.status.is_terminal() {
                return Err(StoreError::Backend(format!(
                    "request {} is terminal and immutable",
                    request.job_id
                )));
            }
        }
        requests.insert(request.job_id, request.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFindingStore {
    findings: RwLock<Vec<Finding>>,
}

impl MemoryFindingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FindingStore for MemoryFindingStore {
    async fn insert_all(&self, findings: &[Finding]) -> Result<(), StoreError> {
        self.findings.write().await.extend_from_slice(findings);
        Ok(())
    }

    async fn for_request(&self, request_id: Uuid) -> Result<Vec<Finding>, StoreError> {
        Ok(self
            .findings
            .read()
            .await
            .iter()
            .filter(|f| f.request_id == request_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisJob, JobKind, RepoRef, RequestStatus};

    fn request() -> AnalysisRequest {
        let job = AnalysisJob::new(
            JobKind::FullScan,
            "p1",
            RepoRef {
                url: "https://example.com/r.git".into(),
                branch: "main".into(),
                commit: None,
                pr: None,
            },
        );
        AnalysisRequest::from_job(&job)
    }

    #[tokio::test]
    async fn terminal_requests_are_immutable() {
        let store = MemoryRequestStore::new();
        let mut record = request();
        store.save(&record).await.unwrap();

        record.status = RequestStatus::Completed;
        store.save(&record).await.unwrap();

        record.status = RequestStatus::Processing;
        assert!(store.save(&record).await.is_err());
        let stored = store.load(record.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn findings_are_scoped_to_their_request() {
        let store = MemoryFindingStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .insert_all(&[Finding::raw_fallback(a, "alpha"), Finding::raw_fallback(b, "beta")])
            .await
            .unwrap();
        let for_a = store.for_request(a).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].raw_llm_content.as_deref(), Some("alpha"));
    }
}
