//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use studio_core::{JobId, JobRecord, JobStatus, StatusCounts, now};

use super::{
    JobListing, JobPatch, JobStore, StoreError, clamp_limit, effective_filter, terminal_only,
};

/// Non-durable store with the same semantics as [`super::SqliteJobStore`].
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }
}

fn count(jobs: &HashMap<JobId, JobRecord>) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for job in jobs.values() {
        counts.add(job.status, 1);
    }
    counts
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&record.job_id) {
            return Err(StoreError::AlreadyExists(record.job_id));
        }
        jobs.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<JobRecord, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        // Patch a copy so a rejected patch leaves the stored record untouched.
        let mut next = job.clone();
        patch.apply(&mut next, now())?;
        *job = next.clone();
        Ok(next)
    }

    async fn get(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        let jobs = self.read()?;
        jobs.get(&job_id).cloned().ok_or(StoreError::NotFound(job_id))
    }

    async fn list(
        &self,
        statuses: Option<&[JobStatus]>,
        limit: usize,
    ) -> Result<JobListing, StoreError> {
        let jobs = self.read()?;
        let filter = effective_filter(statuses);
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| filter.is_none_or(|s| s.contains(&j.status)))
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        result.truncate(clamp_limit(limit));

        Ok(JobListing {
            jobs: result,
            counts: count(&jobs),
        })
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let jobs = self.read()?;
        Ok(count(&jobs))
    }

    async fn delete_where(&self, statuses: &[JobStatus]) -> Result<u64, StoreError> {
        let targets = terminal_only(statuses);
        if targets.is_empty() {
            return Ok(0);
        }
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !targets.contains(&j.status));
        Ok((before - jobs.len()) as u64)
    }

    async fn ids_with_status(&self, status: JobStatus) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<_> = jobs.values().filter(|j| j.status == status).collect();
        matching.sort_by_key(|j| (j.created_at, j.job_id));
        Ok(matching.into_iter().map(|j| j.job_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(kind: &str) -> JobRecord {
        JobRecord::queued(kind, serde_json::json!({}), None)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = InMemoryJobStore::new();
        let record = job("test");
        store.create(&record).await.unwrap();

        let err = store.create(&record).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(record.job_id));
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        let err = store.update(id, JobPatch::start()).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
        assert_eq!(store.get(id).await.unwrap_err(), StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn rejected_patch_leaves_record_untouched() {
        let store = InMemoryJobStore::new();
        let record = job("test");
        store.create(&record).await.unwrap();

        assert!(store.update(record.job_id, JobPatch::fail("x")).await.is_err());
        assert_eq!(store.get(record.job_id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn list_filters_but_counts_everything() {
        let store = InMemoryJobStore::new();
        let a = job("a");
        let b = job("b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.update(a.job_id, JobPatch::start()).await.unwrap();

        let listing = store.list(Some(&[JobStatus::Running][..]), 10).await.unwrap();
        assert_eq!(listing.jobs.len(), 1);
        assert_eq!(listing.jobs[0].job_id, a.job_id);
        assert_eq!(listing.counts.running, 1);
        assert_eq!(listing.counts.queued, 1);

        let everything = store.list(Some(&[][..]), 10).await.unwrap();
        assert_eq!(everything.jobs.len(), 2);
        // Most recently updated first.
        assert_eq!(everything.jobs[0].job_id, a.job_id);
    }

    #[tokio::test]
    async fn delete_where_never_touches_active_jobs() {
        let store = InMemoryJobStore::new();
        let done = job("done");
        let waiting = job("waiting");
        store.create(&done).await.unwrap();
        store.create(&waiting).await.unwrap();
        store.update(done.job_id, JobPatch::start()).await.unwrap();
        store
            .update(done.job_id, JobPatch::complete(serde_json::json!({})))
            .await
            .unwrap();

        let removed = store.delete_where(&JobStatus::ALL).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(waiting.job_id).await.is_ok());
        assert_eq!(store.delete_where(&[JobStatus::Queued]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ids_with_status_is_oldest_first() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = job(&format!("k{i}"));
            ids.push(record.job_id);
            store.create(&record).await.unwrap();
        }
        assert_eq!(store.ids_with_status(JobStatus::Queued).await.unwrap(), ids);
    }
}
