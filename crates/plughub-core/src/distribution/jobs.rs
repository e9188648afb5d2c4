//! Background upload/delete jobs.
//!
//! Artifact mutations can take a while (a git clone and push each), so the HTTP
//! layer submits them here and reports a job id instead of holding the request.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use super::{validate_key, ArtifactStore};
use crate::error::DistributionError;

const MAX_FINISHED_JOBS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Upload,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactJob {
    pub id: Uuid,
    pub key: String,
    pub kind: JobKind,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Called once a job reaches a final state.
pub type JobHook = Arc<dyn Fn(&ArtifactJob) + Send + Sync>;

#[derive(Clone)]
pub struct ArtifactJobs {
    store: Arc<dyn ArtifactStore>,
    jobs: Arc<DashMap<Uuid, ArtifactJob>>,
    timeout: Duration,
    on_finished: Option<JobHook>,
}

impl ArtifactJobs {
    pub fn new(store: Arc<dyn ArtifactStore>, timeout: Duration) -> Self {
        Self {
            store,
            jobs: Arc::new(DashMap::new()),
            timeout,
            on_finished: None,
        }
    }

    pub fn with_hook(mut self, hook: JobHook) -> Self {
        self.on_finished = Some(hook);
        self
    }

    pub fn store(&self) -> Arc<dyn ArtifactStore> {
        self.store.clone()
    }

    /// Queue an upload. The key is checked now; invalid keys never become jobs.
    pub fn submit_upload(&self, key: &str, data: Bytes) -> Result<ArtifactJob, DistributionError> {
        validate_key(key)?;
        let job = self.create(key, JobKind::Upload);

        let store = self.store.clone();
        let owned_key = key.to_string();
        self.spawn(job.id, async move {
            store.upload_file(&owned_key, data).await?;
            store.get_file_url(&owned_key).map(Some)
        });
        Ok(job)
    }

    pub fn submit_delete(&self, key: &str) -> Result<ArtifactJob, DistributionError> {
        validate_key(key)?;
        let job = self.create(key, JobKind::Delete);

        let store = self.store.clone();
        let owned_key = key.to_string();
        self.spawn(job.id, async move {
            store.delete_file(&owned_key).await?;
            Ok(None)
        });
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Option<ArtifactJob> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    /// All known jobs, newest first.
    pub fn list(&self) -> Vec<ArtifactJob> {
        let mut jobs: Vec<ArtifactJob> = self.jobs.iter().map(|job| job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Poll until the job finishes or `limit` elapses.
    pub async fn wait(&self, id: Uuid, limit: Duration) -> Option<ArtifactJob> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let job = self.get(id)?;
            if job.state.is_finished() || tokio::time::Instant::now() >= deadline {
                return Some(job);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn create(&self, key: &str, kind: JobKind) -> ArtifactJob {
        self.prune();
        let job = ArtifactJob {
            id: Uuid::new_v4(),
            key: key.to_string(),
            kind,
            state: JobState::Pending,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn spawn<F>(&self, id: Uuid, work: F)
    where
        F: std::future::Future<Output = Result<Option<String>, DistributionError>> + Send + 'static,
    {
        let jobs = self.jobs.clone();
        let timeout = self.timeout;
        let hook = self.on_finished.clone();

        tokio::spawn(async move {
            if let Some(mut job) = jobs.get_mut(&id) {
                job.state = JobState::Running;
            }

            let state = match tokio::time::timeout(timeout, work).await {
                Ok(Ok(url)) => JobState::Succeeded { url },
                Ok(Err(err)) => JobState::Failed {
                    error: err.to_string(),
                },
                Err(_) => JobState::Failed {
                    error: DistributionError::Timeout {
                        operation: "artifact job".to_string(),
                        secs: timeout.as_secs(),
                    }
                    .to_string(),
                },
            };

            let Some(mut job) = jobs.get(&id).map(|job| job.clone()) else {
                return;
            };
            job.state = state;
            job.finished_at = Some(Utc::now());

            match &job.state {
                JobState::Failed { error } => {
                    tracing::warn!(job_id = %job.id, key = %job.key, kind = ?job.kind, error = %error, "Artifact job failed")
                }
                _ => tracing::info!(job_id = %job.id, key = %job.key, kind = ?job.kind, "Artifact job finished"),
            }
            // Hook side effects land before waiters observe the finished state.
            if let Some(hook) = hook {
                hook(&job);
            }
            jobs.insert(id, job);
        });
    }

    /// Drop the oldest finished jobs beyond the retention limit.
    fn prune(&self) {
        let mut finished: Vec<(Uuid, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|job| job.state.is_finished())
            .map(|job| (job.id, job.created_at))
            .collect();
        if finished.len() <= MAX_FINISHED_JOBS {
            return;
        }
        finished.sort_by_key(|(_, created)| *created);
        let excess = finished.len() - MAX_FINISHED_JOBS;
        for (id, _) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::LocalArtifactStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn jobs_in(dir: &std::path::Path) -> ArtifactJobs {
        let store = LocalArtifactStore::new(
            dir.to_path_buf(),
            Some("https://cdn.example.com/".to_string()),
        )
        .expect("store");
        ArtifactJobs::new(Arc::new(store), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn upload_job_reports_url() {
        let dir = tempdir().expect("tempdir");
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let jobs = jobs_in(dir.path()).with_hook(Arc::new(move |_job: &ArtifactJob| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let job = jobs
            .submit_upload("monitor.tar.gz", Bytes::from_static(b"archive"))
            .expect("submit");
        let done = jobs
            .wait(job.id, Duration::from_secs(5))
            .await
            .expect("job exists");

        assert_eq!(
            done.state,
            JobState::Succeeded {
                url: Some("https://cdn.example.com/monitor/monitor.tar.gz".to_string())
            }
        );
        assert!(done.finished_at.is_some());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(jobs.list().len(), 1);
    }

    #[tokio::test]
    async fn failed_delete_is_reported() {
        let dir = tempdir().expect("tempdir");
        let jobs = jobs_in(dir.path());

        let job = jobs.submit_delete("missing.tar.gz").expect("submit");
        let done = jobs
            .wait(job.id, Duration::from_secs(5))
            .await
            .expect("job exists");
        match done.state {
            JobState::Failed { error } => assert!(error.contains("not found"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_key_is_rejected_synchronously() {
        let dir = tempdir().expect("tempdir");
        let jobs = jobs_in(dir.path());

        let err = jobs
            .submit_upload("../escape.tar.gz", Bytes::from_static(b"x"))
            .expect_err("rejected");
        assert!(err.is_invalid_key());
        assert!(jobs.list().is_empty());
    }
}
