use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LOG_TAIL_LINES;

use super::error::JobError;
use super::pipeline::{PipelineExecutor, Stage};
use super::record::{JobRecord, JobStatus};
use super::retry::RetryPolicy;
use super::store::{JobStore, JobSummary};

/// Status view returned to pollers: the only error channel a submitter has
/// after submission succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub kind: String,
    pub status: JobStatus,
    pub progress: u8,
    pub logs_tail: Vec<String>,
    pub artifacts: HashMap<String, String>,
    pub error: Option<String>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        let skip = record.logs.len().saturating_sub(LOG_TAIL_LINES);
        Self {
            id: record.id,
            kind: record.kind.clone(),
            status: record.status,
            progress: record.progress,
            logs_tail: record.logs[skip..].to_vec(),
            artifacts: record.artifacts.clone(),
            error: record.error.clone(),
        }
    }
}

/// Public entry point of the engine.
///
/// Owns an injected [`JobStore`] (no process-wide registry) and spawns one
/// detached tokio task per submitted job. Join handles are retained only
/// while the job runs (each task removes its own entry when it finishes) so
/// the process can wait for in-flight jobs during shutdown; there is no
/// cancellation API, a dispatched job runs to its natural end.
pub struct JobManager {
    store: Arc<JobStore>,
    policy: RetryPolicy,
    running: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl JobManager {
    /// Build a manager over `store`, reloading persisted state first so no
    /// client ever observes a phantom `running` job from a previous process.
    pub async fn new(store: Arc<JobStore>) -> Result<Arc<Self>, JobError> {
        Self::with_policy(store, RetryPolicy::default()).await
    }

    pub async fn with_policy(
        store: Arc<JobStore>,
        policy: RetryPolicy,
    ) -> Result<Arc<Self>, JobError> {
        store.load_on_startup().await?;
        Ok(Arc::new(Self {
            store,
            policy,
            running: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Submit a pipeline for execution. Returns as soon as the record is
    /// created and the job task is dispatched; completion is observed by
    /// polling [`JobManager::status`].
    pub async fn submit(
        &self,
        kind: &str,
        params: HashMap<String, serde_json::Value>,
        stages: Vec<Stage>,
    ) -> Result<Uuid, JobError> {
        validate_params(&params)?;

        let record = self.store.create(kind, params).await;
        let id = record.id;
        info!("Submitted job {} ({})", id, kind);

        let executor = PipelineExecutor::new(self.store.clone(), self.policy.clone());
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            executor.execute(id, &stages).await;
            running.lock().await.remove(&id);
        });
        let mut running = self.running.lock().await;
        // A task that finished before its handle landed here leaves a dead
        // entry; sweep those so the map tracks in-flight jobs only.
        running.retain(|_, handle| !handle.is_finished());
        running.insert(id, handle);

        Ok(id)
    }

    /// Number of jobs whose execution context is still in flight.
    pub async fn running_tasks(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn status(&self, id: Uuid) -> Result<JobStatusView, JobError> {
        self.store
            .get(id)
            .await
            .map(|record| JobStatusView::from(&record))
            .ok_or(JobError::NotFound(id))
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        self.store.list().await
    }

    /// Wait for one job's execution context to finish. A no-op for jobs
    /// already reaped; `NotFound` for ids that were never submitted.
    pub async fn wait(&self, id: Uuid) -> Result<(), JobError> {
        let handle = self.running.lock().await.remove(&id);
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!("Job task {} aborted: {}", id, e);
                }
                Ok(())
            }
            None => {
                self.store.get(id).await.ok_or(JobError::NotFound(id))?;
                Ok(())
            }
        }
    }

    /// Drain every retained join handle; used at shutdown.
    pub async fn wait_all(&self) {
        let handles: Vec<(Uuid, JoinHandle<()>)> =
            self.running.lock().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                warn!("Job task {} aborted: {}", id, e);
            }
        }
    }
}

fn validate_params(params: &HashMap<String, serde_json::Value>) -> Result<(), JobError> {
    if let Some(value) = params.get("max_retries") {
        if value.as_u64().is_none() {
            return Err(JobError::InvalidParams(format!(
                "max_retries must be a non-negative integer, got {}",
                value
            )));
        }
    }
    Ok(())
}
