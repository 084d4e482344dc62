use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::retry::RetryPolicy;
use super::runner::StageRunner;
use super::store::JobStore;

/// Failure signalled by a stage function. An explicit result type, not a
/// panic, is the only failure channel the engine understands.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub message: String,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StageFailure {}

/// Artifacts produced by a successful stage, merged into the job record.
pub type StageResult = Result<HashMap<String, String>, StageFailure>;

/// One named unit of pipeline work, treated as an opaque operation.
#[async_trait]
pub trait StageFn: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> StageResult;
}

/// Descriptor for one pipeline step: the stage function, the progress
/// ceiling it accounts for, and an optional trigger parameter that gates
/// whether it runs at all.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub target_progress: u8,
    pub trigger: Option<String>,
    pub func: Arc<dyn StageFn>,
}

impl Stage {
    pub fn new(name: impl Into<String>, target_progress: u8, func: Arc<dyn StageFn>) -> Self {
        Self {
            name: name.into(),
            target_progress,
            trigger: None,
            func,
        }
    }

    /// Mark the stage optional: it runs only when the named parameter is
    /// present and non-empty.
    pub fn optional(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("target_progress", &self.target_progress)
            .field("trigger", &self.trigger)
            .finish()
    }
}

/// Handle given to stage functions: all reads and writes go through the
/// owning store so persistence stays in step with every observable change.
#[derive(Clone)]
pub struct JobContext {
    store: Arc<JobStore>,
    id: Uuid,
}

impl JobContext {
    pub fn new(store: Arc<JobStore>, id: Uuid) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn log(&self, msg: impl AsRef<str>) {
        if let Err(e) = self.store.update(self.id, |j| j.log(msg.as_ref())).await {
            debug!("Dropping log line for job {}: {}", self.id, e);
        }
    }

    pub async fn param(&self, key: &str) -> Option<serde_json::Value> {
        self.store
            .get(self.id)
            .await
            .and_then(|j| j.params.get(key).cloned())
    }

    pub async fn artifact(&self, name: &str) -> Option<String> {
        self.store
            .get(self.id)
            .await
            .and_then(|j| j.artifacts.get(name).cloned())
    }

    pub async fn add_artifact(&self, name: impl Into<String>, value: impl Into<String>) {
        let (name, value) = (name.into(), value.into());
        let _ = self
            .store
            .update(self.id, |j| j.add_artifact(name, value))
            .await;
    }

    pub async fn set_progress(&self, progress: u8) {
        let _ = self
            .store
            .update(self.id, |j| j.set_progress(progress))
            .await;
    }
}

/// A trigger parameter counts as present only when it carries actual
/// configuration: `null`, `false`, empty strings and empty containers all
/// mean "skip the stage".
fn trigger_present(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::Object(o)) => !o.is_empty(),
        Some(serde_json::Value::Number(_)) => true,
    }
}

/// Runs a job's stages strictly in order, propagating artifacts through the
/// shared record and short-circuiting on the first terminal stage failure.
pub struct PipelineExecutor {
    store: Arc<JobStore>,
    runner: StageRunner,
}

impl PipelineExecutor {
    pub fn new(store: Arc<JobStore>, policy: RetryPolicy) -> Self {
        let runner = StageRunner::new(store.clone(), policy);
        Self { store, runner }
    }

    /// Drive the job to a terminal state. Never returns an error: every
    /// failure mode ends up in the job record instead of unwinding out of
    /// the execution context.
    pub async fn execute(&self, id: Uuid, stages: &[Stage]) {
        let started = self
            .store
            .update(id, |j| {
                j.mark_running();
                j.log(format!("Job started: {}", j.kind));
            })
            .await;
        if let Err(e) = started {
            error!("Cannot execute pipeline: {}", e);
            return;
        }

        let ctx = JobContext::new(self.store.clone(), id);
        for stage in stages {
            if let Some(trigger) = &stage.trigger {
                let value = ctx.param(trigger).await;
                if !trigger_present(value.as_ref()) {
                    let _ = self
                        .store
                        .update(id, |j| {
                            j.log(format!("Skipping optional stage '{}'", stage.name))
                        })
                        .await;
                    continue;
                }
            }

            match self.runner.run(id, stage).await {
                Ok(artifacts) => {
                    let _ = self
                        .store
                        .update(id, |j| {
                            for (name, value) in artifacts {
                                j.add_artifact(name, value);
                            }
                            j.error = None;
                            j.set_progress(stage.target_progress);
                            j.log(format!("Stage '{}' completed", stage.name));
                        })
                        .await;
                }
                Err(failure) => {
                    error!("Job {} failed at stage '{}': {}", id, stage.name, failure);
                    let _ = self.store.update(id, |j| j.fail(failure.message)).await;
                    return;
                }
            }
        }

        let _ = self
            .store
            .update(id, |j| {
                j.set_progress(100);
                j.complete();
                j.log("Job completed");
            })
            .await;
        info!("Job {} completed", id);
    }
}
