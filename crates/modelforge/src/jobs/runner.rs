use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::pipeline::{JobContext, Stage, StageFailure, StageResult};
use super::retry::RetryPolicy;
use super::store::JobStore;

/// Executes a single stage, applying the retry policy.
///
/// Retry counting and backoff are stage-local: a failure on stage three
/// retries stage three only, never the whole pipeline. The final failure,
/// once the budget is exhausted, is what propagates upward.
pub struct StageRunner {
    store: Arc<JobStore>,
    policy: RetryPolicy,
}

impl StageRunner {
    pub fn new(store: Arc<JobStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn run(&self, id: Uuid, stage: &Stage) -> StageResult {
        let max_retries = match self.store.get(id).await {
            Some(job) => job.max_retries,
            None => return Err(StageFailure::new(format!("job {} not found", id))),
        };
        let max_attempts = max_retries.saturating_add(1);
        let ctx = JobContext::new(self.store.clone(), id);

        let mut attempt = 1u32;
        loop {
            let _ = self
                .store
                .update(id, |j| {
                    j.attempts = attempt;
                    j.log(format!(
                        "Attempt {} of {} for stage '{}'",
                        attempt, max_attempts, stage.name
                    ));
                })
                .await;

            match stage.func.run(&ctx).await {
                Ok(artifacts) => return Ok(artifacts),
                Err(failure) => {
                    warn!(
                        "Stage '{}' of job {} failed on attempt {}: {}",
                        stage.name, id, attempt, failure
                    );
                    let message = failure.message.clone();
                    let _ = self
                        .store
                        .update(id, |j| {
                            j.error = Some(message.clone());
                            j.log(format!("Stage '{}' failed: {}", stage.name, message));
                        })
                        .await;

                    if !self.policy.allows_retry(attempt, max_retries) {
                        return Err(failure);
                    }

                    let delay = self.policy.backoff_for(attempt);
                    debug!(
                        "Retrying stage '{}' of job {} in {:?}",
                        stage.name, id, delay
                    );
                    let _ = self
                        .store
                        .update(id, |j| {
                            j.log(format!("Retrying stage '{}' in {:?}", stage.name, delay))
                        })
                        .await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
