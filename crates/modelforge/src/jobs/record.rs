use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::MAX_LOG_LINES;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Status of a job. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Durable record of one orchestration request.
///
/// Exactly one execution context mutates a record at a time; all mutation
/// happens under the owning store's write guard so persistence stays in step
/// with in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: String,
    pub status: JobStatus,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Attempts made for the stage currently executing; reset per stage.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl JobRecord {
    /// Create a fresh `Queued` record. The retry budget is taken from the
    /// `max_retries` parameter when present; values beyond `u32::MAX`
    /// saturate rather than wrap.
    pub fn new(kind: impl Into<String>, params: HashMap<String, serde_json::Value>) -> Self {
        let max_retries = params
            .get("max_retries")
            .and_then(serde_json::Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(DEFAULT_MAX_RETRIES);

        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            status: JobStatus::Queued,
            params,
            attempts: 0,
            max_retries,
            logs: Vec::new(),
            artifacts: HashMap::new(),
            error: None,
            progress: 0,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    /// Append a timestamped log line, evicting the oldest lines once the
    /// window exceeds [`MAX_LOG_LINES`].
    pub fn log(&mut self, msg: impl AsRef<str>) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.logs.push(format!("[{}] {}", ts, msg.as_ref()));
        if self.logs.len() > MAX_LOG_LINES {
            let excess = self.logs.len() - MAX_LOG_LINES;
            self.logs.drain(..excess);
        }
    }

    /// Raise progress to `progress`, clamped to 100. Progress never
    /// decreases.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn add_artifact(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.artifacts.insert(name.into(), value.into());
    }

    /// Transition `Queued -> Running`, stamping `start_time` once.
    pub fn mark_running(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Running;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
    }

    /// Terminal success transition.
    pub fn complete(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Completed;
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    /// Terminal failure transition; records the failure message.
    pub fn fail(&mut self, msg: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let msg = msg.into();
        self.log(format!("Job failed: {}", msg));
        self.error = Some(msg);
        self.status = JobStatus::Failed;
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with_retries(n: u64) -> HashMap<String, serde_json::Value> {
        let mut params = HashMap::new();
        params.insert("max_retries".to_string(), serde_json::json!(n));
        params
    }

    #[test]
    fn test_new_record_defaults() {
        let record = JobRecord::new("fine-tune", HashMap::new());
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(record.progress, 0);
        assert!(record.start_time.is_none());
        assert!(record.end_time.is_none());
    }

    #[test]
    fn test_max_retries_from_params() {
        let record = JobRecord::new("fine-tune", params_with_retries(7));
        assert_eq!(record.max_retries, 7);
    }

    #[test]
    fn test_max_retries_saturates_at_u32_max() {
        let record = JobRecord::new("fine-tune", params_with_retries(u64::MAX));
        assert_eq!(record.max_retries, u32::MAX);
        // A budget that still fits is taken as-is.
        let record = JobRecord::new("fine-tune", params_with_retries(u64::from(u32::MAX)));
        assert_eq!(record.max_retries, u32::MAX);
    }

    #[test]
    fn test_log_window_evicts_oldest() {
        let mut record = JobRecord::new("fine-tune", HashMap::new());
        for i in 0..MAX_LOG_LINES + 100 {
            record.log(format!("line {}", i));
        }
        assert_eq!(record.logs.len(), MAX_LOG_LINES);
        assert!(record.logs[0].ends_with("line 100"));
        assert!(record.logs.last().unwrap().ends_with(&format!(
            "line {}",
            MAX_LOG_LINES + 99
        )));
    }

    #[test]
    fn test_progress_is_monotone_and_capped() {
        let mut record = JobRecord::new("fine-tune", HashMap::new());
        record.set_progress(60);
        record.set_progress(40);
        assert_eq!(record.progress, 60);
        record.set_progress(200);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut record = JobRecord::new("fine-tune", HashMap::new());
        record.mark_running();
        assert_eq!(record.status, JobStatus::Running);
        record.fail("boom");
        assert_eq!(record.status, JobStatus::Failed);
        let end = record.end_time;

        record.complete();
        record.mark_running();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.end_time, end);
    }

    #[test]
    fn test_start_time_set_once() {
        let mut record = JobRecord::new("fine-tune", HashMap::new());
        record.mark_running();
        let start = record.start_time;
        assert!(start.is_some());
        record.mark_running();
        assert_eq!(record.start_time, start);
    }
}
