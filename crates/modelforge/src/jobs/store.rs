use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::JobError;
use super::record::{JobRecord, JobStatus};

/// Summary view of one job, as returned by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub kind: String,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: String,
    jobs: Vec<serde_json::Value>,
}

/// Authoritative registry of job records with best-effort durability.
///
/// Every mutation funnels through [`JobStore::update`], which persists the
/// full snapshot before releasing the write guard. Writes go to a temporary
/// file followed by an atomic rename, so a crash mid-write never corrupts
/// the previous snapshot. Persistence failures are logged and swallowed:
/// in-memory state stays authoritative and job execution never aborts
/// because disk I/O failed.
pub struct JobStore {
    path: PathBuf,
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate and persist a fresh `Queued` record.
    pub async fn create(
        &self,
        kind: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> JobRecord {
        let record = JobRecord::new(kind, params);
        let mut jobs = self.jobs.write().await;
        jobs.insert(record.id, record.clone());
        self.persist(&jobs);
        record
    }

    pub async fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Summaries of all jobs, newest first.
    pub async fn list(&self) -> Vec<JobSummary> {
        let jobs = self.jobs.read().await;
        let mut records: Vec<&JobRecord> = jobs.values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
            .into_iter()
            .map(|r| JobSummary {
                id: r.id,
                kind: r.kind.clone(),
                status: r.status,
                start_time: r.start_time,
                end_time: r.end_time,
            })
            .collect()
    }

    /// Mutate one record under the write guard and persist the result.
    pub async fn update<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut JobRecord) -> R,
    ) -> Result<R, JobError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        let out = f(record);
        self.persist(&jobs);
        Ok(out)
    }

    /// Load persisted records. Malformed entries are skipped individually;
    /// records left `Running` by a crashed process are reclassified as
    /// `Failed` since they can never be resumed.
    pub async fn load_on_startup(&self) -> Result<(), JobError> {
        if !self.path.exists() {
            return Ok(());
        }
        let data = fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(());
        }

        let file: StoreFile = match serde_json::from_str(&data) {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "Job store at {} is unreadable, starting empty: {}",
                    self.path.display(),
                    e
                );
                return Ok(());
            }
        };

        let mut jobs = self.jobs.write().await;
        let mut recovered = 0usize;
        for raw in file.jobs {
            match serde_json::from_value::<JobRecord>(raw) {
                Ok(mut record) => {
                    if record.status == JobStatus::Running {
                        record.log(
                            "Process restarted while this job was running; it will not be resumed",
                        );
                        record.fail("interrupted by process restart");
                        recovered += 1;
                        warn!("Reclassified orphaned job {} as failed", record.id);
                    }
                    jobs.insert(record.id, record);
                }
                Err(e) => warn!("Skipping malformed job record: {}", e),
            }
        }
        debug!(
            "Loaded {} job(s) from {} ({} orphaned)",
            jobs.len(),
            self.path.display(),
            recovered
        );
        if recovered > 0 {
            self.persist(&jobs);
        }
        Ok(())
    }

    /// Best-effort persistence hook: failures are observable in the logs but
    /// never propagate to callers.
    fn persist(&self, jobs: &HashMap<Uuid, JobRecord>) {
        if let Err(e) = self.write_snapshot(jobs) {
            warn!(
                "Failed to persist job store to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    fn write_snapshot(&self, jobs: &HashMap<Uuid, JobRecord>) -> Result<(), JobError> {
        let mut records: Vec<&JobRecord> = jobs.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let file = StoreFile {
            version: "1".to_string(),
            jobs: records
                .into_iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temporary file first, then rename over the destination.
        let temp_path = self.path.with_extension("tmp");
        let mut out = File::create(&temp_path)?;
        out.write_all(json.as_bytes())?;
        out.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}
