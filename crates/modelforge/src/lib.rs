//! Orchestration engine for long-running, multi-stage model pipelines.
//!
//! A submitted job runs a pipeline of stages (fine-tune, resize, quantize,
//! export, manifest, publish) on its own tokio task. Job state is kept in a
//! [`jobs::JobStore`] and persisted to disk on every observable change so
//! that a process restart never loses or resurrects work.

pub mod config;
pub mod jobs;
pub mod pipelines;

pub use jobs::{
    JobError, JobManager, JobRecord, JobStatus, JobStatusView, JobStore, JobSummary, RetryPolicy,
    Stage, StageFailure, StageFn, StageResult,
};
