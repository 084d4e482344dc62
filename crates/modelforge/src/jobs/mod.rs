pub mod error;
pub mod manager;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod runner;
pub mod store;

pub use error::JobError;
pub use manager::{JobManager, JobStatusView};
pub use pipeline::{JobContext, PipelineExecutor, Stage, StageFailure, StageFn, StageResult};
pub use record::{JobRecord, JobStatus};
pub use retry::RetryPolicy;
pub use runner::StageRunner;
pub use store::{JobStore, JobSummary};
