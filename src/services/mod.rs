pub mod analyzer;
pub mod coordinator;
pub mod job_table;
pub mod queue;
pub mod results;
pub mod storage;
pub mod sweeper;
pub mod worker;

use uuid::Uuid;

use crate::error::PipelineError;

/// Client-supplied ids that do not parse cannot name a job.
pub(crate) fn parse_job_id(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw.trim()).map_err(|_| PipelineError::JobNotFound(raw.to_string()))
}
