use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::result::ResultSummary;

/// Status of a media analysis job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    PendingUpload,
    Uploaded,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// The only backwards edge is `processing -> queued`, the bounded retry.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (PendingUpload, Uploaded)
                | (Uploaded, Queued)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
        )
    }
}

/// One submitted media asset and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub filename: String,
    pub content_type: String,
    pub input_key: String,
    pub result_key: Option<String>,
    pub summary: Option<ResultSummary>,
    pub error: Option<String>,
    /// Finished processing attempts. Bumped on every exit from `processing`.
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: Uuid,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        input_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::PendingUpload,
            filename: filename.into(),
            content_type: content_type.into(),
            input_key: input_key.into(),
            result_key: None,
            summary: None,
            error: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a transition's effects. Callers check `transition.expected()` first.
    pub fn apply(&mut self, effects: TransitionEffects) {
        self.status = effects.status;
        self.attempt_count += effects.attempt_delta;
        self.result_key = effects.result_key;
        self.summary = effects.summary;
        self.error = effects.error;
        self.updated_at = effects.updated_at;
        if effects.completed_at.is_some() {
            self.completed_at = effects.completed_at;
        }
    }

    /// `result_key` is set iff completed; `error` is set only when failed.
    pub fn satisfies_invariants(&self) -> bool {
        let result_ok = self.result_key.is_some() == (self.status == JobStatus::Completed);
        let error_ok = self.error.is_none() || self.status == JobStatus::Failed;
        result_ok && error_ok && !self.input_key.is_empty() && self.attempt_count >= 0
    }
}

/// A conditional state change. Job tables apply it only while the row is
/// still in `expected()`; otherwise they report a conflict and leave the row
/// untouched.
///
/// Exits from `processing` also carry `attempt`, the row's `attempt_count`
/// when that processing run started. A run the sweeper already recovered has
/// a stale `attempt` and is rejected as superseded.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    MarkUploaded,
    Enqueue,
    StartProcessing,
    Complete {
        attempt: i32,
        result_key: String,
        summary: ResultSummary,
    },
    Retry {
        attempt: i32,
    },
    Fail {
        attempt: i32,
        error: String,
    },
}

/// Column values a transition writes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEffects {
    pub status: JobStatus,
    pub attempt_delta: i32,
    pub result_key: Option<String>,
    pub summary: Option<ResultSummary>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Transition {
    pub fn expected(&self) -> JobStatus {
        match self {
            Transition::MarkUploaded => JobStatus::PendingUpload,
            Transition::Enqueue => JobStatus::Uploaded,
            Transition::StartProcessing => JobStatus::Queued,
            Transition::Complete { .. } | Transition::Retry { .. } | Transition::Fail { .. } => {
                JobStatus::Processing
            }
        }
    }

    /// The `attempt_count` the row must still hold, if any.
    pub fn fence(&self) -> Option<i32> {
        match self {
            Transition::Complete { attempt, .. }
            | Transition::Retry { attempt }
            | Transition::Fail { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            Transition::MarkUploaded => JobStatus::Uploaded,
            Transition::Enqueue | Transition::Retry { .. } => JobStatus::Queued,
            Transition::StartProcessing => JobStatus::Processing,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    pub fn effects(&self, now: DateTime<Utc>) -> TransitionEffects {
        let leaving_processing = self.expected() == JobStatus::Processing;
        let (result_key, summary, error) = match self {
            Transition::Complete {
                result_key,
                summary,
                ..
            } => (Some(result_key.clone()), Some(summary.clone()), None),
            Transition::Fail { error, .. } => (None, None, Some(error.clone())),
            _ => (None, None, None),
        };

        TransitionEffects {
            status: self.target(),
            attempt_delta: i32::from(leaving_processing),
            result_key,
            summary,
            error,
            completed_at: self.target().is_terminal().then_some(now),
            updated_at: now,
        }
    }
}
