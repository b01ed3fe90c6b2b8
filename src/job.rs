//! Discovery job state machine.
//!
//! ```text
//! PENDING ──▶ RUNNING ──▶ SUCCEEDED
//!                  └────▶ FAILED
//! ```
//!
//! SUCCEEDED and FAILED are terminal. Status only ever moves forward; the
//! store enforces this with compare-and-set updates.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::embedding::truncate_chars;

/// Longest error message stored on a failed job.
pub const MAX_ERROR_CHARS: usize = 500;

/// Number of progress steps reported for one run.
pub const TOTAL_STEPS: i64 = 10;

/// A pipeline stage as reported in job progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub step: i64,
    pub label: &'static str,
}

pub const FRAGMENTING: Stage = Stage {
    step: 1,
    label: "fragmenting",
};
pub const EMBEDDING: Stage = Stage {
    step: 2,
    label: "embedding",
};
pub const CLUSTERING: Stage = Stage {
    step: 3,
    label: "clustering",
};
pub const LABELING: Stage = Stage {
    step: 4,
    label: "labeling",
};
pub const INSIGHTS: Stage = Stage {
    step: 5,
    label: "insights",
};
pub const SCORING: Stage = Stage {
    step: 6,
    label: "scoring",
};
pub const RELATIONSHIPS: Stage = Stage {
    step: 7,
    label: "relationships",
};
pub const COMMITTING: Stage = Stage {
    step: 8,
    label: "committing",
};
pub const DONE: Stage = Stage {
    step: TOTAL_STEPS,
    label: "done",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => anyhow::bail!("Unknown job status: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryJob {
    pub id: i64,
    pub collection_id: i64,
    pub status: JobStatus,
    pub progress_step: i64,
    pub progress_total: i64,
    pub progress_label: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Errors callers are expected to match on.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Collection {collection_id} already has an active discovery job ({job_id})")]
    ActiveJobExists { collection_id: i64, job_id: i64 },

    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Discovery job not found: {0}")]
    JobNotFound(i64),

    #[error("Collection not found: {0}")]
    CollectionNotFound(i64),
}

/// Error text as stored on a FAILED job.
pub fn truncate_error(message: &str) -> String {
    truncate_chars(message.trim(), MAX_ERROR_CHARS).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    #[test]
    fn test_allowed_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_terminal_states_never_move() {
        for from in [JobStatus::Succeeded, JobStatus::Failed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_status_names_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_truncate_error() {
        let long = "é".repeat(MAX_ERROR_CHARS + 20);
        assert_eq!(truncate_error(&long).chars().count(), MAX_ERROR_CHARS);
        assert_eq!(truncate_error("  short "), "short");
    }

    #[test]
    fn test_stage_steps_increase() {
        let stages = [
            FRAGMENTING,
            EMBEDDING,
            CLUSTERING,
            LABELING,
            INSIGHTS,
            SCORING,
            RELATIONSHIPS,
            COMMITTING,
            DONE,
        ];
        assert!(stages.windows(2).all(|w| w[0].step < w[1].step));
        assert_eq!(DONE.step, TOTAL_STEPS);
    }

    #[test]
    fn test_error_messages() {
        let e = DiscoveryError::InvalidTransition {
            from: JobStatus::Succeeded,
            to: JobStatus::Running,
        };
        assert_eq!(e.to_string(), "Invalid job transition SUCCEEDED -> RUNNING");
    }
}
