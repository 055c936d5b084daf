//! Handler error classification.
//!
//! Every job handler reports failure as either `Retry` or `Discard`.
//! Retryable jobs stay on disk and are picked up again on a later
//! scheduler tick; discarded jobs are soft-deleted so a permanently
//! broken input cannot wedge the queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure: leave the job file in place for the next tick.
    #[error("{0}")]
    Retry(eyre::Report),
    /// Permanent failure: remove the job file instead of spinning on it.
    #[error("{0}")]
    Discard(eyre::Report),
}

impl JobError {
    pub fn retry(err: impl Into<eyre::Report>) -> Self {
        Self::Retry(err.into())
    }

    pub fn discard(err: impl Into<eyre::Report>) -> Self {
        Self::Discard(err.into())
    }

    pub fn is_discard(&self) -> bool {
        matches!(self, Self::Discard(_))
    }
}

impl From<eyre::Report> for JobError {
    fn from(err: eyre::Report) -> Self {
        Self::Retry(err)
    }
}

pub type JobResult = std::result::Result<(), JobError>;

/// Collapse a batch of independent failures into one report, so a single
/// bad file does not hide what happened to the rest.
pub fn flatten_errors(errs: Vec<eyre::Report>) -> Result<(), eyre::Report> {
    let mut iter = errs.into_iter();
    let Some(first) = iter.next() else {
        return Ok(());
    };
    let rest: Vec<String> = iter.map(|e| e.to_string()).collect();
    if rest.is_empty() {
        return Err(first);
    }
    Err(eyre::eyre!("{}; {}", first, rest.join("; ")))
}
