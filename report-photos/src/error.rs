use crate::model::PhotoId;
use crate::state::InvalidTransition;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("no authenticated session; sign in to upload photos")]
    SessionMissing,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upload cancelled")]
    Cancelled,
    #[error("server rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("gave up after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
    #[error("photo `{0}` not found")]
    PhotoNotFound(PhotoId),
    #[error("photo `{0}` is currently uploading; cancel it first")]
    Busy(PhotoId),
    #[error("photo `{0}` has no failed upload to retry; select the file again")]
    NothingToRetry(PhotoId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl PipelineError {
    /// Failures the retry policy may requeue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(_) | PipelineError::Rejected { .. }
        )
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => PipelineError::Rejected {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => PipelineError::Transport(err.to_string()),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
