use crate::error::PipelineError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// User abort: back to idle, the attempt is not charged.
    ResetIdle,
    /// Put the task back at the front with the updated attempt count.
    Requeue { attempts: u32, message: String },
    /// Terminal; no further automatic attempts.
    GiveUp { attempts: u32, message: String },
}

/// Immediate retry with a hard cap. No backoff: the one-at-a-time scheduler
/// already throttles retry pressure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// `attempts` is the number of attempts consumed including the one that just failed.
    pub fn decide(&self, error: &PipelineError, attempts: u32) -> RetryDecision {
        if matches!(error, PipelineError::Cancelled) {
            return RetryDecision::ResetIdle;
        }
        let attempts = attempts.min(self.max_attempts);
        if error.is_retryable() && attempts < self.max_attempts {
            RetryDecision::Requeue {
                attempts,
                message: format!("retrying ({}/{})", attempts, self.max_attempts),
            }
        } else if error.is_retryable() {
            RetryDecision::GiveUp {
                attempts,
                message: PipelineError::Exhausted {
                    attempts,
                    message: error.to_string(),
                }
                .to_string(),
            }
        } else {
            RetryDecision::GiveUp {
                attempts,
                message: error.to_string(),
            }
        }
    }
}
