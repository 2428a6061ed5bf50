// Shared blocking HTTP plumbing for the embedding and vector store clients


use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Client error: HTTP {0}")]
    Client(u16),
    #[error("Request to {target} failed after {attempts} attempts: {last}")]
    Exhausted {
        target: String,
        attempts: u32,
        last: String,
    },
    #[error("Non-retryable error: {0}")]
    Fatal(String),
}

impl RequestError {
    #[inline]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Client(status) => Some(*status),
            _ => None,
        }
    }
}

/// Build a pooled agent with a global request timeout
#[inline]
pub fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// Rate limiting and server-side failures are worth retrying, other client errors are not
#[inline]
pub const fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run a request, retrying transport failures, 429 and 5xx with exponential backoff
    #[inline]
    pub fn send<F>(&self, target: &str, mut request_fn: F) -> Result<String, RequestError>
    where
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!("HTTP request attempt {}/{} to {}", attempt, attempts, target);

            match request_fn() {
                Ok(response_text) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response_text);
                }
                Err(ureq::Error::StatusCode(status)) if is_retryable_status(status) => {
                    warn!(
                        "Server error (status {}), attempt {}/{}",
                        status, attempt, attempts
                    );
                    last_error = format!("HTTP {}", status);
                }
                Err(ureq::Error::StatusCode(status)) => {
                    warn!("Client error (status {}), not retrying", status);
                    return Err(RequestError::Client(status));
                }
                Err(
                    error @ (ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
                    | ureq::Error::Timeout(_)
                    | ureq::Error::Io(_)),
                ) => {
                    warn!(
                        "Transport error: {}, attempt {}/{}",
                        error, attempt, attempts
                    );
                    last_error = error.to_string();
                }
                Err(error) => {
                    warn!("Non-retryable error: {}", error);
                    return Err(RequestError::Fatal(error.to_string()));
                }
            }

            if attempt < attempts {
                let delay = self.delay_for(attempt);
                debug!("Waiting {:?} before retry", delay);
                std::thread::sleep(delay);
            }
        }

        error!("All retry attempts failed for request to {}", target);

        Err(RequestError::Exhausted {
            target: target.to_string(),
            attempts,
            last: last_error,
        })
    }
}
