//! Error taxonomy for the outbound workers.
//!
//! Transient failures (peer unreachable, store contention) leave the work
//! item queued for a later pass. Permanent failures end the item's
//! lifecycle; dependent resources are cleaned up and the failure is not
//! retried.

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(anyhow::Error),
    #[error("permanent delivery failure: {0}")]
    Permanent(anyhow::Error),
}

impl DeliveryError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// Store contention and connection trouble are retriable by nature.
impl From<sqlx::Error> for DeliveryError {
    fn from(error: sqlx::Error) -> Self {
        Self::Transient(error.into())
    }
}
