use shared::{domain::UserId, error::ChatError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(
        "received event for user with id {received} while the configured user has id {configured:?}"
    )]
    IdentityMismatch {
        received: UserId,
        configured: Option<UserId>,
    },
    #[error("no current user id configured")]
    MissingCurrentUser,
    #[error("offline storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error("history sync failed: {0}")]
    History(#[from] ChatError),
    #[error("batch was cancelled before it completed")]
    Cancelled,
}

impl HandlerError {
    /// Errors that end processing of the batch at the point they are raised.
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(
            self,
            HandlerError::IdentityMismatch { .. } | HandlerError::MissingCurrentUser
        )
    }
}

pub(crate) fn ensure_same_user(
    received: &UserId,
    configured: Option<&UserId>,
) -> Result<(), HandlerError> {
    if configured == Some(received) {
        Ok(())
    } else {
        Err(HandlerError::IdentityMismatch {
            received: received.clone(),
            configured: configured.cloned(),
        })
    }
}
