use std::time::Duration;

use mgrpc_codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The session was torn down while the call was waiting.
    #[error("session disconnected")]
    Disconnected,
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
