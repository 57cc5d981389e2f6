/// Errors that can occur when encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame is not valid JSON or violates the wire schema.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
