/// Errors reported by transport codecs.
///
/// `Eof` and `Closed` both mean "no more frames on this codec"; callers
/// that only care about that distinction should use [`CodecError::is_eof`].
/// `Fatal` and `Auth` mark conditions reconnection cannot fix.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The remote end closed the connection.
    #[error("end of stream")]
    Eof,

    /// The codec was closed locally.
    #[error("codec is closed")]
    Closed,

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The codec has no established connection to operate on.
    #[error("not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] mgrpc_frame::FrameError),

    #[error("invalid address {addr}: {reason}")]
    Address { addr: String, reason: String },

    #[error("{0} is not supported by this transport")]
    NotImplemented(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("WebSocket error: {0}")]
    Ws(String),

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// An error that retrying the connection cannot fix.
    #[error("fatal connection error: {0}")]
    Fatal(String),
}

impl CodecError {
    /// True for conditions that mean "this codec will produce no more
    /// frames", whether the remote hung up or we closed it ourselves.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Eof | CodecError::Closed)
    }

    /// True for errors a reconnect loop must give up on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Fatal(_) | CodecError::Auth(_))
    }

    pub(crate) fn address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        CodecError::Address {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
