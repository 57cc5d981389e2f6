use std::fmt;
use std::io;

use mgrpc_codec::CodecError;
use mgrpc_session::SessionError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn codec_error(context: &str, err: CodecError) -> CliError {
    match err {
        CodecError::Io(source) => io_error(context, source),
        CodecError::Frame(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        CodecError::Address { .. } | CodecError::NotImplemented(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        CodecError::Auth(_) => CliError::new(PERMISSION_DENIED, format!("{context}: {err}")),
        CodecError::Eof
        | CodecError::Closed
        | CodecError::NotConnected
        | CodecError::Http(_)
        | CodecError::HttpStatus(_)
        | CodecError::Mqtt(_)
        | CodecError::Ws(_)
        | CodecError::Serial(_)
        | CodecError::Fatal(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        CodecError::Cancelled => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Codec(err) => codec_error(context, err),
        SessionError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SessionError::Disconnected => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}
