//! RPC session layer: call/response bookkeeping over any transport codec.
//!
//! A [`Session`] owns a codec, runs a background dispatcher that routes
//! inbound response frames to their waiting callers by ID, answers
//! unsolicited requests with a "method not found" error, and enforces
//! per-call timeouts. Many calls can be in flight concurrently on
//! transports that allow it; one-shot transports are serialized.

pub mod error;
pub mod session;

pub use error::{Result, SessionError};
pub use session::{Session, SessionOptions};
