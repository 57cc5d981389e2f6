//! Wire data model for the mgRPC device protocol.
//!
//! A [`Frame`] is the single message type that crosses every transport:
//! either a request (`method` set) or a response (`result` or `error` set),
//! carried as a JSON object with short field names fixed by the device
//! firmware contract.

pub mod error;
pub mod frame;

pub use error::{FrameError, Result};
pub use frame::{
    create_call_id, Frame, Request, Response, RpcError, AUTO_ID_PREFIX, FRAME_STRINGIFY_LIMIT,
};
