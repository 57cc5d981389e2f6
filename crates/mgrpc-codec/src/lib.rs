//! Transport codecs for the mgRPC device protocol.
//!
//! Every transport implements the same [`Codec`] contract: receive a
//! [`Frame`](mgrpc_frame::Frame), send a frame, close exactly once, and
//! report connection metadata. Callers hold an `Arc<dyn Codec>` and never
//! care whether the other end is a serial port, a TCP socket, a WebSocket,
//! an MQTT broker or a cloud device-management REST facade.
//!
//! Byte-stream transports (serial, TCP) share the framing layer in
//! [`stream`]; everything else maps frames onto its carrier's native
//! message unit. [`connect`](connect::connect) is the scheme-dispatching
//! factory, and [`reconnect`] wraps any stream codec with automatic
//! re-dial.

pub mod azdm;
pub mod codec;
pub mod connect;
pub mod error;
pub mod gcp;
pub mod http;
pub mod mqtt;
pub mod reconnect;
pub mod serial;
pub mod stream;
pub mod tcp;
pub mod udp;
pub mod watson;
pub mod ws;

pub use codec::{
    Closer, Codec, ConnectionInfo, CredsCallback, JunkHandler, Options, TokenSource,
};
pub use connect::{connect, ConnectOptions};
pub use error::{CodecError, Result};
