//! The [`Codec`] contract shared by every transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mgrpc_frame::Frame;

use crate::error::Result;

/// Supplies a username/password pair on demand, typically by prompting
/// or reading a credentials file. Used by the outbound HTTP codec when
/// the server answers with a digest challenge.
pub type CredsCallback = Arc<dyn Fn() -> Result<(String, String)> + Send + Sync>;

/// Supplies a bearer token for cloud REST APIs.
pub type TokenSource = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Receives raw bytes the framing layer discarded as non-frame traffic,
/// e.g. boot console output sharing the serial line.
pub type JunkHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A bidirectional frame channel over some transport.
///
/// All methods take `&self`; implementations are internally synchronized
/// and shared as `Arc<dyn Codec>`. `recv` and `send` block until progress
/// is made, the codec is closed, or `ctx` is cancelled.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Receives the next frame. Returns [`CodecError::Eof`] when the
    /// remote end hung up and [`CodecError::Closed`] after a local close.
    ///
    /// [`CodecError::Eof`]: crate::CodecError::Eof
    /// [`CodecError::Closed`]: crate::CodecError::Closed
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame>;

    /// Sends one frame. Concurrent senders are serialized internally.
    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()>;

    /// Closes the codec and releases its transport resources. Idempotent;
    /// only the first call has any effect.
    fn close(&self);

    /// A token cancelled exactly once, when the codec closes (locally or
    /// because the transport died).
    fn close_notify(&self) -> CancellationToken;

    /// How many frames this codec can usefully carry: -1 for unlimited,
    /// 1 for one-shot request/response transports.
    fn max_num_frames(&self) -> i32;

    /// Connection metadata for diagnostics.
    fn info(&self) -> ConnectionInfo;

    /// Adjusts runtime-tunable options. Transports with nothing tunable
    /// return [`CodecError::NotImplemented`].
    ///
    /// [`CodecError::NotImplemented`]: crate::CodecError::NotImplemented
    fn set_options(&self, opts: &Options) -> Result<()>;
}

/// Diagnostic snapshot of a codec's connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub is_connected: bool,
    pub tls: bool,
    pub remote_addr: String,
    /// DER-encoded peer certificates, when the transport exposes them.
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Aggregate of per-transport options. Each codec reads only its own
/// section; the factory passes the whole struct through untouched.
#[derive(Clone, Default)]
pub struct Options {
    pub serial: crate::serial::SerialOptions,
    pub http: crate::http::HttpOptions,
    pub mqtt: crate::mqtt::MqttOptions,
    pub gcp: crate::gcp::GcpOptions,
    pub azdm: crate::azdm::AzureDmOptions,
    pub watson: crate::watson::WatsonOptions,
}

/// One-shot close latch shared by all codecs.
///
/// Pairs an idempotency flag with the [`CancellationToken`] handed out by
/// `close_notify`, so the token is cancelled exactly once no matter how
/// many times `close` runs.
#[derive(Debug, Clone)]
pub struct Closer {
    closed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Closer {
    pub fn new() -> Self {
        Closer {
            closed: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }

    /// Marks the codec closed. Returns true only for the call that
    /// actually performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn notify(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for Closer {
    fn default() -> Self {
        Closer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closer_closes_exactly_once() {
        let closer = Closer::new();
        assert!(!closer.is_closed());
        assert!(!closer.notify().is_cancelled());

        assert!(closer.close(), "first close must win");
        assert!(closer.is_closed());
        assert!(closer.notify().is_cancelled());

        assert!(!closer.close(), "second close must be a no-op");
    }

    #[test]
    fn closer_clones_share_state() {
        let a = Closer::new();
        let b = a.clone();
        a.close();
        assert!(b.is_closed());
        assert!(b.notify().is_cancelled());
    }
}
