//! UDP transport: one datagram carries exactly one frame, so the stream
//! framer is not involved at all. There is no connection to lose, but a
//! read error still closes the codec so callers see a definite end.

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, Options};
use crate::error::{CodecError, Result};

const MAX_DATAGRAM_SIZE: usize = 10000;

/// Binds an ephemeral local socket and connects it to `addr` (`host:port`).
pub async fn udp(addr: &str) -> Result<UdpCodec> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| addr.to_string());
    debug!(peer = %peer, "UDP socket ready");
    Ok(UdpCodec {
        socket,
        peer,
        closer: Closer::new(),
    })
}

pub struct UdpCodec {
    socket: UdpSocket,
    peer: String,
    closer: Closer,
}

#[async_trait]
impl Codec for UdpCodec {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        loop {
            if self.closer.is_closed() {
                return Err(CodecError::Closed);
            }
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let n = tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = self.closer.notify().cancelled_owned() => return Err(CodecError::Closed),
                r = self.socket.recv(&mut buf) => match r {
                    Ok(n) => n,
                    Err(e) => {
                        // ICMP port-unreachable and friends surface here.
                        warn!(error = %e, "UDP receive failed, closing");
                        self.close();
                        return Err(CodecError::Eof);
                    }
                },
            };
            match Frame::from_json(&buf[..n]) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    warn!(error = %e, "dropping malformed datagram");
                }
            }
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(CodecError::Closed);
        }
        let payload = frame.to_json()?;
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Closed),
            r = self.socket.send(&payload) => {
                r?;
                Ok(())
            }
        }
    }

    fn close(&self) {
        self.closer.close();
    }

    fn close_notify(&self) -> CancellationToken {
        self.closer.notify()
    }

    fn max_num_frames(&self) -> i32 {
        -1
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            is_connected: !self.closer.is_closed(),
            tls: false,
            remote_addr: self.peer.clone(),
            peer_certificates: Vec::new(),
        }
    }

    fn set_options(&self, _opts: &Options) -> Result<()> {
        Err(CodecError::NotImplemented("set_options"))
    }
}
