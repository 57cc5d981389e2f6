//! Plain TCP transport. The socket is a clean byte pipe, so no
//! checksums, no handshake and no flow control: just the framing layer
//! over a connected stream.

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{JunkHandler, Options};
use crate::error::{CodecError, Result};
use crate::stream::{StreamCodec, StreamTransport};

/// Connects to `addr` (`host:port`) and wraps the socket in a frame codec.
pub async fn tcp(addr: &str, junk_handler: Option<JunkHandler>) -> Result<StreamCodec<TcpTransport>> {
    debug!(addr, "connecting");
    let stream = TcpStream::connect(addr).await?;
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| addr.to_string());
    info!(peer = %peer, "TCP connection established");
    let (reader, writer) = stream.into_split();
    let transport = TcpTransport {
        peer,
        reader: Mutex::new(Some(reader)),
        writer: Mutex::new(Some(writer)),
    };
    Ok(StreamCodec::new(transport, false, junk_handler))
}

pub struct TcpTransport {
    peer: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.reader.lock().await;
        let r = guard.as_mut().ok_or(CodecError::Closed)?;
        match r.read(buf).await? {
            0 => Err(CodecError::Eof),
            n => Ok(n),
        }
    }

    async fn write_all(&self, _ctx: &CancellationToken, buf: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or(CodecError::Closed)?;
        w.write_all(buf).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.reader.lock().await.take();
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        debug!(peer = %self.peer, "TCP connection closed");
    }

    async fn preprocess(&self, _chunk: &[u8]) -> Result<bool> {
        Ok(false)
    }

    fn remote_addr(&self) -> String {
        self.peer.clone()
    }

    fn set_options(&self, _opts: &Options) -> Result<()> {
        Err(CodecError::NotImplemented("set_options"))
    }
}
