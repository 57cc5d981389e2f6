//! WebSocket transport: the socket's own message framing replaces the
//! stream framer, one text message per frame. A rejected HTTP upgrade is
//! fatal (the endpoint exists but will never speak this protocol), so
//! reconnect loops give up instead of hammering it.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, Options};
use crate::error::{CodecError, Result};

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials a `ws://` or `wss://` URL.
pub async fn websocket(url: &str) -> Result<WsCodec> {
    debug!(url, "dialing WebSocket");
    let (conn, _response) = match connect_async(url).await {
        Ok(ok) => ok,
        // The server answered HTTP but refused the upgrade. Retrying
        // will produce the same answer.
        Err(WsError::Http(resp)) => {
            return Err(CodecError::Fatal(format!(
                "WebSocket upgrade rejected with status {}",
                resp.status()
            )));
        }
        Err(e) => return Err(CodecError::Ws(e.to_string())),
    };
    info!(url, "WebSocket connected");
    let tls = url.starts_with("wss:");
    let (sink, stream) = conn.split();
    Ok(WsCodec {
        url: url.to_string(),
        tls,
        sink: Mutex::new(sink),
        stream: Mutex::new(stream),
        closer: Closer::new(),
    })
}

pub struct WsCodec {
    url: String,
    tls: bool,
    sink: Mutex<SplitSink<WsConn, Message>>,
    stream: Mutex<SplitStream<WsConn>>,
    closer: Closer,
}

#[async_trait]
impl Codec for WsCodec {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        let mut stream = self.stream.lock().await;
        loop {
            if self.closer.is_closed() {
                return Err(CodecError::Closed);
            }
            let msg = tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = self.closer.notify().cancelled_owned() => return Err(CodecError::Closed),
                m = stream.next() => m,
            };
            match msg {
                Some(Ok(Message::Text(text))) => return Ok(Frame::from_json(text.as_bytes())?),
                Some(Ok(Message::Binary(data))) => return Ok(Frame::from_json(&data)?),
                Some(Ok(Message::Close(_))) | None => {
                    self.close();
                    return Err(CodecError::Eof);
                }
                // Keepalive traffic; tungstenite answers pings itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket receive failed, closing");
                    self.close();
                    return Err(CodecError::Eof);
                }
            }
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(CodecError::Closed);
        }
        let payload = frame.to_json()?;
        let text =
            String::from_utf8(payload).map_err(|e| CodecError::Ws(format!("bad payload: {e}")))?;
        let mut sink = self.sink.lock().await;
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Closed),
            r = sink.send(Message::Text(text)) => {
                r.map_err(|e| CodecError::Ws(e.to_string()))
            }
        }
    }

    fn close(&self) {
        if !self.closer.close() {
            return;
        }
        debug!(url = %self.url, "closing WebSocket");
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
            tls: self.tls,
            remote_addr: self.url.clone(),
            peer_certificates: Vec::new(),
        }
    }

    fn set_options(&self, _opts: &Options) -> Result<()> {
        Err(CodecError::NotImplemented("set_options"))
    }
}
