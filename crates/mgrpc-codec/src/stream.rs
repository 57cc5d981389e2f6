//! Framing layer shared by byte-stream transports (serial, TCP).
//!
//! A frame on the wire is the JSON payload wrapped in `"""` sentinels,
//! optionally followed (inside the sentinels) by an 8-digit lowercase hex
//! CRC32 of the payload, and terminated by a newline:
//!
//! ```text
//! """{"id":123,"method":"Sys.GetInfo"}deadbeef"""\n
//! ```
//!
//! Receiving is lenient: a frame without a trailing checksum is accepted
//! even when this side sends checksums. Bytes outside the sentinels are
//! not discarded silently. Newline-terminated lines are first offered to
//! the transport's [`StreamTransport::preprocess`] hook (serial handshake
//! and flow control live there), and anything left over goes to the junk
//! handler so console output sharing the line stays visible.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, JunkHandler, Options};
use crate::error::{CodecError, Result};

/// Sentinel wrapping each frame payload.
pub const FRAME_DELIMITER: &[u8] = b"\"\"\"";
/// Terminates each outbound frame, and by itself acknowledges a handshake.
pub const FRAME_TERMINATOR: &[u8] = b"\n";
/// Marks a link-level end-of-file inside a handshake sequence.
pub const EOF_CHAR: u8 = 0x04;

const READ_CHUNK_SIZE: usize = 4096;

/// The byte-stream carrier under a [`StreamCodec`].
///
/// `read`/`write_all` move raw bytes; `preprocess` lets the transport
/// intercept control chunks (handshake, flow control) before the framing
/// layer tries to parse them as JSON.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Reads some bytes. Returns [`CodecError::Eof`] on a genuine
    /// end-of-stream; transports that produce spurious EOFs (serial)
    /// filter them here.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole buffer, honoring any transport pacing (chunked
    /// serial writes, flow control).
    async fn write_all(&self, ctx: &CancellationToken, buf: &[u8]) -> Result<()>;

    /// Releases the underlying connection. Called once, after the codec
    /// is already marked closed.
    async fn shutdown(&self);

    /// Inspects a chunk extracted from the byte stream before JSON
    /// parsing. Returns true when the chunk was control traffic and has
    /// been consumed.
    async fn preprocess(&self, chunk: &[u8]) -> Result<bool>;

    fn remote_addr(&self) -> String;

    fn set_options(&self, opts: &Options) -> Result<()>;

    fn is_tls(&self) -> bool {
        false
    }
}

/// Frame codec over any [`StreamTransport`].
pub struct StreamCodec<T: StreamTransport> {
    inner: Arc<T>,
    add_checksum: bool,
    junk_handler: Option<JunkHandler>,
    rbuf: Mutex<BytesMut>,
    wlock: Mutex<()>,
    closer: Closer,
}

impl<T: StreamTransport> StreamCodec<T> {
    pub fn new(inner: T, add_checksum: bool, junk_handler: Option<JunkHandler>) -> Self {
        StreamCodec {
            inner: Arc::new(inner),
            add_checksum,
            junk_handler,
            rbuf: Mutex::new(BytesMut::with_capacity(READ_CHUNK_SIZE)),
            wlock: Mutex::new(()),
            closer: Closer::new(),
        }
    }

    fn junk(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(h) = &self.junk_handler {
            h(data);
        } else {
            debug!(bytes = data.len(), "discarding non-frame data");
        }
    }

    /// Pulls the next complete chunk out of `buf`, consuming control
    /// lines and junk along the way. Returns `None` when more bytes are
    /// needed.
    async fn extract_frame(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            if buf.is_empty() {
                return Ok(None);
            }
            let delim = find(buf, FRAME_DELIMITER);

            if delim == Some(0) {
                // Inside a frame: wait for the closing sentinel.
                let Some(end) = find(&buf[FRAME_DELIMITER.len()..], FRAME_DELIMITER) else {
                    return Ok(None);
                };
                let start = FRAME_DELIMITER.len();
                let chunk = buf[start..start + end].to_vec();
                let mut consumed = start + end + FRAME_DELIMITER.len();
                // Swallow the frame terminator, if it has arrived.
                if buf.get(consumed) == Some(&b'\r') {
                    consumed += 1;
                }
                if buf.get(consumed) == Some(&b'\n') {
                    consumed += 1;
                }
                let _ = buf.split_to(consumed);

                if self.inner.preprocess(&chunk).await? {
                    continue;
                }
                match decode_payload(&chunk) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed frame");
                        self.junk(&chunk);
                        continue;
                    }
                }
            }

            let newline = find(buf, b"\n");
            match (newline, delim) {
                // A line terminated before any frame starts: control
                // traffic or junk.
                (Some(n), d) if d.map_or(true, |d| n < d) => {
                    let line = buf.split_to(n + 1);
                    let line = &line[..n];
                    if !self.inner.preprocess(line).await? {
                        self.junk(line);
                    }
                }
                // Unterminated bytes before a frame start: junk.
                (_, Some(d)) => {
                    let prefix = buf.split_to(d);
                    self.junk(&prefix);
                }
                // No frame, no complete line: wait for more bytes.
                (None, None) => return Ok(None),
                (Some(_), None) => unreachable!("covered by the first arm"),
            }
        }
    }
}

#[async_trait]
impl<T: StreamTransport> Codec for StreamCodec<T> {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        let mut buf = self.rbuf.lock().await;
        loop {
            if let Some(frame) = self.extract_frame(&mut buf).await? {
                return Ok(frame);
            }
            if self.closer.is_closed() {
                return Err(CodecError::Closed);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = self.closer.notify().cancelled_owned() => return Err(CodecError::Closed),
                r = self.inner.read(&mut chunk) => match r {
                    Ok(n) => n,
                    Err(e) => {
                        if e.is_eof() {
                            self.close();
                        }
                        return Err(e);
                    }
                },
            };
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(CodecError::Closed);
        }
        let wire = encode_payload(frame, self.add_checksum)?;
        let _guard = self.wlock.lock().await;
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Closed),
            r = self.inner.write_all(ctx, &wire) => r,
        }
    }

    fn close(&self) {
        if !self.closer.close() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.shutdown().await;
        });
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
            tls: self.inner.is_tls(),
            remote_addr: self.inner.remote_addr(),
            peer_certificates: Vec::new(),
        }
    }

    fn set_options(&self, opts: &Options) -> Result<()> {
        self.inner.set_options(opts)
    }
}

/// Serializes a frame into its on-the-wire byte form.
pub fn encode_payload(frame: &Frame, add_checksum: bool) -> Result<Vec<u8>> {
    let json = frame.to_json()?;
    let mut wire =
        Vec::with_capacity(json.len() + 2 * FRAME_DELIMITER.len() + if add_checksum { 9 } else { 1 });
    wire.extend_from_slice(FRAME_DELIMITER);
    wire.extend_from_slice(&json);
    if add_checksum {
        let crc = crc32fast::hash(&json);
        wire.extend_from_slice(format!("{crc:08x}").as_bytes());
    }
    wire.extend_from_slice(FRAME_DELIMITER);
    wire.extend_from_slice(FRAME_TERMINATOR);
    Ok(wire)
}

/// Parses a chunk extracted from between sentinels, verifying and
/// stripping a trailing checksum when one is present.
pub fn decode_payload(chunk: &[u8]) -> Result<Frame> {
    let payload = strip_checksum(chunk)?;
    Ok(Frame::from_json(payload)?)
}

fn strip_checksum(chunk: &[u8]) -> Result<&[u8]> {
    // JSON frames are objects, so a payload always ends in '}'. Eight
    // trailing hex digits after a '}' can only be a checksum.
    if chunk.len() > 8 && chunk[chunk.len() - 9] == b'}' {
        let (payload, tail) = chunk.split_at(chunk.len() - 8);
        if tail.iter().all(|b| b.is_ascii_hexdigit()) {
            let want = u32::from_str_radix(std::str::from_utf8(tail).unwrap_or(""), 16)
                .map_err(|_| CodecError::Fatal("unparseable checksum".into()))?;
            let got = crc32fast::hash(payload);
            if got != want {
                return Err(CodecError::Fatal(format!(
                    "frame checksum mismatch: want {want:08x}, got {got:08x}"
                )));
            }
            return Ok(payload);
        }
    }
    Ok(chunk)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Scripted transport: hands out pre-canned read chunks and records
    /// writes and preprocessed control chunks.
    struct ScriptedTransport {
        reads: StdMutex<VecDeque<Vec<u8>>>,
        writes: StdMutex<Vec<Vec<u8>>>,
        control: StdMutex<Vec<Vec<u8>>>,
        consume_control: bool,
    }

    impl ScriptedTransport {
        fn new(reads: Vec<&[u8]>, consume_control: bool) -> Self {
            ScriptedTransport {
                reads: StdMutex::new(reads.into_iter().map(|r| r.to_vec()).collect()),
                writes: StdMutex::new(Vec::new()),
                control: StdMutex::new(Vec::new()),
                consume_control,
            }
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let chunk = self.reads.lock().expect("reads lock").pop_front();
            match chunk {
                Some(c) => {
                    buf[..c.len()].copy_from_slice(&c);
                    Ok(c.len())
                }
                None => Err(CodecError::Eof),
            }
        }

        async fn write_all(&self, _ctx: &CancellationToken, buf: &[u8]) -> Result<()> {
            self.writes.lock().expect("writes lock").push(buf.to_vec());
            Ok(())
        }

        async fn shutdown(&self) {}

        async fn preprocess(&self, chunk: &[u8]) -> Result<bool> {
            if self.consume_control && (chunk.is_empty() || chunk == [EOF_CHAR] || chunk == b"\r") {
                self.control
                    .lock()
                    .expect("control lock")
                    .push(chunk.to_vec());
                return Ok(true);
            }
            Ok(false)
        }

        fn remote_addr(&self) -> String {
            "scripted".to_string()
        }

        fn set_options(&self, _opts: &Options) -> Result<()> {
            Err(CodecError::NotImplemented("set_options"))
        }
    }

    fn request_frame() -> Frame {
        Frame {
            id: 77,
            method: "Sys.GetInfo".to_string(),
            ..Frame::default()
        }
    }

    #[test]
    fn encode_without_checksum() {
        let wire = encode_payload(&request_frame(), false).expect("encode");
        assert_eq!(wire, b"\"\"\"{\"id\":77,\"method\":\"Sys.GetInfo\"}\"\"\"\n");
    }

    #[test]
    fn encode_with_checksum_appends_eight_hex_digits() {
        let wire = encode_payload(&request_frame(), true).expect("encode");
        let plain = encode_payload(&request_frame(), false).expect("encode");
        assert_eq!(wire.len(), plain.len() + 8);
        let tail = &wire[wire.len() - 12..wire.len() - 4];
        assert!(tail.iter().all(|b| b.is_ascii_hexdigit()));
        // The checksummed form must still decode.
        let chunk = &wire[3..wire.len() - 4];
        let frame = decode_payload(chunk).expect("decode");
        assert_eq!(frame.id, 77);
    }

    #[test]
    fn decode_rejects_corrupt_checksum() {
        let payload = b"{\"id\":77,\"method\":\"Sys.GetInfo\"}";
        let crc = crc32fast::hash(payload) ^ 1;
        let mut chunk = payload.to_vec();
        chunk.extend_from_slice(format!("{crc:08x}").as_bytes());
        let err = decode_payload(&chunk).expect_err("corrupt checksum must fail");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn decode_accepts_unchecksummed_payload() {
        let frame = decode_payload(b"{\"id\":5,\"method\":\"X\"}").expect("decode");
        assert_eq!(frame.id, 5);
        assert_eq!(frame.method, "X");
    }

    #[tokio::test]
    async fn recv_reassembles_frame_split_across_reads() {
        let t = ScriptedTransport::new(
            vec![b"\"\"\"{\"id\":9,\"met", b"hod\":\"A.B\"}\"\"\"\n"],
            false,
        );
        let codec = StreamCodec::new(t, false, None);
        let ctx = CancellationToken::new();
        let frame = codec.recv(&ctx).await.expect("recv");
        assert_eq!(frame.id, 9);
        assert_eq!(frame.method, "A.B");
    }

    #[tokio::test]
    async fn recv_skips_junk_lines_and_counts_them() {
        let junk_seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&junk_seen);
        let handler: JunkHandler = Arc::new(move |data: &[u8]| {
            sink.lock().expect("junk lock").push(data.to_vec());
        });
        let t = ScriptedTransport::new(
            vec![b"boot: hello\n\"\"\"{\"id\":1,\"method\":\"M\"}\"\"\"\n"],
            false,
        );
        let codec = StreamCodec::new(t, false, Some(handler));
        let ctx = CancellationToken::new();
        let frame = codec.recv(&ctx).await.expect("recv");
        assert_eq!(frame.id, 1);
        let seen = junk_seen.lock().expect("junk lock");
        assert_eq!(seen.as_slice(), &[b"boot: hello".to_vec()]);
    }

    #[tokio::test]
    async fn recv_routes_control_chunks_to_preprocess() {
        // An empty sentinel-wrapped chunk and an EOF-char chunk are
        // handshake traffic, not frames.
        let t = ScriptedTransport::new(
            vec![b"\"\"\"\"\"\"\n\"\"\"\x04\"\"\"\n\"\"\"{\"id\":3,\"method\":\"M\"}\"\"\"\n"],
            true,
        );
        let codec = StreamCodec::new(t, false, None);
        let inner = Arc::clone(&codec.inner);
        let ctx = CancellationToken::new();
        let frame = codec.recv(&ctx).await.expect("recv");
        assert_eq!(frame.id, 3);
        let control = inner.control.lock().expect("control lock");
        assert_eq!(control.len(), 2);
        assert!(control[0].is_empty());
        assert_eq!(control[1], vec![EOF_CHAR]);
    }

    #[tokio::test]
    async fn recv_returns_eof_and_closes_when_stream_ends() {
        let t = ScriptedTransport::new(vec![], false);
        let codec = StreamCodec::new(t, false, None);
        let ctx = CancellationToken::new();
        let err = codec.recv(&ctx).await.expect_err("must hit EOF");
        assert!(err.is_eof());
        assert!(codec.close_notify().is_cancelled());
    }

    #[tokio::test]
    async fn send_writes_framed_payload() {
        let t = ScriptedTransport::new(vec![], false);
        let codec = StreamCodec::new(t, false, None);
        let inner = Arc::clone(&codec.inner);
        let ctx = CancellationToken::new();
        codec.send(&ctx, &request_frame()).await.expect("send");
        let writes = inner.writes.lock().expect("writes lock");
        assert_eq!(writes.len(), 1);
        assert!(writes[0].starts_with(FRAME_DELIMITER));
        assert!(writes[0].ends_with(b"\"\"\"\n"));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let t = ScriptedTransport::new(vec![], false);
        let codec = StreamCodec::new(t, false, None);
        codec.close();
        let ctx = CancellationToken::new();
        let err = codec
            .send(&ctx, &request_frame())
            .await
            .expect_err("send after close");
        assert!(matches!(err, CodecError::Closed));
    }
}
