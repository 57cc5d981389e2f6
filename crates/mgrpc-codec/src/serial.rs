//! Serial-port transport with XON/XOFF flow control, a delimiter-based
//! handshake, paced chunked writes and pseudo-EOF filtering.
//!
//! The device side of the link only starts talking RPC after a handshake:
//! both sides exchange `"""\x04"""` sequences and newline acknowledgements
//! until each has seen the other. Until then the device may be printing
//! boot output, which the framing layer hands to the junk handler.
//!
//! Serial drivers report an end-of-file after every idle inter-character
//! window, so a single EOF means nothing. Only a rapid burst of EOFs
//! (closer together than half the window) indicates the port is really
//! gone; isolated ones are swallowed.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{JunkHandler, Options};
use crate::error::{CodecError, Result};
use crate::stream::{StreamCodec, StreamTransport, EOF_CHAR, FRAME_DELIMITER, FRAME_TERMINATOR};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Pause writes until XON.
const XOFF: u8 = 0x13;
/// Resume writes.
const XON: u8 = 0x11;

const HANDSHAKE_INTERVAL: Duration = Duration::from_millis(200);
const INTER_CHARACTER_TIMEOUT: Duration = Duration::from_millis(200);
/// Warn about an unanswered handshake every this many attempts.
const HANDSHAKE_WARN_EVERY: u32 = 25;

#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Zero means [`DEFAULT_BAUD_RATE`].
    pub baud_rate: u32,
    pub hardware_flow_control: bool,
    /// When non-zero, writes are split into chunks of this many bytes.
    pub send_chunk_size: usize,
    /// Pause between chunks. A non-zero delay also forces a fresh
    /// handshake before every frame write.
    pub send_chunk_delay: Duration,
    /// Assert DTR/RTS after opening the port.
    pub set_control_lines: bool,
    /// Assert DTR/RTS inverted, for boards with inverted reset wiring.
    pub inverted_control_lines: bool,
}

/// Opens a serial port and wraps it in a frame codec. Checksums are
/// always enabled on serial links.
pub fn serial(
    port_name: &str,
    opts: &SerialOptions,
    junk_handler: Option<JunkHandler>,
) -> Result<StreamCodec<SerialTransport>> {
    let baud = if opts.baud_rate == 0 {
        DEFAULT_BAUD_RATE
    } else {
        opts.baud_rate
    };
    info!(port = %port_name, baud, "opening serial port");

    let builder = tokio_serial::new(port_name, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.hardware_flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });
    let mut port =
        SerialStream::open(&builder).map_err(|e| CodecError::Serial(e.to_string()))?;

    if opts.set_control_lines || opts.inverted_control_lines {
        let level = opts.inverted_control_lines;
        port.write_data_terminal_ready(level)
            .map_err(|e| CodecError::Serial(e.to_string()))?;
        port.write_request_to_send(level)
            .map_err(|e| CodecError::Serial(e.to_string()))?;
    }
    // Stale bytes from before we opened the port are useless.
    let _ = port.clear(ClearBuffer::All);

    let (reader, writer) = tokio::io::split(port);
    let transport = SerialTransport::new(port_name, opts.clone(), Some(reader), Some(writer));
    Ok(StreamCodec::new(transport, true, junk_handler))
}

pub struct SerialTransport {
    port_name: String,
    opts: StdMutex<SerialOptions>,
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    write_lock: Mutex<()>,
    /// Write gate: false after XOFF, true after XON.
    xon: watch::Sender<bool>,
    hands_shaken: AtomicBool,
    hs_counter: AtomicU32,
    last_eof: StdMutex<Option<Instant>>,
}

impl SerialTransport {
    fn new(
        port_name: &str,
        opts: SerialOptions,
        reader: Option<ReadHalf<SerialStream>>,
        writer: Option<WriteHalf<SerialStream>>,
    ) -> Self {
        let (xon, _) = watch::channel(true);
        SerialTransport {
            port_name: port_name.to_string(),
            opts: StdMutex::new(opts),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            write_lock: Mutex::new(()),
            xon,
            hands_shaken: AtomicBool::new(false),
            hs_counter: AtomicU32::new(0),
            last_eof: StdMutex::new(None),
        }
    }

    fn hands_shaken(&self) -> bool {
        self.hands_shaken.load(Ordering::SeqCst)
    }

    fn set_hands_shaken(&self, shaken: bool) {
        let was = self.hands_shaken.swap(shaken, Ordering::SeqCst);
        if shaken && !was {
            info!(port = %self.port_name, "handshake complete");
        }
        if !shaken {
            self.hs_counter.store(0, Ordering::SeqCst);
        }
    }

    /// Decides whether a driver-level EOF is the idle-line artifact or a
    /// dead port. Isolated EOFs are swallowed; only EOFs arriving closer
    /// together than half the inter-character window propagate.
    fn filter_eof(&self) -> Result<usize> {
        let now = Instant::now();
        let mut last = self.last_eof.lock().expect("last_eof lock");
        let rapid = last
            .map_or(false, |prev| now.duration_since(prev) < INTER_CHARACTER_TIMEOUT / 2);
        *last = Some(now);
        if rapid {
            Err(CodecError::Eof)
        } else {
            debug!(port = %self.port_name, "swallowing idle-line EOF");
            Ok(0)
        }
    }

    /// Strips XON/XOFF bytes out of inbound data, toggling the write
    /// gate. Returns the compacted length.
    fn strip_flow_control(&self, data: &mut [u8]) -> usize {
        let mut kept = 0;
        for i in 0..data.len() {
            let b = data[i];
            match b {
                XOFF => {
                    debug!(port = %self.port_name, "XOFF: pausing writes");
                    self.xon.send_replace(false);
                }
                XON => {
                    debug!(port = %self.port_name, "XON: resuming writes");
                    self.xon.send_replace(true);
                }
                _ => {
                    data[kept] = b;
                    kept += 1;
                }
            }
        }
        kept
    }

    /// Repeats the handshake sequence until the peer acknowledges. The
    /// flag is flipped by the read side (see `preprocess`).
    async fn ensure_handshake(&self, ctx: &CancellationToken) -> Result<()> {
        if self.hands_shaken() {
            return Ok(());
        }
        let hs: Vec<u8> = [FRAME_DELIMITER, &[EOF_CHAR], FRAME_DELIMITER, b"\n", b"\n"].concat();
        let mut attempts = 0u32;
        while !self.hands_shaken() {
            // XOFF state from a previous session means nothing yet.
            self.xon.send_replace(true);
            debug!(port = %self.port_name, "sending handshake");
            self.raw_write(&hs).await?;
            tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = tokio::time::sleep(HANDSHAKE_INTERVAL) => {}
            }
            attempts += 1;
            if attempts % HANDSHAKE_WARN_EVERY == 0 {
                warn!(
                    port = %self.port_name,
                    attempts,
                    "no response to handshake; check the port and that RPC over UART is enabled"
                );
            }
        }
        Ok(())
    }

    /// Writes respecting the XON/XOFF gate.
    async fn write_gated(&self, ctx: &CancellationToken, data: &[u8]) -> Result<()> {
        let mut gate = self.xon.subscribe();
        tokio::select! {
            _ = ctx.cancelled() => return Err(CodecError::Cancelled),
            r = gate.wait_for(|open| *open) => {
                r.map_err(|_| CodecError::Closed)?;
            }
        }
        self.raw_write(data).await
    }

    /// Writes bypassing the gate. Handshake traffic must go out even
    /// while the peer has us paused.
    async fn raw_write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(w) = guard.as_mut() else {
            debug!(port = %self.port_name, "write after close dropped");
            return Ok(());
        };
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for SerialTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.reader.lock().await;
        let r = guard.as_mut().ok_or(CodecError::Closed)?;
        match r.read(buf).await {
            Ok(0) => self.filter_eof(),
            Ok(n) => Ok(self.strip_flow_control(&mut buf[..n])),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof || e.kind() == ErrorKind::BrokenPipe => {
                self.filter_eof()
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, ctx: &CancellationToken, buf: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let (chunk_size, chunk_delay) = {
            let o = self.opts.lock().expect("opts lock");
            (o.send_chunk_size, o.send_chunk_delay)
        };
        // Paced writes are used on links that drop bytes under load;
        // there the peer may also have rebooted between frames, so sync
        // up from scratch every time.
        if !chunk_delay.is_zero() {
            self.set_hands_shaken(false);
        }
        self.ensure_handshake(ctx).await?;

        if chunk_size == 0 {
            return self.write_gated(ctx, buf).await;
        }
        for chunk in buf.chunks(chunk_size) {
            self.write_gated(ctx, chunk).await?;
            tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = tokio::time::sleep(chunk_delay) => {}
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        info!(port = %self.port_name, "serial port closed");
    }

    async fn preprocess(&self, chunk: &[u8]) -> Result<bool> {
        // Empty chunks and bare carriage returns are the peer's newline
        // acknowledgements; two of them mean it has seen our handshake.
        if chunk.is_empty() || chunk == b"\r" {
            if !self.hands_shaken() {
                let acks = self.hs_counter.fetch_add(1, Ordering::SeqCst) + 1;
                if acks >= 2 {
                    self.set_hands_shaken(true);
                }
                self.raw_write(FRAME_TERMINATOR).await?;
            }
            return Ok(true);
        }
        // A lone EOF char between sentinels is the peer's handshake.
        if chunk == [EOF_CHAR] {
            if !self.hands_shaken() {
                self.set_hands_shaken(true);
                self.raw_write(FRAME_DELIMITER).await?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn remote_addr(&self) -> String {
        self.port_name.clone()
    }

    fn set_options(&self, opts: &Options) -> Result<()> {
        *self.opts.lock().expect("opts lock") = opts.serial.clone();
        Ok(())
    }
}
