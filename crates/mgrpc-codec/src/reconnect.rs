//! Reconnect wrapper: keeps a codec alive across transport drops.
//!
//! A background task owns the dial loop. `send`/`recv` wait for a live
//! inner codec, retry once across a reconnect when the inner codec hits
//! end-of-stream, and propagate everything else untouched. Attempts are
//! paced a fixed two seconds apart. A fatal dial error (an endpoint that
//! exists but rejects the protocol, or bad credentials) stops the loop
//! and surfaces to every waiting caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, Options};
use crate::error::{CodecError, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Dials one fresh inner codec.
pub type ConnectFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Codec>>> + Send + Sync>;

#[derive(Clone)]
enum ConnState {
    Disconnected,
    Connected(Arc<dyn Codec>),
    Failed(String),
}

pub struct ReconnectWrapperCodec {
    addr: String,
    state: watch::Sender<ConnState>,
    closer: Closer,
}

/// Wraps `connect` in a self-healing codec for diagnostics address `addr`.
pub fn reconnect_wrapper(addr: &str, connect: ConnectFn) -> Arc<ReconnectWrapperCodec> {
    let (state, _) = watch::channel(ConnState::Disconnected);
    let wrapper = Arc::new(ReconnectWrapperCodec {
        addr: addr.to_string(),
        state,
        closer: Closer::new(),
    });
    {
        let addr = wrapper.addr.clone();
        let state = wrapper.state.clone();
        let closer = wrapper.closer.clone();
        tokio::spawn(async move {
            maintain_connection(addr, connect, state, closer).await;
        });
    }
    wrapper
}

async fn maintain_connection(
    addr: String,
    connect: ConnectFn,
    state: watch::Sender<ConnState>,
    closer: Closer,
) {
    let mut next_attempt = Instant::now();
    loop {
        tokio::select! {
            _ = closer.notify().cancelled_owned() => return,
            _ = tokio::time::sleep_until(next_attempt) => {}
        }
        debug!(addr = %addr, "connecting");
        next_attempt = Instant::now() + RECONNECT_DELAY;
        match connect().await {
            Ok(conn) => {
                info!(addr = %addr, "connected");
                let died = conn.close_notify();
                // send_replace: the transition must land even while
                // nobody is subscribed yet.
                state.send_replace(ConnState::Connected(Arc::clone(&conn)));
                tokio::select! {
                    _ = closer.notify().cancelled_owned() => {
                        conn.close();
                        return;
                    }
                    _ = died.cancelled() => {
                        if !closer.is_closed() {
                            warn!(addr = %addr, "connection lost");
                        }
                        state.send_replace(ConnState::Disconnected);
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                error!(addr = %addr, error = %e, "giving up on connection");
                state.send_replace(ConnState::Failed(e.to_string()));
                return;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "connection attempt failed");
            }
        }
    }
}

impl ReconnectWrapperCodec {
    /// Waits for the maintenance loop to produce a live codec.
    async fn live_conn(&self, ctx: &CancellationToken) -> Result<Arc<dyn Codec>> {
        let mut rx = self.state.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                ConnState::Connected(conn) => return Ok(conn),
                ConnState::Failed(msg) => return Err(CodecError::Fatal(msg)),
                ConnState::Disconnected => {}
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = self.closer.notify().cancelled_owned() => return Err(CodecError::Closed),
                r = rx.changed() => {
                    r.map_err(|_| CodecError::Closed)?;
                }
            }
        }
    }

    /// Retires a connection that misbehaved; the maintenance loop will
    /// notice its close notification and redial.
    fn drop_conn(&self, conn: &Arc<dyn Codec>) {
        conn.close();
        self.state.send_if_modified(|s| {
            if matches!(s, ConnState::Connected(_)) {
                *s = ConnState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl Codec for ReconnectWrapperCodec {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        let mut retried = false;
        loop {
            let conn = self.live_conn(ctx).await?;
            match conn.recv(ctx).await {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_eof() && !retried && !self.closer.is_closed() => {
                    retried = true;
                    self.drop_conn(&conn);
                }
                Err(e) => {
                    if e.is_eof() {
                        self.drop_conn(&conn);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        let mut retried = false;
        loop {
            let conn = self.live_conn(ctx).await?;
            match conn.send(ctx, frame).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_eof() && !retried && !self.closer.is_closed() => {
                    retried = true;
                    self.drop_conn(&conn);
                }
                Err(e) => {
                    if matches!(e, CodecError::Io(_)) || e.is_eof() {
                        self.drop_conn(&conn);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn close(&self) {
        if !self.closer.close() {
            return;
        }
        if let ConnState::Connected(conn) = self.state.borrow().clone() {
            conn.close();
        }
    }

    fn close_notify(&self) -> CancellationToken {
        self.closer.notify()
    }

    fn max_num_frames(&self) -> i32 {
        -1
    }

    fn info(&self) -> ConnectionInfo {
        match self.state.borrow().clone() {
            ConnState::Connected(conn) => conn.info(),
            _ => ConnectionInfo {
                is_connected: false,
                tls: false,
                remote_addr: self.addr.clone(),
                peer_certificates: Vec::new(),
            },
        }
    }

    fn set_options(&self, opts: &Options) -> Result<()> {
        match self.state.borrow().clone() {
            ConnState::Connected(conn) => conn.set_options(opts),
            _ => Err(CodecError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Codec fed from a fixed queue; recv past the end is EOF.
    struct FakeCodec {
        frames: StdMutex<VecDeque<Frame>>,
        sent: StdMutex<Vec<Frame>>,
        closer: Closer,
    }

    impl FakeCodec {
        fn with_frames(frames: Vec<Frame>) -> Arc<Self> {
            Arc::new(FakeCodec {
                frames: StdMutex::new(frames.into()),
                sent: StdMutex::new(Vec::new()),
                closer: Closer::new(),
            })
        }
    }

    #[async_trait]
    impl Codec for FakeCodec {
        async fn recv(&self, _ctx: &CancellationToken) -> Result<Frame> {
            if self.closer.is_closed() {
                return Err(CodecError::Closed);
            }
            match self.frames.lock().expect("frames lock").pop_front() {
                Some(f) => Ok(f),
                None => {
                    self.close();
                    Err(CodecError::Eof)
                }
            }
        }

        async fn send(&self, _ctx: &CancellationToken, frame: &Frame) -> Result<()> {
            if self.closer.is_closed() {
                return Err(CodecError::Closed);
            }
            self.sent.lock().expect("sent lock").push(frame.clone());
            Ok(())
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
                remote_addr: "fake".to_string(),
                ..ConnectionInfo::default()
            }
        }

        fn set_options(&self, _opts: &Options) -> Result<()> {
            Err(CodecError::NotImplemented("set_options"))
        }
    }

    /// Factory that replays a script of dial outcomes.
    fn scripted_factory(script: Vec<Result<Arc<dyn Codec>>>) -> ConnectFn {
        let script = Arc::new(StdMutex::new(VecDeque::from(script)));
        Arc::new(move || {
            let script = Arc::clone(&script);
            Box::pin(async move {
                script
                    .lock()
                    .expect("script lock")
                    .pop_front()
                    .unwrap_or(Err(CodecError::NotConnected))
            })
        })
    }

    fn frame(id: i64) -> Frame {
        Frame {
            version: 2,
            id,
            ..Frame::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_waits_out_a_failed_attempt() {
        let fake = FakeCodec::with_frames(vec![]);
        let fake_dyn: Arc<dyn Codec> = fake.clone();
        let factory = scripted_factory(vec![
            Err(CodecError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))),
            Ok(fake_dyn),
        ]);
        let wrapper = reconnect_wrapper("tcp://device:1234", factory);
        let ctx = CancellationToken::new();

        wrapper.send(&ctx, &frame(1)).await.expect("send");
        assert_eq!(fake.sent.lock().expect("sent lock").len(), 1);
        wrapper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn state_published_before_any_waiter_is_not_lost() {
        // The dial loop may connect (or fail) before the first caller
        // subscribes to the state channel; the transition must still be
        // there when they arrive.
        let live: Arc<dyn Codec> = FakeCodec::with_frames(vec![frame(3)]);
        let factory = scripted_factory(vec![Ok(live)]);
        let wrapper = reconnect_wrapper("tcp://device:1234", factory);

        // Give the maintenance task time to dial with nobody watching.
        tokio::time::sleep(Duration::from_secs(5)).await;

        let ctx = CancellationToken::new();
        let got = wrapper.recv(&ctx).await.expect("recv");
        assert_eq!(got.id, 3);
        wrapper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_dial_error_reaches_all_waiters() {
        let factory = scripted_factory(vec![Err(CodecError::Fatal("upgrade rejected".into()))]);
        let wrapper = reconnect_wrapper("ws://device/rpc", factory);
        let ctx = CancellationToken::new();

        let w1 = {
            let wrapper = Arc::clone(&wrapper);
            let ctx = ctx.clone();
            tokio::spawn(async move { wrapper.recv(&ctx).await })
        };
        let w2 = {
            let wrapper = Arc::clone(&wrapper);
            let ctx = ctx.clone();
            tokio::spawn(async move { wrapper.recv(&ctx).await })
        };

        for handle in [w1, w2] {
            let err = handle.await.expect("join").expect_err("must fail");
            assert!(matches!(err, CodecError::Fatal(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recv_retries_once_across_a_reconnect() {
        let dead: Arc<dyn Codec> = FakeCodec::with_frames(vec![]);
        let live: Arc<dyn Codec> = FakeCodec::with_frames(vec![frame(7)]);
        let factory = scripted_factory(vec![Ok(dead), Ok(live)]);
        let wrapper = reconnect_wrapper("serial:///dev/ttyUSB0", factory);
        let ctx = CancellationToken::new();

        let got = wrapper.recv(&ctx).await.expect("recv after reconnect");
        assert_eq!(got.id, 7);
        wrapper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn second_eof_propagates() {
        let first: Arc<dyn Codec> = FakeCodec::with_frames(vec![]);
        let second: Arc<dyn Codec> = FakeCodec::with_frames(vec![]);
        let factory = scripted_factory(vec![Ok(first), Ok(second)]);
        let wrapper = reconnect_wrapper("tcp://device:1234", factory);
        let ctx = CancellationToken::new();

        let err = wrapper.recv(&ctx).await.expect_err("two dead codecs");
        assert!(err.is_eof());
        wrapper.close();
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_dial_loop() {
        let factory = scripted_factory(vec![]);
        let wrapper = reconnect_wrapper("tcp://device:1234", factory);
        wrapper.close();
        let ctx = CancellationToken::new();
        let err = wrapper.recv(&ctx).await.expect_err("closed wrapper");
        assert!(matches!(err, CodecError::Closed));
    }
}
