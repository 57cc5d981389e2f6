use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mgrpc_codec::{
    connect, Codec, CodecError, ConnectOptions, ConnectionInfo, CredsCallback, JunkHandler,
    Options,
};
use mgrpc_frame::{create_call_id, Frame, Request, Response};

use crate::error::{Result, SessionError};

/// Error code answered to requests this side has no handler for.
const STATUS_METHOD_NOT_FOUND: i32 = 404;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SessionOptions {
    /// Logical ID stamped as `src` on outgoing frames.
    pub local_id: String,
    /// Pre-shared key stamped on outgoing frames, if the device wants one.
    pub key: String,
    /// Wrap sustained transports in the reconnect layer.
    pub reconnect: bool,
    /// Default per-call timeout; a request's own timeout field wins.
    pub call_timeout: Duration,
    pub junk_handler: Option<JunkHandler>,
    pub codec: Options,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            local_id: "mgrpc".to_string(),
            key: String::new(),
            reconnect: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            junk_handler: None,
            codec: Options::default(),
        }
    }
}

type PendingMap = Arc<StdMutex<HashMap<i64, oneshot::Sender<Frame>>>>;

pub struct Session {
    codec: Arc<dyn Codec>,
    local_id: String,
    key: String,
    call_timeout: Duration,
    pending: PendingMap,
    /// Present on one-frame transports; holds calls to one at a time.
    one_shot: Option<Arc<Semaphore>>,
    stop: CancellationToken,
}

impl Session {
    /// Dials `addr` through the codec factory and starts the dispatcher.
    pub async fn connect(addr: &str, opts: SessionOptions) -> Result<Session> {
        let codec = connect(
            addr,
            &ConnectOptions {
                reconnect: opts.reconnect,
                junk_handler: opts.junk_handler.clone(),
                codec: opts.codec.clone(),
            },
        )
        .await?;
        Ok(Session::over(codec, opts))
    }

    /// Builds a session over an already-open codec.
    pub fn over(codec: Arc<dyn Codec>, opts: SessionOptions) -> Session {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let stop = CancellationToken::new();
        let one_shot = (codec.max_num_frames() == 1).then(|| Arc::new(Semaphore::new(1)));
        {
            let codec = Arc::clone(&codec);
            let pending = Arc::clone(&pending);
            let local_id = opts.local_id.clone();
            let key = opts.key.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                dispatch(codec, pending, local_id, key, stop).await;
            });
        }
        Session {
            codec,
            local_id: opts.local_id,
            key: opts.key,
            call_timeout: opts.call_timeout,
            pending,
            one_shot,
            stop,
        }
    }

    /// Performs one RPC call to `dst`.
    ///
    /// A zero request ID gets a fresh one from the reserved range. For
    /// `no_response` requests the frame is sent and an empty response
    /// returned immediately. `creds` is forwarded to transports that
    /// authenticate on demand.
    pub async fn call(
        &self,
        ctx: &CancellationToken,
        dst: &str,
        req: Request,
        creds: Option<CredsCallback>,
    ) -> Result<Response> {
        if let Some(cb) = creds {
            let opts = Options {
                http: mgrpc_codec::http::HttpOptions {
                    get_creds: Some(cb),
                },
                ..Options::default()
            };
            match self.codec.set_options(&opts) {
                Ok(()) => {}
                Err(CodecError::NotImplemented(_)) | Err(CodecError::NotConnected) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut req = req;
        if req.id == 0 {
            req.id = create_call_id();
        }
        let id = req.id;
        let frame = Frame::new_request(&self.local_id, dst, &self.key, &req);

        let _permit = match &self.one_shot {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| SessionError::Disconnected)?,
            ),
            None => None,
        };

        if req.no_response {
            self.codec.send(ctx, &frame).await?;
            return Ok(Response {
                id,
                ..Response::default()
            });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);
        if let Err(e) = self.codec.send(ctx, &frame).await {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(e.into());
        }

        let timeout = if req.timeout > 0 {
            Duration::from_secs(req.timeout as u64)
        } else {
            self.call_timeout
        };
        let response = tokio::select! {
            _ = ctx.cancelled() => {
                self.pending.lock().expect("pending lock").remove(&id);
                return Err(CodecError::Cancelled.into());
            }
            r = tokio::time::timeout(timeout, rx) => match r {
                Err(_) => {
                    self.pending.lock().expect("pending lock").remove(&id);
                    return Err(SessionError::Timeout(timeout));
                }
                Ok(Err(_)) => return Err(SessionError::Disconnected),
                Ok(Ok(frame)) => frame,
            }
        };
        Ok(Response::from_frame(&response))
    }

    pub fn is_connected(&self) -> bool {
        self.codec.info().is_connected
    }

    pub fn info(&self) -> ConnectionInfo {
        self.codec.info()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Tears the session down: stops the dispatcher, closes the codec
    /// and fails every waiting call.
    pub fn disconnect(&self) {
        self.stop.cancel();
        self.codec.close();
        self.pending.lock().expect("pending lock").clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn dispatch(
    codec: Arc<dyn Codec>,
    pending: PendingMap,
    local_id: String,
    key: String,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            r = codec.recv(&stop) => r,
        };
        match frame {
            Ok(f) if f.is_request() => {
                debug!(method = %f.method, src = %f.src, "unsolicited request");
                if !f.no_response {
                    let resp = Frame::new_response(
                        &local_id,
                        &f.src,
                        &key,
                        &Response {
                            id: f.id,
                            status: STATUS_METHOD_NOT_FOUND,
                            status_msg: "method not found".to_string(),
                            response: None,
                        },
                    );
                    if let Err(e) = codec.send(&stop, &resp).await {
                        warn!(error = %e, "failed to answer unsolicited request");
                    }
                }
            }
            Ok(f) => {
                let waiter = pending.lock().expect("pending lock").remove(&f.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(f);
                    }
                    None => debug!(id = f.id, "response for unknown call"),
                }
            }
            Err(CodecError::Cancelled) => break,
            Err(e) if e.is_eof() => {
                // A wrapped codec comes back by itself; a closed codec
                // is the end of the session.
                if codec.close_notify().is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                if codec.close_notify().is_cancelled() {
                    break;
                }
            }
        }
    }
    // Dropping the senders wakes every waiter with `Disconnected`.
    pending.lock().expect("pending lock").clear();
}
