//! MQTT transport. The broker's topics replace addressing: by default a
//! request for device `D` is published to `D/rpc`, and before the first
//! send the codec subscribes to its own response topic so the device
//! knows where to answer. Subscriptions are made lazily and cached.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Packet, QoS, Transport};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, Options};
use crate::error::{CodecError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct MqttOptions {
    pub user: String,
    pub password: String,
    /// Broker client ID. A random one is generated when empty.
    pub client_id: String,
    /// Publish every frame to this fixed topic instead of `<dst>/rpc`.
    pub pub_topic: String,
    /// Listen on this fixed topic instead of a per-destination response
    /// topic derived at send time.
    pub sub_topic: String,
    /// Logical source ID stamped on outgoing frames.
    pub src: String,
}

/// Derives the frame source and response subscription for a request to
/// `dst` when no fixed subscription topic is configured.
pub(crate) fn response_route(dst: &str, src: &str) -> (String, String) {
    let frame_src = format!("{dst}/rpc-resp/{src}");
    let sub_topic = format!("{frame_src}/rpc");
    (frame_src, sub_topic)
}

/// Connects to an `mqtt://` or `mqtts://` broker. The URL path names the
/// default destination device.
pub async fn mqtt(url: &str, opts: &MqttOptions) -> Result<MqttCodec> {
    let parsed = Url::parse(url).map_err(|e| CodecError::address(url, e.to_string()))?;
    let tls = match parsed.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        other => return Err(CodecError::address(url, format!("bad scheme {other}"))),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| CodecError::address(url, "missing broker host"))?;
    let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });
    let dst_topic = parsed.path().trim_start_matches('/').to_string();

    let client_id = if opts.client_id.is_empty() {
        format!("mgrpc-{:08x}", rand::thread_rng().gen::<u32>())
    } else {
        opts.client_id.clone()
    };
    let user = if parsed.username().is_empty() {
        opts.user.clone()
    } else {
        parsed.username().to_string()
    };
    let password = parsed
        .password()
        .map(str::to_string)
        .unwrap_or_else(|| opts.password.clone());

    let mut mo = rumqttc::MqttOptions::new(&client_id, host, port);
    mo.set_keep_alive(Duration::from_secs(30));
    if !user.is_empty() {
        mo.set_credentials(user, password);
    }
    if tls {
        mo.set_transport(Transport::tls_with_default_config());
    }

    debug!(broker = %host, port, client_id = %client_id, "connecting to MQTT broker");
    let (client, mut eventloop) = AsyncClient::new(mo, EVENT_CHANNEL_CAPACITY);

    // Block until the broker accepts us, so a bad broker address or bad
    // credentials fail the dial instead of the first call.
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(CodecError::Fatal(format!(
                        "MQTT broker refused connection: {:?}",
                        ack.code
                    )));
                }
                break;
            }
            Ok(_) => {}
            Err(e) => return Err(CodecError::Mqtt(e.to_string())),
        }
    }
    info!(broker = %host, "MQTT connected");

    let closer = Closer::new();
    let connected = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    {
        let closer = closer.clone();
        let connected = Arc::clone(&connected);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closer.notify().cancelled_owned() => break,
                    ev = eventloop.poll() => match ev {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            match Frame::from_json(&publish.payload) {
                                Ok(frame) => {
                                    if tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(topic = %publish.topic, error = %e,
                                          "dropping malformed frame");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "MQTT connection lost");
                            connected.store(false, Ordering::SeqCst);
                            closer.close();
                            break;
                        }
                    }
                }
            }
        });
    }

    let codec = MqttCodec {
        url: url.to_string(),
        src: opts.src.clone(),
        dst_topic,
        pub_topic: opts.pub_topic.clone(),
        sub_topic: opts.sub_topic.clone(),
        tls,
        client,
        frames: Mutex::new(rx),
        subs: StdMutex::new(HashSet::new()),
        connected,
        closer,
    };
    if !codec.sub_topic.is_empty() {
        codec.ensure_subscribed(&codec.sub_topic.clone()).await?;
    }
    Ok(codec)
}

pub struct MqttCodec {
    url: String,
    src: String,
    dst_topic: String,
    pub_topic: String,
    sub_topic: String,
    tls: bool,
    client: AsyncClient,
    frames: Mutex<mpsc::Receiver<Frame>>,
    subs: StdMutex<HashSet<String>>,
    connected: Arc<AtomicBool>,
    closer: Closer,
}

impl MqttCodec {
    async fn ensure_subscribed(&self, topic: &str) -> Result<()> {
        if self.subs.lock().expect("subs lock").contains(topic) {
            return Ok(());
        }
        debug!(topic, "subscribing");
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| CodecError::Mqtt(e.to_string()))?;
        self.subs
            .lock()
            .expect("subs lock")
            .insert(topic.to_string());
        Ok(())
    }
}

#[async_trait]
impl Codec for MqttCodec {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        let mut frames = self.frames.lock().await;
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Eof),
            f = frames.recv() => f.ok_or(CodecError::Eof),
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(CodecError::Closed);
        }
        let mut f = frame.clone();
        if f.dst.is_empty() {
            f.dst.clone_from(&self.dst_topic);
        }
        if self.sub_topic.is_empty() {
            // No fixed inbox, so route the response through a topic
            // derived from this exchange and listen there.
            let (frame_src, resp_topic) = response_route(&f.dst, &self.src);
            f.src = frame_src;
            self.ensure_subscribed(&resp_topic).await?;
        } else if f.src.is_empty() {
            f.src.clone_from(&self.src);
        }
        let topic = if self.pub_topic.is_empty() {
            format!("{}/rpc", f.dst)
        } else {
            self.pub_topic.clone()
        };
        let payload = f.to_json()?;
        debug!(topic = %topic, "publishing frame");
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Closed),
            r = self.client.publish(topic, QoS::AtLeastOnce, false, payload) => {
                r.map_err(|e| CodecError::Mqtt(e.to_string()))
            }
        }
    }

    fn close(&self) {
        if !self.closer.close() {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        let client = self.client.clone();
        tokio::spawn(async move {
            let _ = client.disconnect().await;
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
            is_connected: self.connected.load(Ordering::SeqCst) && !self.closer.is_closed(),
            tls: self.tls,
            remote_addr: self.url.clone(),
            peer_certificates: Vec::new(),
        }
    }

    fn set_options(&self, _opts: &Options) -> Result<()> {
        Err(CodecError::NotImplemented("set_options"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_route_derivation() {
        let (frame_src, sub_topic) = response_route("esp32_1234", "mgrpc-ab12");
        assert_eq!(frame_src, "esp32_1234/rpc-resp/mgrpc-ab12");
        assert_eq!(sub_topic, "esp32_1234/rpc-resp/mgrpc-ab12/rpc");
    }
}
