//! Google Cloud IoT transport. Commands go to the device through the
//! Cloud IoT REST `sendCommandToDevice` call; responses come back as
//! Pub/Sub messages on a subscription that this codec polls.
//!
//! The Pub/Sub subscription may be shared, so inbound messages are
//! filtered by their device attributes and matched against the set of
//! call IDs this codec has in flight. Responses nobody is waiting for
//! are released back to the subscription, unless they are old enough
//! that their caller is certainly gone, in which case they are
//! acknowledged and dropped so they stop circulating.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, Options, TokenSource};
use crate::error::{CodecError, Result};

const CLOUDIOT_BASE: &str = "https://cloudiot.googleapis.com/v1";
const PUBSUB_BASE: &str = "https://pubsub.googleapis.com/v1";
const PULL_BATCH: u32 = 10;
const PULL_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct GcpOptions {
    /// Create the Pub/Sub topic and subscription if they do not exist.
    pub create_topic: bool,
    /// Unclaimed responses older than this are acknowledged and dropped
    /// instead of being put back on the subscription.
    pub stale_after: Duration,
    /// Bearer-token supplier. Defaults to reading the
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable.
    pub token_source: Option<TokenSource>,
}

impl Default for GcpOptions {
    fn default() -> Self {
        GcpOptions {
            create_topic: false,
            stale_after: Duration::from_secs(60),
            token_source: None,
        }
    }
}

/// Address components of a `gcp://project/region/registry/device` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GcpAddress {
    pub project: String,
    pub region: String,
    pub registry: String,
    pub device: String,
    pub topic: String,
    pub subscription: String,
    pub req_subfolder: String,
    pub resp_subfolder: String,
}

pub(crate) fn parse_address(url: &str) -> Result<GcpAddress> {
    let parsed = Url::parse(url).map_err(|e| CodecError::address(url, e.to_string()))?;
    if parsed.scheme() != "gcp" {
        return Err(CodecError::address(url, "expected gcp:// scheme"));
    }
    let project = parsed
        .host_str()
        .ok_or_else(|| CodecError::address(url, "missing project"))?
        .to_string();
    let segments: Vec<&str> = parsed
        .path()
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let [region, registry, device] = segments.as_slice() else {
        return Err(CodecError::address(
            url,
            "expected gcp://project/region/registry/device",
        ));
    };

    let mut addr = GcpAddress {
        project,
        region: region.to_string(),
        registry: registry.to_string(),
        device: device.to_string(),
        topic: "rpc".to_string(),
        subscription: "rpc".to_string(),
        req_subfolder: "rpc".to_string(),
        resp_subfolder: "rpc".to_string(),
    };
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "topic" => addr.topic = value.into_owned(),
            "sub" => addr.subscription = value.into_owned(),
            "reqsf" => addr.req_subfolder = value.into_owned(),
            "respsf" => addr.resp_subfolder = value.into_owned(),
            _ => {}
        }
    }
    Ok(addr)
}

/// A Pub/Sub message is for this codec iff its attributes name exactly
/// our device and response subfolder.
pub(crate) fn attrs_match(addr: &GcpAddress, attrs: &HashMap<String, String>) -> bool {
    let get = |k: &str| attrs.get(k).map(String::as_str).unwrap_or("");
    get("projectId") == addr.project
        && get("deviceRegistryLocation") == addr.region
        && get("deviceRegistryId") == addr.registry
        && get("deviceId") == addr.device
        && get("subFolder") == addr.resp_subfolder
}

#[derive(Deserialize)]
struct PullResponse {
    #[serde(rename = "receivedMessages", default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "ackId")]
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize)]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(rename = "publishTime", default)]
    publish_time: String,
}

/// Connects the codec: verifies (or creates) the Pub/Sub plumbing and
/// starts the pull loop.
pub async fn gcp(url: &str, opts: &GcpOptions) -> Result<GcpCodec> {
    let addr = parse_address(url)?;
    let token_source: TokenSource = opts.token_source.clone().unwrap_or_else(|| {
        Arc::new(|| {
            std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").map_err(|_| {
                CodecError::Auth(
                    "no GCP token: set GOOGLE_OAUTH_ACCESS_TOKEN or configure a token source"
                        .into(),
                )
            })
        })
    });
    let client = reqwest::Client::new();

    ensure_subscription(&client, &token_source, &addr, opts.create_topic).await?;

    let closer = Closer::new();
    let reqs: Arc<StdMutex<HashSet<i64>>> = Arc::new(StdMutex::new(HashSet::new()));
    let (tx, rx) = mpsc::channel(16);
    {
        let client = client.clone();
        let token_source = token_source.clone();
        let addr = addr.clone();
        let closer = closer.clone();
        let reqs = Arc::clone(&reqs);
        let stale_after = opts.stale_after;
        tokio::spawn(async move {
            pull_loop(client, token_source, addr, reqs, stale_after, tx, closer).await;
        });
    }

    Ok(GcpCodec {
        url: url.to_string(),
        addr,
        client,
        token_source,
        reqs,
        frames: Mutex::new(rx),
        closer,
    })
}

async fn ensure_subscription(
    client: &reqwest::Client,
    token_source: &TokenSource,
    addr: &GcpAddress,
    create: bool,
) -> Result<()> {
    let token = token_source()?;
    let sub_url = format!(
        "{PUBSUB_BASE}/projects/{}/subscriptions/{}",
        addr.project, addr.subscription
    );
    let resp = client.get(&sub_url).bearer_auth(&token).send().await?;
    if resp.status().is_success() {
        return Ok(());
    }
    if resp.status().as_u16() != 404 {
        return Err(CodecError::HttpStatus(resp.status().as_u16()));
    }
    if !create {
        return Err(CodecError::Fatal(format!(
            "Pub/Sub subscription {} does not exist",
            addr.subscription
        )));
    }

    info!(topic = %addr.topic, subscription = %addr.subscription, "creating Pub/Sub plumbing");
    let topic_name = format!("projects/{}/topics/{}", addr.project, addr.topic);
    let resp = client
        .put(format!("{PUBSUB_BASE}/{topic_name}"))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await?;
    // 409: the topic already exists, which is fine.
    if !resp.status().is_success() && resp.status().as_u16() != 409 {
        return Err(CodecError::HttpStatus(resp.status().as_u16()));
    }
    let resp = client
        .put(&sub_url)
        .bearer_auth(&token)
        .json(&json!({
            "topic": topic_name,
            "ackDeadlineSeconds": 10,
            "expirationPolicy": { "ttl": "86400s" },
        }))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(CodecError::HttpStatus(resp.status().as_u16()));
    }
    Ok(())
}

async fn pull_loop(
    client: reqwest::Client,
    token_source: TokenSource,
    addr: GcpAddress,
    reqs: Arc<StdMutex<HashSet<i64>>>,
    stale_after: Duration,
    tx: mpsc::Sender<Frame>,
    closer: Closer,
) {
    let pull_url = format!(
        "{PUBSUB_BASE}/projects/{}/subscriptions/{}:pull",
        addr.project, addr.subscription
    );
    loop {
        let result = tokio::select! {
            _ = closer.notify().cancelled_owned() => return,
            r = pull_once(&client, &token_source, &pull_url) => r,
        };
        let messages = match result {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Pub/Sub pull failed");
                tokio::select! {
                    _ = closer.notify().cancelled_owned() => return,
                    _ = tokio::time::sleep(PULL_RETRY_DELAY) => continue,
                }
            }
        };

        let mut ack_ids = Vec::new();
        let mut nack_ids = Vec::new();
        for msg in messages {
            if !attrs_match(&addr, &msg.message.attributes) {
                nack_ids.push(msg.ack_id);
                continue;
            }
            let data = match base64::engine::general_purpose::STANDARD.decode(&msg.message.data) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "unreadable Pub/Sub payload");
                    ack_ids.push(msg.ack_id);
                    continue;
                }
            };
            let frame = match Frame::from_json(&data) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    ack_ids.push(msg.ack_id);
                    continue;
                }
            };
            let claimed = reqs.lock().expect("reqs lock").remove(&frame.id);
            if claimed {
                ack_ids.push(msg.ack_id);
                if tx.send(frame).await.is_err() {
                    return;
                }
            } else if is_stale(&msg.message.publish_time, stale_after) {
                debug!(id = frame.id, "dropping stale unclaimed response");
                ack_ids.push(msg.ack_id);
            } else {
                // Some other subscriber is probably waiting for it.
                nack_ids.push(msg.ack_id);
            }
        }
        if let Err(e) = settle(&client, &token_source, &addr, &ack_ids, &nack_ids).await {
            warn!(error = %e, "Pub/Sub ack failed");
        }
    }
}

async fn pull_once(
    client: &reqwest::Client,
    token_source: &TokenSource,
    pull_url: &str,
) -> Result<Vec<ReceivedMessage>> {
    let token = token_source()?;
    let resp = client
        .post(pull_url)
        .bearer_auth(&token)
        .json(&json!({ "maxMessages": PULL_BATCH }))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(CodecError::HttpStatus(resp.status().as_u16()));
    }
    let body: PullResponse = resp.json().await?;
    Ok(body.received_messages)
}

async fn settle(
    client: &reqwest::Client,
    token_source: &TokenSource,
    addr: &GcpAddress,
    ack_ids: &[String],
    nack_ids: &[String],
) -> Result<()> {
    let token = token_source()?;
    let base = format!(
        "{PUBSUB_BASE}/projects/{}/subscriptions/{}",
        addr.project, addr.subscription
    );
    if !ack_ids.is_empty() {
        client
            .post(format!("{base}:acknowledge"))
            .bearer_auth(&token)
            .json(&json!({ "ackIds": ack_ids }))
            .send()
            .await?;
    }
    if !nack_ids.is_empty() {
        client
            .post(format!("{base}:modifyAckDeadline"))
            .bearer_auth(&token)
            .json(&json!({ "ackIds": nack_ids, "ackDeadlineSeconds": 0 }))
            .send()
            .await?;
    }
    Ok(())
}

fn is_stale(publish_time: &str, stale_after: Duration) -> bool {
    match humantime::parse_rfc3339(publish_time) {
        Ok(t) => SystemTime::now()
            .duration_since(t)
            .map_or(false, |age| age > stale_after),
        // No usable timestamp: treat as fresh rather than destroy it.
        Err(_) => false,
    }
}

pub struct GcpCodec {
    url: String,
    addr: GcpAddress,
    client: reqwest::Client,
    token_source: TokenSource,
    reqs: Arc<StdMutex<HashSet<i64>>>,
    frames: Mutex<mpsc::Receiver<Frame>>,
    closer: Closer,
}

#[async_trait]
impl Codec for GcpCodec {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        let mut frames = self.frames.lock().await;
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Closed),
            f = frames.recv() => f.ok_or(CodecError::Eof),
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(CodecError::Closed);
        }
        if !frame.is_request() {
            return Err(CodecError::NotImplemented("sending responses"));
        }
        let token = (self.token_source)()?;
        let endpoint = format!(
            "{CLOUDIOT_BASE}/projects/{}/locations/{}/registries/{}/devices/{}:sendCommandToDevice",
            self.addr.project, self.addr.region, self.addr.registry, self.addr.device
        );
        let payload = base64::engine::general_purpose::STANDARD.encode(frame.to_json()?);

        // Register interest before the command leaves, so the response
        // cannot race the bookkeeping.
        self.reqs.lock().expect("reqs lock").insert(frame.id);
        debug!(device = %self.addr.device, method = %frame.method, "sending device command");
        let resp = tokio::select! {
            _ = ctx.cancelled() => return Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => return Err(CodecError::Closed),
            r = self
                .client
                .post(&endpoint)
                .bearer_auth(&token)
                .json(&json!({
                    "binaryData": payload,
                    "subfolder": self.addr.req_subfolder,
                }))
                .send() => r?,
        };
        if !resp.status().is_success() {
            self.reqs.lock().expect("reqs lock").remove(&frame.id);
            return Err(CodecError::HttpStatus(resp.status().as_u16()));
        }
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
            tls: true,
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
    fn address_parse_with_defaults() {
        let addr = parse_address("gcp://proj/europe-west1/reg1/dev1").expect("parse");
        assert_eq!(addr.project, "proj");
        assert_eq!(addr.region, "europe-west1");
        assert_eq!(addr.registry, "reg1");
        assert_eq!(addr.device, "dev1");
        assert_eq!(addr.topic, "rpc");
        assert_eq!(addr.subscription, "rpc");
        assert_eq!(addr.req_subfolder, "rpc");
        assert_eq!(addr.resp_subfolder, "rpc");
    }

    #[test]
    fn address_parse_with_overrides() {
        let addr = parse_address("gcp://p/r/g/d?topic=t1&sub=s1&reqsf=in&respsf=out")
            .expect("parse");
        assert_eq!(addr.topic, "t1");
        assert_eq!(addr.subscription, "s1");
        assert_eq!(addr.req_subfolder, "in");
        assert_eq!(addr.resp_subfolder, "out");
    }

    #[test]
    fn short_addresses_are_rejected() {
        assert!(parse_address("gcp://p/r/g").is_err());
        assert!(parse_address("tcp://p/r/g/d").is_err());
    }

    #[test]
    fn attribute_matching() {
        let addr = parse_address("gcp://p/r/g/d").expect("parse");
        let mut attrs: HashMap<String, String> = [
            ("projectId", "p"),
            ("deviceRegistryLocation", "r"),
            ("deviceRegistryId", "g"),
            ("deviceId", "d"),
            ("subFolder", "rpc"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert!(attrs_match(&addr, &attrs));

        attrs.insert("deviceId".to_string(), "other".to_string());
        assert!(!attrs_match(&addr, &attrs));
    }

    #[test]
    fn staleness_uses_publish_time() {
        assert!(is_stale("2020-01-01T00:00:00Z", Duration::from_secs(60)));
        assert!(!is_stale("not a timestamp", Duration::from_secs(60)));
    }
}
