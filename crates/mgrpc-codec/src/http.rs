//! Outbound HTTP transport: one POST per frame, the HTTP response body
//! is the response frame. Strictly request/response, so
//! `max_num_frames` is 1 and unsolicited device frames cannot arrive.
//!
//! A 401 with a `Digest` challenge is answered once, with credentials
//! obtained from the configured callback; a second 401 means the
//! credentials are wrong and the call fails with an auth error.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use mgrpc_frame::Frame;

use crate::codec::{Closer, Codec, ConnectionInfo, CredsCallback, Options};
use crate::error::{CodecError, Result};

#[derive(Clone, Default)]
pub struct HttpOptions {
    /// Invoked when the server demands digest authentication.
    pub get_creds: Option<CredsCallback>,
}

/// Creates a codec POSTing frames to `url` (`http://` or `https://`).
pub fn http(url: &str, opts: &HttpOptions) -> Result<OutboundHttpCodec> {
    let parsed = Url::parse(url).map_err(|e| CodecError::address(url, e.to_string()))?;
    Ok(OutboundHttpCodec {
        url: url.to_string(),
        uri_path: parsed.path().to_string(),
        tls: parsed.scheme() == "https",
        opts: StdMutex::new(opts.clone()),
        client: StdMutex::new(reqwest::Client::new()),
        queue: StdMutex::new(VecDeque::new()),
        notify: Notify::new(),
        closer: Closer::new(),
    })
}

pub struct OutboundHttpCodec {
    url: String,
    uri_path: String,
    tls: bool,
    opts: StdMutex<HttpOptions>,
    client: StdMutex<reqwest::Client>,
    queue: StdMutex<VecDeque<Frame>>,
    notify: Notify,
    closer: Closer,
}

impl OutboundHttpCodec {
    fn creds_callback(&self) -> Option<CredsCallback> {
        self.opts.lock().expect("opts lock").get_creds.clone()
    }

    async fn post_once(
        &self,
        ctx: &CancellationToken,
        body: &[u8],
        authorization: Option<&str>,
    ) -> Result<reqwest::Response> {
        let client = self.client.lock().expect("client lock").clone();
        let mut req = client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(h) = authorization {
            req = req.header(AUTHORIZATION, h.to_string());
        }
        tokio::select! {
            _ = ctx.cancelled() => Err(CodecError::Cancelled),
            _ = self.closer.notify().cancelled_owned() => Err(CodecError::Closed),
            r = req.send() => Ok(r?),
        }
    }
}

#[async_trait]
impl Codec for OutboundHttpCodec {
    async fn recv(&self, ctx: &CancellationToken) -> Result<Frame> {
        loop {
            if let Some(frame) = self.queue.lock().expect("queue lock").pop_front() {
                return Ok(frame);
            }
            if self.closer.is_closed() {
                return Err(CodecError::Closed);
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                _ = self.closer.notify().cancelled_owned() => return Err(CodecError::Closed),
                _ = self.notify.notified() => {}
            }
        }
    }

    async fn send(&self, ctx: &CancellationToken, frame: &Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(CodecError::Closed);
        }
        let body = frame.to_json()?;
        let mut authorization: Option<String> = None;
        loop {
            let resp = self
                .post_once(ctx, &body, authorization.as_deref())
                .await?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED {
                if authorization.is_some() {
                    return Err(CodecError::Auth("digest credentials rejected".into()));
                }
                let header = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let challenge = digest::parse_challenge(&header).ok_or_else(|| {
                    CodecError::Auth("server sent 401 without a digest challenge".into())
                })?;
                let get_creds = self.creds_callback().ok_or_else(|| {
                    CodecError::Auth("server requires credentials, none configured".into())
                })?;
                let (username, password) = get_creds()?;
                debug!(username = %username, "answering digest challenge");
                authorization = Some(digest::authorization_header(
                    &challenge,
                    "POST",
                    &self.uri_path,
                    &username,
                    &password,
                )?);
                // Retry on a fresh client; the old one may pool the
                // connection the server just failed.
                *self.client.lock().expect("client lock") = reqwest::Client::new();
                continue;
            }
            if !status.is_success() {
                return Err(CodecError::HttpStatus(status.as_u16()));
            }

            let data = tokio::select! {
                _ = ctx.cancelled() => return Err(CodecError::Cancelled),
                r = resp.bytes() => r?,
            };
            let frame = Frame::from_json(&data)?;
            self.queue.lock().expect("queue lock").push_back(frame);
            self.notify.notify_one();
            return Ok(());
        }
    }

    fn close(&self) {
        self.closer.close();
    }

    fn close_notify(&self) -> CancellationToken {
        self.closer.notify()
    }

    fn max_num_frames(&self) -> i32 {
        1
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            is_connected: !self.closer.is_closed(),
            tls: self.tls,
            remote_addr: self.url.clone(),
            peer_certificates: Vec::new(),
        }
    }

    /// The credentials callback may be supplied per call, so unlike most
    /// transports this one accepts option updates.
    fn set_options(&self, opts: &Options) -> Result<()> {
        if let Some(cb) = &opts.http.get_creds {
            self.opts.lock().expect("opts lock").get_creds = Some(cb.clone());
        }
        Ok(())
    }
}

/// RFC 2617 digest access authentication, MD5 and SHA-256 variants.
pub(crate) mod digest {
    use md5::Digest as _;
    use rand::Rng;

    use crate::error::{CodecError, Result};

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct DigestChallenge {
        pub realm: String,
        pub nonce: String,
        pub qop: String,
        pub opaque: String,
        pub algorithm: String,
    }

    /// Parses a `WWW-Authenticate: Digest ...` header value. Returns
    /// `None` for non-digest schemes.
    pub fn parse_challenge(header: &str) -> Option<DigestChallenge> {
        let rest = header.trim().strip_prefix("Digest")?;
        let mut c = DigestChallenge::default();
        for param in split_params(rest) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => c.realm = value,
                "nonce" => c.nonce = value,
                "qop" => c.qop = value,
                "opaque" => c.opaque = value,
                "algorithm" => c.algorithm = value,
                _ => {}
            }
        }
        if c.nonce.is_empty() {
            return None;
        }
        Some(c)
    }

    /// Splits a parameter list on commas that are outside quotes.
    fn split_params(input: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut start = 0;
        let mut in_quotes = false;
        for (i, ch) in input.char_indices() {
            match ch {
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => {
                    out.push(&input[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        out.push(&input[start..]);
        out
    }

    /// Builds the `Authorization` header answering `challenge`.
    pub fn authorization_header(
        challenge: &DigestChallenge,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
    ) -> Result<String> {
        let cnonce = format!("{}", rand::thread_rng().gen::<u32>());
        authorization_header_with_cnonce(challenge, method, uri, username, password, &cnonce)
    }

    fn authorization_header_with_cnonce(
        challenge: &DigestChallenge,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
    ) -> Result<String> {
        let qop = if challenge.qop.is_empty() {
            "auth"
        } else {
            challenge.qop.as_str()
        };
        let nc = "00000001";
        let response = response_digest(
            &challenge.algorithm,
            method,
            uri,
            username,
            &challenge.realm,
            password,
            &challenge.nonce,
            nc,
            cnonce,
            qop,
        )?;
        let algorithm = if challenge.algorithm.is_empty() {
            "MD5"
        } else {
            challenge.algorithm.as_str()
        };
        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{realm}\", uri=\"{uri}\", \
             algorithm={algorithm}, nonce=\"{nonce}\", nc={nc}, cnonce=\"{cnonce}\", \
             qop={qop}, response=\"{response}\"",
            realm = challenge.realm,
            nonce = challenge.nonce,
        );
        if !challenge.opaque.is_empty() {
            header.push_str(&format!(", opaque=\"{}\"", challenge.opaque));
        }
        Ok(header)
    }

    /// The digest itself: `H(HA1:nonce:nc:cnonce:qop:HA2)` where
    /// `HA1 = H(user:realm:password)` and `HA2 = H(method:uri)`.
    #[allow(clippy::too_many_arguments)]
    pub fn response_digest(
        algorithm: &str,
        method: &str,
        uri: &str,
        username: &str,
        realm: &str,
        password: &str,
        nonce: &str,
        nc: &str,
        cnonce: &str,
        qop: &str,
    ) -> Result<String> {
        let ha1 = hash(algorithm, &format!("{username}:{realm}:{password}"))?;
        let ha2 = hash(algorithm, &format!("{method}:{uri}"))?;
        hash(algorithm, &format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
    }

    fn hash(algorithm: &str, data: &str) -> Result<String> {
        match algorithm {
            "" | "MD5" => Ok(hex::encode(md5::Md5::digest(data.as_bytes()))),
            "SHA-256" => Ok(hex::encode(sha2::Sha256::digest(data.as_bytes()))),
            other => Err(CodecError::Auth(format!(
                "unsupported digest algorithm {other}"
            ))),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn rfc2617_reference_vector() {
            // The worked example from RFC 2617 section 3.5.
            let response = response_digest(
                "MD5",
                "GET",
                "/dir/index.html",
                "Mufasa",
                "testrealm@host.com",
                "Circle Of Life",
                "dcd98b7102dd2f0e8b11d0f600bfb0c093",
                "00000001",
                "0a4f113b",
                "auth",
            )
            .expect("digest");
            assert_eq!(response, "6629fae49393a05397450978507c4ef1");
        }

        #[test]
        fn rfc7616_sha256_reference_vector() {
            // The worked example from RFC 7616 section 3.9.1.
            let response = response_digest(
                "SHA-256",
                "GET",
                "/dir/index.html",
                "Mufasa",
                "http-auth@example.org",
                "Circle of Life",
                "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
                "00000001",
                "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
                "auth",
            )
            .expect("digest");
            assert_eq!(
                response,
                "753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1"
            );
        }

        #[test]
        fn challenge_parse_with_quoted_commas() {
            let c = parse_challenge(
                "Digest qop=\"auth\", realm=\"esp8266, the little one\", \
                 nonce=\"abc123\", algorithm=SHA-256, opaque=\"xyz\"",
            )
            .expect("challenge");
            assert_eq!(c.realm, "esp8266, the little one");
            assert_eq!(c.nonce, "abc123");
            assert_eq!(c.qop, "auth");
            assert_eq!(c.algorithm, "SHA-256");
            assert_eq!(c.opaque, "xyz");
        }

        #[test]
        fn non_digest_scheme_is_rejected() {
            assert!(parse_challenge("Basic realm=\"device\"").is_none());
            assert!(parse_challenge("Digest realm=\"no-nonce\"").is_none());
        }

        #[test]
        fn header_contains_all_required_fields() {
            let c = DigestChallenge {
                realm: "r".into(),
                nonce: "n".into(),
                qop: "auth".into(),
                opaque: String::new(),
                algorithm: "MD5".into(),
            };
            let header = authorization_header_with_cnonce(&c, "POST", "/rpc", "u", "p", "42")
                .expect("header");
            for needle in [
                "username=\"u\"",
                "realm=\"r\"",
                "uri=\"/rpc\"",
                "nonce=\"n\"",
                "nc=00000001",
                "cnonce=\"42\"",
                "qop=auth",
                "response=\"",
            ] {
                assert!(header.contains(needle), "missing {needle} in {header}");
            }
            assert!(!header.contains("opaque"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    const CHALLENGE_REPLY: &str = "HTTP/1.1 401 Unauthorized\r\n\
         WWW-Authenticate: Digest qop=\"auth\", realm=\"device\", nonce=\"abc123\"\r\n\
         Content-Length: 0\r\nConnection: close\r\n\r\n";

    /// Reads one full HTTP request (headers plus Content-Length body).
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 1024];
            let n = socket.read(&mut chunk).await.expect("server read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .filter_map(|l| l.strip_prefix("content-length:"))
                .next()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + body_len {
                break;
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serves one connection with a canned reply; returns the request.
    async fn answer(listener: &TcpListener, reply: String) -> String {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let req = read_request(&mut socket).await;
        socket
            .write_all(reply.as_bytes())
            .await
            .expect("server write");
        let _ = socket.shutdown().await;
        req
    }

    fn test_creds(user: &str, pass: &str) -> CredsCallback {
        let user = user.to_string();
        let pass = pass.to_string();
        Arc::new(move || Ok((user.clone(), pass.clone())))
    }

    #[tokio::test]
    async fn challenge_is_answered_and_response_queued() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let first = answer(&listener, CHALLENGE_REPLY.to_string()).await;
            assert!(
                !first.to_ascii_lowercase().contains("authorization:"),
                "first request must go out unauthenticated"
            );
            let body = "{\"v\":2,\"id\":5,\"result\":{\"ok\":true}}";
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let second = answer(&listener, reply).await.to_ascii_lowercase();
            assert!(second.contains("authorization: digest username=\"admin\""));
            assert!(second.contains("uri=\"/rpc\""));
        });

        let codec = http(
            &format!("http://{addr}/rpc"),
            &HttpOptions {
                get_creds: Some(test_creds("admin", "open sesame")),
            },
        )
        .expect("codec");
        let ctx = CancellationToken::new();
        let req = Frame {
            id: 5,
            method: "Sys.GetInfo".to_string(),
            ..Frame::default()
        };
        codec.send(&ctx, &req).await.expect("send");
        let got = codec.recv(&ctx).await.expect("recv");
        assert_eq!(got.id, 5);
        assert_eq!(got.result.expect("result").get(), "{\"ok\":true}");

        server.await.expect("server task");
    }

    #[tokio::test]
    async fn second_challenge_rejects_the_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let _ = answer(&listener, CHALLENGE_REPLY.to_string()).await;
            let retry = answer(&listener, CHALLENGE_REPLY.to_string()).await;
            assert!(
                retry.to_ascii_lowercase().contains("authorization: digest"),
                "retry must carry the digest answer"
            );
        });

        let codec = http(
            &format!("http://{addr}/rpc"),
            &HttpOptions {
                get_creds: Some(test_creds("admin", "wrong")),
            },
        )
        .expect("codec");
        let ctx = CancellationToken::new();
        let req = Frame {
            id: 6,
            method: "Sys.GetInfo".to_string(),
            ..Frame::default()
        };
        let err = codec.send(&ctx, &req).await.expect_err("bad credentials");
        assert!(matches!(err, CodecError::Auth(_)));

        server.await.expect("server task");
    }
}
