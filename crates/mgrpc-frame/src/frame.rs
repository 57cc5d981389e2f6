use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;

/// Auto-generated call IDs are "large but not ginormous": the range
/// `[2^40, 2^41)` is reserved for CLI-originated calls so they can never
/// collide with device-originated IDs.
pub const AUTO_ID_PREFIX: i64 = 1 << 40;

/// Cap on how much of a frame `Display` will render.
pub const FRAME_STRINGIFY_LIMIT: usize = 2048;

/// Allocate a unique call ID from the reserved high range.
pub fn create_call_id() -> i64 {
    rand::thread_rng().gen_range(0..AUTO_ID_PREFIX) | AUTO_ID_PREFIX
}

/// The single wire message type: an RPC request or response.
///
/// Field names are a protocol contract with device firmware and must not
/// change. `params` and `result` are opaque, uninterpreted JSON values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version. Implicit on requests, set to 2 on responses.
    #[serde(rename = "v", default, skip_serializing_if = "is_zero_i32")]
    pub version: i32,

    /// Logical ID of the sender.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,

    /// Logical ID of the recipient.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst: String,

    /// Pre-shared authentication token, if client certificates are not used.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// Copied verbatim to the response frame, if present.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,

    /// Call identifier. Responses echo the request's ID.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub id: i64,

    /// RPC method name. A frame is a request iff this is non-empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// Opaque method arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,

    /// Seconds since epoch after which the result is no longer relevant.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub deadline: i64,

    /// Seconds after reception of the request after which the result is no
    /// longer relevant.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub timeout: i64,

    /// Successful response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,

    /// Failed response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,

    /// Send no response to this frame.
    #[serde(rename = "nr", default, skip_serializing_if = "is_false")]
    pub no_response: bool,

    /// Approximate in-memory size of the frame. Diagnostics only; never
    /// part of the wire format and never used for correctness.
    #[serde(skip)]
    pub size_hint: usize,
}

/// Application-level error carried in a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Caller-side view of an outgoing call, before it is bound to a frame.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub args: Option<Box<RawValue>>,
    pub id: i64,
    /// Absolute expiry hint (seconds since epoch), advisory.
    pub deadline: i64,
    /// Relative expiry hint (seconds), advisory.
    pub timeout: i64,
    pub no_response: bool,
}

/// Caller-side view of a completed call.
///
/// A non-zero `status` is an application-level error reported by the
/// device, not a transport failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    #[serde(default)]
    pub status: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_msg: String,
    #[serde(rename = "resp", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Box<RawValue>>,
}

impl Frame {
    /// True iff this frame carries a request.
    pub fn is_request(&self) -> bool {
        !self.method.is_empty()
    }

    /// Build a request frame for one outgoing call.
    pub fn new_request(src: &str, dst: &str, key: &str, req: &Request) -> Self {
        Frame {
            src: src.to_string(),
            dst: dst.to_string(),
            key: key.to_string(),
            id: req.id,
            method: req.method.clone(),
            params: req.args.clone(),
            deadline: req.deadline,
            timeout: req.timeout,
            no_response: req.no_response,
            ..Frame::default()
        }
    }

    /// Build a response frame from a handler's result. Transient: exists
    /// only to cross the wire.
    pub fn new_response(src: &str, dst: &str, key: &str, resp: &Response) -> Self {
        let mut f = Frame {
            version: 2,
            src: src.to_string(),
            dst: dst.to_string(),
            key: key.to_string(),
            id: resp.id,
            result: resp.response.clone(),
            ..Frame::default()
        };
        if resp.status != 0 {
            f.error = Some(RpcError {
                code: resp.status,
                message: resp.status_msg.clone(),
            });
        }
        f
    }

    /// Encode to the JSON wire format. `serde_json` does not HTML-escape,
    /// so raw device data containing `<`, `>` or `&` round-trips unchanged.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the JSON wire format, recording the byte size as the
    /// frame's size hint.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut f: Frame = serde_json::from_slice(data)?;
        f.size_hint = data.len();
        Ok(f)
    }
}

impl Response {
    /// Extract the caller-facing response from a response frame.
    pub fn from_frame(f: &Frame) -> Self {
        let mut r = Response {
            id: f.id,
            response: f.result.clone(),
            ..Response::default()
        };
        if let Some(err) = &f.error {
            r.status = err.code;
            r.status_msg = err.message.clone();
        }
        r
    }
}

impl Request {
    /// Extract an incoming request from a request frame.
    pub fn from_frame(f: &Frame) -> Self {
        Request {
            method: f.method.clone(),
            args: f.params.clone(),
            id: f.id,
            deadline: f.deadline,
            timeout: f.timeout,
            no_response: f.no_response,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} -> {:?} v={} id={} ",
            self.src, self.dst, self.version, self.id
        )?;
        // The hint can be missing or wrong; it only guards log size.
        if self.size_hint < FRAME_STRINGIFY_LIMIT {
            if self.is_request() {
                write!(
                    f,
                    "{} params={} {}",
                    self.method,
                    raw_preview(&self.params),
                    self.size_hint
                )
            } else {
                write!(
                    f,
                    "result={} error={:?} {}",
                    raw_preview(&self.result),
                    self.error,
                    self.size_hint
                )
            }
        } else if self.is_request() {
            write!(f, "{} params=(too big) {}", self.method, self.size_hint)
        } else {
            write!(
                f,
                "result=(too big) error={:?} {}",
                self.error, self.size_hint
            )
        }
    }
}

fn raw_preview(v: &Option<Box<RawValue>>) -> &str {
    match v {
        Some(raw) => {
            let s = raw.get();
            if s.len() > FRAME_STRINGIFY_LIMIT {
                "(too big)"
            } else {
                s
            }
        }
        None => "null",
    }
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(s: &str) -> Option<Box<RawValue>> {
        Some(RawValue::from_string(s.to_string()).unwrap())
    }

    #[test]
    fn call_ids_come_from_reserved_range() {
        for _ in 0..1000 {
            let id = create_call_id();
            assert!(id >= AUTO_ID_PREFIX);
            assert!(id < AUTO_ID_PREFIX << 1);
        }
    }

    #[test]
    fn request_roundtrip_field_for_field() {
        let f = Frame::new_request(
            "mos",
            "esp32_1234",
            "secret",
            &Request {
                method: "Sys.GetInfo".to_string(),
                args: raw(r#"{"depth":2}"#),
                id: create_call_id(),
                deadline: 0,
                timeout: 30,
                no_response: false,
            },
        );

        let bytes = f.to_json().unwrap();
        let g = Frame::from_json(&bytes).unwrap();

        assert_eq!(g.src, f.src);
        assert_eq!(g.dst, f.dst);
        assert_eq!(g.key, f.key);
        assert_eq!(g.id, f.id);
        assert_eq!(g.method, f.method);
        assert_eq!(g.params.as_ref().unwrap().get(), r#"{"depth":2}"#);
        assert_eq!(g.timeout, 30);
        assert!(g.is_request());
        assert_eq!(g.size_hint, bytes.len());
    }

    #[test]
    fn response_roundtrip_field_for_field() {
        let f = Frame::new_response(
            "esp32_1234",
            "mos",
            "",
            &Response {
                id: 42,
                status: 0,
                status_msg: String::new(),
                response: raw(r#"{"uptime":17}"#),
            },
        );

        let g = Frame::from_json(&f.to_json().unwrap()).unwrap();
        assert_eq!(g.version, 2);
        assert_eq!(g.id, 42);
        assert!(!g.is_request());
        assert_eq!(g.result.as_ref().unwrap().get(), r#"{"uptime":17}"#);
        assert!(g.error.is_none());
    }

    #[test]
    fn html_characters_are_not_escaped() {
        let f = Frame::new_request(
            "",
            "",
            "",
            &Request {
                method: "FS.Put".to_string(),
                args: raw(r#"{"data":"<html>&amp;</html>"}"#),
                id: 1,
                ..Request::default()
            },
        );

        let bytes = f.to_json().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("<html>&amp;</html>"));
        assert!(!text.contains("\\u003c"));

        let g = Frame::from_json(&bytes).unwrap();
        assert_eq!(
            g.params.as_ref().unwrap().get(),
            r#"{"data":"<html>&amp;</html>"}"#
        );
    }

    #[test]
    fn error_response_maps_to_status() {
        let f = Frame::new_response(
            "",
            "",
            "",
            &Response {
                id: 7,
                status: 500,
                status_msg: "boom".to_string(),
                response: None,
            },
        );
        assert_eq!(
            f.error,
            Some(RpcError {
                code: 500,
                message: "boom".to_string()
            })
        );

        let r = Response::from_frame(&f);
        assert_eq!(r.status, 500);
        assert_eq!(r.status_msg, "boom");
    }

    #[test]
    fn unset_fields_are_omitted_from_the_wire() {
        let f = Frame {
            id: 5,
            method: "Sys.Reboot".to_string(),
            ..Frame::default()
        };
        let text = String::from_utf8(f.to_json().unwrap()).unwrap();
        assert_eq!(text, r#"{"id":5,"method":"Sys.Reboot"}"#);
    }

    #[test]
    fn no_response_flag_uses_nr_field() {
        let f = Frame {
            id: 5,
            method: "Sys.Reboot".to_string(),
            no_response: true,
            ..Frame::default()
        };
        let text = String::from_utf8(f.to_json().unwrap()).unwrap();
        assert!(text.contains(r#""nr":true"#));

        let g = Frame::from_json(text.as_bytes()).unwrap();
        assert!(g.no_response);
    }

    #[test]
    fn display_truncates_large_frames() {
        let big = format!(r#"{{"blob":"{}"}}"#, "x".repeat(4096));
        let mut f = Frame::new_request(
            "a",
            "b",
            "",
            &Request {
                method: "FS.Put".to_string(),
                args: raw(&big),
                id: 1,
                ..Request::default()
            },
        );
        f.size_hint = big.len();
        let rendered = f.to_string();
        assert!(rendered.contains("params=(too big)"));
        assert!(rendered.len() < big.len());
    }
}
