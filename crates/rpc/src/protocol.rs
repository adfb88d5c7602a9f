//! Messages exchanged over the command channel.
//!
//! Every message is one JSON document on its own line. A client sends
//! [`Request`]s and the service answers each with a [`Response`] carrying the
//! same `id`. Responses to different requests on one connection are written in
//! the order the requests were read.

use crate::error::{Error, ErrorKind, Result};
use derive_more::Display;
use dmirror_replicate::Key;
use exn::ResultExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Protocol identifier returned by `ping`. The startup probe only treats an
/// endpoint as "already running" if it answers with exactly this value.
pub const PROTOCOL: &str = "dmirror/1";

/// Maximum length of a single message line, in bytes.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// What a key refers to.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A single replicated log.
    #[default]
    #[display("base")]
    #[serde(alias = "ddatabase")]
    Base,
    /// A metadata log plus the content log it points at.
    #[display("drive")]
    #[serde(alias = "ddrive")]
    Drive,
}

impl FromStr for ResourceKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "base" | "ddatabase" => Ok(Self::Base),
            "drive" | "ddrive" => Ok(Self::Drive),
            _ => exn::bail!(ErrorKind::UnknownType(s.to_string())),
        }
    }
}

/// The key and (optional) type a command addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub key: Key,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
}

impl Target {
    pub fn new(key: Key, kind: Option<ResourceKind>) -> Self {
        Self { key, kind }
    }
}

/// Mirroring state of one resource.
///
/// `kind` echoes what the caller sent; it is not looked up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub key: Key,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
    pub mirroring: bool,
}

/// Answer to `list`: every resource the service has been asked to mirror.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub mirroring: Vec<Status>,
}

/// Answer to `ping`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub protocol: String,
}

impl Default for Pong {
    fn default() -> Self {
        Self { protocol: PROTOCOL.to_string() }
    }
}

/// Answer to `stop`, sent before the service starts shutting down.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[display("mirror")]
    Mirror,
    #[display("unmirror")]
    Unmirror,
    #[display("status")]
    Status,
    #[display("list")]
    List,
    #[display("stop")]
    Stop,
    #[display("ping")]
    Ping,
}

impl Method {
    /// Whether the method needs a [`Target`].
    pub fn takes_target(&self) -> bool {
        matches!(self, Self::Mirror | Self::Unmirror | Self::Status)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Target>,
}

impl Request {
    /// Parse a request line.
    ///
    /// On failure the returned error message is suitable for sending back to
    /// the client.
    pub fn parse(line: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(line).or_raise(|| ErrorKind::Protocol("malformed request".to_string()))?;
        if request.method.takes_target() && request.params.is_none() {
            exn::bail!(ErrorKind::Protocol(format!("{} requires a key", request.method)));
        }
        Ok(request)
    }
}

/// Reply to a [`Request`]. Exactly one of `result` and `error` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(id: u64, result: &T) -> Result<Self> {
        let result = serde_json::to_value(result).or_raise(|| ErrorKind::Protocol("unencodable result".to_string()))?;
        Ok(Self { id, result: Some(result), error: None })
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(message.into()) }
    }

    /// Convert into the expected result type, or the service's error.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        match (self.result, self.error) {
            (_, Some(message)) => exn::bail!(ErrorKind::Remote(message)),
            (Some(value), None) => {
                serde_json::from_value(value).or_raise(|| ErrorKind::Protocol("unexpected result shape".to_string()))
            },
            (None, None) => exn::bail!(ErrorKind::Protocol("response has neither result nor error".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    const HEX: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[rstest]
    #[case("base", ResourceKind::Base)]
    #[case("ddatabase", ResourceKind::Base)]
    #[case("drive", ResourceKind::Drive)]
    #[case("DDrive", ResourceKind::Drive)]
    fn test_kind_from_str(#[case] input: &str, #[case] expected: ResourceKind) {
        assert_eq!(input.parse::<ResourceKind>().unwrap(), expected);
    }

    #[test]
    fn test_kind_unknown() {
        let err = "hyperdrive".parse::<ResourceKind>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownType(s) if s == "hyperdrive"));
    }

    #[rstest]
    #[case(json!("ddatabase"), ResourceKind::Base)]
    #[case(json!("ddrive"), ResourceKind::Drive)]
    #[case(json!("drive"), ResourceKind::Drive)]
    fn test_kind_legacy_names_on_the_wire(#[case] input: Value, #[case] expected: ResourceKind) {
        assert_eq!(serde_json::from_value::<ResourceKind>(input).unwrap(), expected);
    }

    #[test]
    fn test_kind_is_always_written_with_current_name() {
        assert_eq!(serde_json::to_value(ResourceKind::Drive).unwrap(), json!("drive"));
    }

    #[test]
    fn test_request_with_hex_key() {
        let line = format!(r#"{{"id":7,"method":"mirror","params":{{"key":"{HEX}","type":"ddrive"}}}}"#);
        let request = Request::parse(&line).unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.method, Method::Mirror);
        let params = request.params.unwrap();
        assert_eq!(params.key, Key::from_bytes([1; 32]));
        assert_eq!(params.kind, Some(ResourceKind::Drive));
    }

    #[test]
    fn test_request_with_byte_array_key() {
        let line = json!({"id": 1, "method": "status", "params": {"key": ([2u8; 32])}}).to_string();
        let request = Request::parse(&line).unwrap();
        let params = request.params.unwrap();
        assert_eq!(params.key, Key::from_bytes([2; 32]));
        assert_eq!(params.kind, None);
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"id":1,"method":"explode"}"#)]
    #[case(r#"{"id":1,"method":"mirror"}"#)]
    #[case(r#"{"id":1,"method":"status","params":{"key":"abcd"}}"#)]
    fn test_request_rejected(#[case] line: &str) {
        let err = Request::parse(line).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Protocol(_)));
    }

    #[test]
    fn test_list_without_params() {
        let request = Request::parse(r#"{"id":3,"method":"list"}"#).unwrap();
        assert_eq!(request.method, Method::List);
        assert!(request.params.is_none());
    }

    #[test]
    fn test_status_omits_absent_type() {
        let status = Status { key: Key::from_bytes([1; 32]), kind: None, mirroring: false };
        assert_eq!(serde_json::to_value(&status).unwrap(), json!({"key": HEX, "mirroring": false}));
    }

    #[test]
    fn test_response_into_result() {
        let pong: Pong = Response::ok(1, &Pong::default()).unwrap().into_result().unwrap();
        assert_eq!(pong.protocol, PROTOCOL);

        let err = Response::err(2, "boom").into_result::<Pong>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Remote(m) if m == "boom"));

        let err = Response::ok(3, &json!({"unexpected": 1})).unwrap().into_result::<Pong>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Protocol(_)));
    }
}
