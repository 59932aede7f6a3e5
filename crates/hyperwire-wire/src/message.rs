//! Wire protocol message types.
//!
//! Every message between nodes is a JSON [`Envelope`]. Stream transports
//! prefix each envelope with a 4-byte big-endian length header; the
//! in-process bus passes the bare JSON body.
//!
//! Payloads are opaque bytes, carried as standard base64 strings.

use crate::error::TransportError;
use hyperwire_types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Result carried by a response: success bytes or a failure reason.
pub type Response = Result<Vec<u8>, String>;

/// Identifies one request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Id carried by connection handshake frames, which are never correlated.
    pub const HANDSHAKE: CorrelationId = CorrelationId(0);
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A wire protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id shared by a request and its response.
    pub id: CorrelationId,
    #[serde(flatten)]
    pub kind: EnvelopeKind,
}

/// The different kinds of envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnvelopeKind {
    #[serde(rename = "request")]
    Request(WireRequest),
    #[serde(rename = "response")]
    Response(WireResponse),
    /// First frame on a new stream connection.
    #[serde(rename = "hello")]
    Hello(Hello),
    /// Acceptor's answer to [`EnvelopeKind::Hello`].
    #[serde(rename = "hello_ack")]
    HelloAck(Hello),
    /// The acceptor refused the connection.
    #[serde(rename = "rejected")]
    Rejected { code: u16, message: String },
}

/// An addressed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub source: Address,
    pub target: Address,
    /// Whether the sender registered a pending entry for this id.
    pub expects_response: bool,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// A response, addressed back to the request's source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub source: Address,
    pub target: Address,
    pub result: WireResult,
}

/// Serialized form of a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireResult {
    Ok(#[serde(with = "base64_bytes")] Vec<u8>),
    Err(String),
}

impl From<Response> for WireResult {
    fn from(result: Response) -> Self {
        match result {
            Ok(bytes) => WireResult::Ok(bytes),
            Err(reason) => WireResult::Err(reason),
        }
    }
}

impl From<WireResult> for Response {
    fn from(result: WireResult) -> Self {
        match result {
            WireResult::Ok(bytes) => Ok(bytes),
            WireResult::Err(reason) => Err(reason),
        }
    }
}

/// Connection handshake: identity plus optional HMAC proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// The sender's node name.
    pub node: String,
    pub protocol_version: u32,
    /// Random nonce for HMAC authentication.
    #[serde(default)]
    pub nonce: String,
    /// HMAC-SHA256(shared_secret, nonce + node), hex encoded.
    #[serde(default)]
    pub auth_hmac: String,
}

impl Envelope {
    pub fn request(
        id: CorrelationId,
        source: Address,
        target: Address,
        payload: Vec<u8>,
        expects_response: bool,
    ) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Request(WireRequest {
                source,
                target,
                expects_response,
                payload,
            }),
        }
    }

    pub fn response(id: CorrelationId, source: Address, target: Address, result: Response) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Response(WireResponse {
                source,
                target,
                result: result.into(),
            }),
        }
    }

    /// Where the envelope is headed, for routable kinds.
    pub fn target(&self) -> Option<&Address> {
        match &self.kind {
            EnvelopeKind::Request(req) => Some(&req.target),
            EnvelopeKind::Response(resp) => Some(&resp.target),
            _ => None,
        }
    }

    /// Who sent the envelope, for routable kinds.
    pub fn source(&self) -> Option<&Address> {
        match &self.kind {
            EnvelopeKind::Request(req) => Some(&req.source),
            EnvelopeKind::Response(resp) => Some(&resp.source),
            _ => None,
        }
    }
}

/// Encode an envelope to its bare JSON body.
pub fn encode_envelope(msg: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Parse a JSON body into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Encode an envelope as a frame (4-byte big-endian length + JSON).
///
/// Bodies over [`MAX_MESSAGE_SIZE`] are refused here, since the receiving
/// side would drop the connection on reading their header.
pub fn encode_frame(msg: &Envelope) -> Result<Vec<u8>, TransportError> {
    let json = encode_envelope(msg)?;
    let len = match u32::try_from(json.len()) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => len,
        _ => {
            return Err(TransportError::MessageTooLarge {
                size: u32::try_from(json.len()).unwrap_or(u32::MAX),
                max: MAX_MESSAGE_SIZE,
            })
        }
    };
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_frame_length_prefix() {
        let msg = Envelope::request(
            CorrelationId(7),
            addr("alice.os@chat:app:alice.os"),
            addr("bob.os@chat:app:alice.os"),
            b"ping".to_vec(),
            true,
        );
        let bytes = encode_frame(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_envelope(&bytes[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        // Base64 grows the payload by a third, well past the frame limit.
        let msg = Envelope::request(
            CorrelationId(8),
            addr("alice.os@chat:app:alice.os"),
            addr("bob.os@chat:app:alice.os"),
            vec![0u8; 13 * 1024 * 1024],
            true,
        );
        match encode_frame(&msg) {
            Err(TransportError::MessageTooLarge { size, max }) => {
                assert_eq!(max, MAX_MESSAGE_SIZE);
                assert!(size > MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_request_json_shape() {
        let msg = Envelope::request(
            CorrelationId(42),
            addr("alice.os@chat:app:alice.os"),
            addr("bob.os@chat:app:alice.os"),
            b"ping".to_vec(),
            false,
        );
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["type"], "request");
        assert_eq!(value["target"], "bob.os@chat:app:alice.os");
        assert_eq!(value["expects_response"], false);
        assert_eq!(value["payload"], "cGluZw==");
    }

    #[test]
    fn test_response_result_shapes() {
        let ok = Envelope::response(
            CorrelationId(1),
            addr("bob.os@chat:app:alice.os"),
            addr("alice.os@chat:app:alice.os"),
            Ok(b"pong".to_vec()),
        );
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains(r#""result":{"ok":"cG9uZw=="}"#), "{json}");

        let err = Envelope::response(
            CorrelationId(2),
            addr("bob.os@chat:app:alice.os"),
            addr("alice.os@chat:app:alice.os"),
            Err("no such agent".to_string()),
        );
        let decoded = decode_envelope(&encode_envelope(&err).unwrap()).unwrap();
        match decoded.kind {
            EnvelopeKind::Response(resp) => {
                assert_eq!(Response::from(resp.result), Err("no such agent".to_string()));
            }
            other => panic!("Expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_hello_defaults_missing_auth_fields() {
        let json = r#"{"id":0,"type":"hello","node":"alice.os","protocol_version":1}"#;
        let decoded = decode_envelope(json.as_bytes()).unwrap();
        match &decoded.kind {
            EnvelopeKind::Hello(hello) => {
                assert_eq!(hello.node, "alice.os");
                assert!(hello.auth_hmac.is_empty());
            }
            other => panic!("Expected Hello, got {other:?}"),
        }
        assert_eq!(decoded.id, CorrelationId::HANDSHAKE);
        assert!(decoded.target().is_none());
    }

    #[test]
    fn test_malformed_bodies_rejected() {
        let bodies: [&[u8]; 5] = [
            b"not json",
            br#"{"id":1,"type":"request"}"#,
            br#"{"id":1,"type":"bogus"}"#,
            br#"{"id":1,"type":"request","source":"a@b:c","target":"a@b:c:d","expects_response":true,"payload":""}"#,
            br#"{"id":1,"type":"request","source":"a@b:c:d","target":"a@b:c:d","expects_response":true,"payload":"%%%"}"#,
        ];
        for body in bodies {
            assert!(decode_envelope(body).is_err(), "{}", String::from_utf8_lossy(body));
        }
    }
}
