//! Wire envelopes.
//!
//! One JSON object per frame:
//!
//! ```text
//! request:  {"request_id": "...", "request_type": "ECHO", "value": "hi"}
//! response: {"success": true, "message": "", "request_id": "...",
//!            "request_type": "ECHO", "value": "hi"}
//! ```
//!
//! Responses are also accepted with camelCase `requestId` / `requestType`
//! and a capitalized `Value`, and discriminators compare case-insensitively
//! (`Sync` and `SYNC` are the same kind).

use crate::error::{Result, SyncwireError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Generate a fresh correlation token.
///
/// Tokens are random UUIDs and are never pooled, so a late reply to an
/// abandoned exchange can never match a newer one.
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

/// Request discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Echo,
    Sync,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Echo => "ECHO",
            RequestKind::Sync => "SYNC",
        }
    }

    /// Parse a wire discriminator, ignoring ASCII case.
    pub fn from_wire(s: &str) -> Option<Self> {
        [RequestKind::Echo, RequestKind::Sync]
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RequestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RequestKind::from_wire(&s)
            .ok_or_else(|| D::Error::custom(format!("unknown request_type: {}", s)))
    }
}

/// Fields shared by every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub request_id: String,
    pub request_type: RequestKind,
}

impl RequestHeader {
    /// Header with a fresh token.
    pub fn new(kind: RequestKind) -> Self {
        Self {
            request_id: new_token(),
            request_type: kind,
        }
    }
}

/// Fields shared by every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(alias = "requestId")]
    pub request_id: String,
    #[serde(alias = "requestType")]
    pub request_type: String,
}

impl ResponseHeader {
    /// Header answering `request`.
    pub fn answering(request: &RequestHeader, success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            request_id: request.request_id.clone(),
            request_type: request.request_type.as_str().to_string(),
        }
    }

    /// The discriminator, if it names a known kind.
    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_wire(&self.request_type)
    }

    /// Fail with `Remote` when the peer reported failure.
    pub fn ensure_success(&self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(SyncwireError::Remote {
                message: self.message.clone(),
            })
        }
    }
}

/// A typed request whose reply type is known.
pub trait Request: Serialize + Send + Sync {
    type Response: Reply + DeserializeOwned + Send;

    fn header(&self) -> &RequestHeader;
}

/// A typed response.
pub trait Reply {
    fn header(&self) -> &ResponseHeader;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub value: String,
}

impl EchoRequest {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            header: RequestHeader::new(RequestKind::Echo),
            value: value.into(),
        }
    }
}

impl Request for EchoRequest {
    type Response = EchoResponse;

    fn header(&self) -> &RequestHeader {
        &self.header
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    #[serde(flatten)]
    pub header: ResponseHeader,
    #[serde(default, alias = "Value")]
    pub value: String,
}

impl Reply for EchoResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }
}

/// One file's full contents, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(flatten)]
    pub header: RequestHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    pub filename: String,
    pub contents: String,
}

impl SyncRequest {
    /// Build a request for `filename`, encoding `bytes`.
    pub fn new(filename: impl Into<String>, bytes: &[u8], directory: Option<String>) -> Self {
        Self {
            header: RequestHeader::new(RequestKind::Sync),
            directory,
            filename: filename.into(),
            contents: encode_contents(bytes),
        }
    }

    /// Decode the file contents.
    pub fn decode_contents(&self) -> Result<Vec<u8>> {
        decode_contents(&self.contents)
    }
}

impl Request for SyncRequest {
    type Response = SyncResponse;

    fn header(&self) -> &RequestHeader {
        &self.header
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(flatten)]
    pub header: ResponseHeader,
}

impl Reply for SyncResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }
}

/// Base64 (standard alphabet, padded).
pub fn encode_contents(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_contents(encoded: &str) -> Result<Vec<u8>> {
    STANDARD.decode(encoded).map_err(|e| SyncwireError::Serialization {
        message: format!("invalid base64 contents: {}", e),
        source: None,
    })
}

/// Serialize an envelope into one frame.
pub fn encode_frame<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Either spelling is accepted; snake_case wins when both are present.
#[derive(Deserialize)]
struct TokenFields {
    request_id: Option<String>,
    #[serde(rename = "requestId")]
    request_id_camel: Option<String>,
}

/// Pull the correlation token out of a frame without decoding the payload.
pub fn extract_token(frame: &[u8]) -> Option<String> {
    let fields = serde_json::from_slice::<TokenFields>(frame).ok()?;
    fields.request_id.or(fields.request_id_camel)
}
