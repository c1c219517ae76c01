//! Message envelope
//!
//! `Envelope` is the only structure that crosses process boundaries. It is
//! encoded as a protobuf message so every backend carries it as opaque bytes.
//!
//! Notes on fields:
//! - `channel`: logical topic root; must be non-empty to be published
//! - `subtopic`: optional dot-delimited suffix
//! - `publisher`: identity of the sending principal, opaque here
//! - `protocol`: originating front-end, e.g. `"coap"`
//! - `payload`: unconstrained bytes
//! - `created`: producer timestamp in nanoseconds since the UNIX epoch; used
//!   for observability only, never for ordering

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub subtopic: String,
    #[prost(string, tag = "3")]
    pub publisher: String,
    #[prost(string, tag = "4")]
    pub protocol: String,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub created: i64,
}

impl Envelope {
    /// Build an envelope for `channel` stamped with the current time.
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            created: now_nanos(),
            ..Default::default()
        }
    }

    pub fn with_subtopic(mut self, subtopic: impl Into<String>) -> Self {
        self.subtopic = subtopic.into();
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(data)
    }
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
