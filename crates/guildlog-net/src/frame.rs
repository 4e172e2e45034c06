//! Wire framing for the guild log protocol
//!
//! Frames are JSON arrays of the shape `[kind, payload]`, sent as
//! WebSocket text messages. Kinds in the core protocol: HELLO, HELLO_OK,
//! ERROR, SUB, UNSUB, SNAPSHOT, PUBLISH, EVENT.

use guildlog_core::crypto::KeyPair;
use guildlog_core::event::{signing_digest, Event, EventBody};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol identifier negotiated in HELLO
pub const PROTOCOL: &str = "cgp/0.1";

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a [kind, payload] array")]
    NotAnArray,
    #[error("unknown frame kind: {0}")]
    UnknownKind(String),
    #[error("bad payload for {kind}: {source}")]
    BadPayload {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error codes carried in ERROR frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidFrame,
    InvalidSignature,
    ValidationFailed,
    UnsupportedProtocol,
    InternalError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sub {
    pub sub_id: String,
    pub guild_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unsub {
    pub sub_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub sub_id: String,
    pub guild_id: String,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_seq: Option<u64>,
}

/// A client publish: the unsigned body plus the author's signature over
/// `{body, author, createdAt}`. The relay assigns seq/prevHash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publish {
    pub body: EventBody,
    pub author: String,
    pub signature: String,
    pub created_at: u64,
}

impl Publish {
    /// Sign a body and wrap it for publishing
    pub fn signed(
        keypair: &KeyPair,
        body: EventBody,
        created_at: u64,
    ) -> guildlog_core::Result<Self> {
        let author = keypair.user_id();
        let digest = signing_digest(&body, &author, created_at)?;
        let signature = keypair.sign_digest(&digest)?;
        Ok(Self { body, author, signature, created_at })
    }
}

/// A protocol frame
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Hello(Hello),
    HelloOk(HelloOk),
    Error(ErrorPayload),
    Sub(Sub),
    Unsub(Unsub),
    Snapshot(Snapshot),
    Publish(Publish),
    Event(Box<Event>),
}

impl Frame {
    /// Wire kind string
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "HELLO",
            Frame::HelloOk(_) => "HELLO_OK",
            Frame::Error(_) => "ERROR",
            Frame::Sub(_) => "SUB",
            Frame::Unsub(_) => "UNSUB",
            Frame::Snapshot(_) => "SNAPSHOT",
            Frame::Publish(_) => "PUBLISH",
            Frame::Event(_) => "EVENT",
        }
    }

    /// Serialize to a `[kind, payload]` text frame
    pub fn to_text(&self) -> Result<String, FrameError> {
        let payload = match self {
            Frame::Hello(p) => serde_json::to_value(p)?,
            Frame::HelloOk(p) => serde_json::to_value(p)?,
            Frame::Error(p) => serde_json::to_value(p)?,
            Frame::Sub(p) => serde_json::to_value(p)?,
            Frame::Unsub(p) => serde_json::to_value(p)?,
            Frame::Snapshot(p) => serde_json::to_value(p)?,
            Frame::Publish(p) => serde_json::to_value(p)?,
            Frame::Event(p) => serde_json::to_value(p)?,
        };
        Ok(serde_json::to_string(&Value::Array(vec![
            Value::String(self.kind().to_string()),
            payload,
        ]))?)
    }

    /// Parse a text frame
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(items) = value else {
            return Err(FrameError::NotAnArray);
        };
        let mut items = items.into_iter();
        let (Some(Value::String(kind)), Some(payload)) = (items.next(), items.next()) else {
            return Err(FrameError::NotAnArray);
        };

        fn parse<T: serde::de::DeserializeOwned>(
            kind: &'static str,
            payload: Value,
        ) -> Result<T, FrameError> {
            serde_json::from_value(payload)
                .map_err(|source| FrameError::BadPayload { kind, source })
        }

        match kind.as_str() {
            "HELLO" => Ok(Frame::Hello(parse("HELLO", payload)?)),
            "HELLO_OK" => Ok(Frame::HelloOk(parse("HELLO_OK", payload)?)),
            "ERROR" => Ok(Frame::Error(parse("ERROR", payload)?)),
            "SUB" => Ok(Frame::Sub(parse("SUB", payload)?)),
            "UNSUB" => Ok(Frame::Unsub(parse("UNSUB", payload)?)),
            "SNAPSHOT" => Ok(Frame::Snapshot(parse("SNAPSHOT", payload)?)),
            "PUBLISH" => Ok(Frame::Publish(parse("PUBLISH", payload)?)),
            "EVENT" => Ok(Frame::Event(Box::new(parse("EVENT", payload)?))),
            other => Err(FrameError::UnknownKind(other.to_string())),
        }
    }
}

/// Shorthand for an ERROR frame
pub fn error_frame(code: ErrorCode, message: impl Into<String>) -> Frame {
    Frame::Error(ErrorPayload { code, message: message.into() })
}
