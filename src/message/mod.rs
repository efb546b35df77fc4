//! Message definitions
//!
//! `Message` is what callers publish and what listeners receive. It carries
//! one of three payload kinds, mirroring the text, map and bytes messages of
//! JMS-style brokers, plus string headers that travel with it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// String headers attached to a message, ordered by key.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Map(Map<String, Value>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    Map,
    Bytes,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Text => "TEXT",
            MessageType::Map => "MAP",
            MessageType::Bytes => "BYTES",
        };
        f.write_str(name)
    }
}

impl FromStr for MessageType {
    type Err = String;

    /// Case-insensitive; a blank name means `Text`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "TEXT" => Ok(MessageType::Text),
            "MAP" => Ok(MessageType::Map),
            "BYTES" => Ok(MessageType::Bytes),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            headers: Headers::new(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Payload::Text(body.into()))
    }

    pub fn map(entries: Map<String, Value>) -> Self {
        Self::new(Payload::Map(entries))
    }

    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self::new(Payload::Bytes(body.into()))
    }

    /// Adds or replaces a header. Blank keys are ignored.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if !key.trim().is_empty() {
            self.headers.insert(key, value.into());
        }
        self
    }

    /// Merges `headers` over the ones already present. Blank keys are ignored.
    pub fn merge_headers(&mut self, headers: Headers) {
        for (key, value) in headers {
            if !key.trim().is_empty() {
                self.headers.insert(key, value);
            }
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Text(_) => MessageType::Text,
            Payload::Map(_) => MessageType::Map,
            Payload::Bytes(_) => MessageType::Bytes,
        }
    }

    /// Human readable rendering of the payload, used for logging.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Payload::Text(text) => text.clone(),
            Payload::Map(map) => Value::Object(map.clone()).to_string(),
            Payload::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}
