//! Payload codec.
//!
//! Message bodies are a sequence of JSON values separated by a single space.
//! The core only uses [`Encoder`] and [`Decoder`], so the value grammar can be
//! swapped without touching the framer.
//!
//! A Quest reserves a fixed-width slot for its txid, filled in just before the
//! frame is written. Unused slot bytes are spaces, which the decoder skips.

use crate::config::ProtocolConfig;
use crate::{Result, XicError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};

/// Appends encoded values to a buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.buf, value)?;
        self.buf.push(b' ');
        Ok(())
    }

    /// Reserve room for a txid and return the slot offset.
    pub fn reserve_txid_slot(&mut self) -> usize {
        let offset = self.buf.len();
        self.buf
            .resize(offset + ProtocolConfig::TXID_SLOT_WIDTH + 1, b' ');
        offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Write `txid` into a slot reserved by [`Encoder::reserve_txid_slot`].
pub fn patch_txid(buf: &mut [u8], offset: usize, txid: i64) {
    let slot = &mut buf[offset..offset + ProtocolConfig::TXID_SLOT_WIDTH];
    slot.fill(b' ');
    let digits = txid.to_string();
    slot[..digits.len()].copy_from_slice(digits.as_bytes());
}

/// Reads values back out of an encoded body.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
    max_length: usize,
    max_depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            max_length: ProtocolConfig::MAX_MESSAGE_SIZE,
            max_depth: ProtocolConfig::MAX_DECODE_DEPTH,
        }
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Decode the next value.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.buf.len() > self.max_length {
            return Err(XicError::codec(format!(
                "payload of {} bytes exceeds limit {}",
                self.buf.len(),
                self.max_length
            )));
        }
        if !self.more() {
            return Err(XicError::codec("unexpected end of payload"));
        }

        let rest = &self.buf[self.offset..];
        let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<Value>();
        let value = match stream.next() {
            Some(Ok(value)) => value,
            Some(Err(e)) => return Err(XicError::codec(e.to_string())),
            None => return Err(XicError::codec("unexpected end of payload")),
        };
        self.offset += stream.byte_offset();

        let depth = depth_of(&value);
        if depth > self.max_depth {
            return Err(XicError::codec(format!(
                "value nesting depth {} exceeds limit {}",
                depth, self.max_depth
            )));
        }

        serde_json::from_value(value).map_err(|e| XicError::codec(e.to_string()))
    }

    /// Whether another value follows.
    pub fn more(&mut self) -> bool {
        while self.offset < self.buf.len() && self.buf[self.offset].is_ascii_whitespace() {
            self.offset += 1;
        }
        self.offset < self.buf.len()
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        Value::Object(fields) => 1 + fields.values().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}

/// Call payload and return payload: a string-keyed map of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(Map<String, Value>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Project a typed record into arguments. The record must serialize to a map.
    pub fn from_record<T: Serialize + ?Sized>(record: &T) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(XicError::InvalidParams {
                message: format!("record must encode as a map, got {}", kind_of(&other)),
            }),
        }
    }

    /// Project arguments onto a typed record.
    pub fn into_record<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0)).map_err(|e| XicError::InvalidParams {
            message: e.to_string(),
        })
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Arguments {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Arguments {
    type Error = XicError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(XicError::InvalidParams {
                message: format!("arguments must be a map, got {}", kind_of(&other)),
            }),
        }
    }
}

impl Deref for Arguments {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Arguments {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Call context propagated from caller to callee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Map<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Overlay this context on `defaults`; keys present here win.
    pub fn merge_over(&self, defaults: &Context) -> Context {
        let mut merged = defaults.0.clone();
        for (key, value) in &self.0 {
            merged.insert(key.clone(), value.clone());
        }
        Context(merged)
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Deref for Context {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Context {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
