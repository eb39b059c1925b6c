//! Book channel frame decoding.
//!
//! Frames on the book channel are JSON arrays:
//! - snapshot: `[chanId, [[price, count, amount], ...]]`, first frame only
//! - update:   `[chanId, [price, count, amount]]`
//! - heartbeat: `[chanId, "hb"]`
//!
//! Control messages are JSON objects such as
//! `{"event": "subscribed", "channel": "book", "chanId": 7}`.

use connector_core::ProtocolError;
use model::BookEntry;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Subscribe request sent once per connection.
#[derive(Debug, Serialize)]
pub struct SubscribeRequest<'a> {
    pub event: &'static str,
    pub channel: &'a str,
    pub symbol: String,
}

impl<'a> SubscribeRequest<'a> {
    pub fn new(channel: &'a str, symbol: &str) -> Self {
        Self {
            event: "subscribe",
            channel: wire_channel(channel),
            symbol: symbol.to_uppercase(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `orderbook` is accepted as an alias of the `book` channel.
fn wire_channel(channel: &str) -> &str {
    match channel {
        "orderbook" => "book",
        other => other,
    }
}

/// A classified frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Snapshot(Vec<BookEntry>),
    Update(BookEntry),
    /// Subscription confirmed for this channel id.
    ChannelAck(u64),
    Heartbeat,
    /// Informational control message with no effect on the book.
    Info,
}

/// Stateful decoder for one connection.
///
/// Caches the channel id from the first frame that carries one and rejects
/// any later frame with a different id. Expects exactly one snapshot, before
/// any update.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    channel_id: Option<u64>,
    snapshot_seen: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_id(&self) -> Option<u64> {
        self.channel_id
    }

    pub fn snapshot_seen(&self) -> bool {
        self.snapshot_seen
    }

    pub fn decode(&mut self, text: &str) -> Result<ParsedFrame, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match value {
            Value::Object(map) => self.decode_event(&map),
            Value::Array(items) => self.decode_data(&items),
            other => Err(ProtocolError::Malformed(format!(
                "unexpected frame: {}",
                other
            ))),
        }
    }

    fn decode_event(&mut self, map: &Map<String, Value>) -> Result<ParsedFrame, ProtocolError> {
        match map.get("event").and_then(Value::as_str) {
            Some("subscribed") => {
                let id = map
                    .get("chanId")
                    .and_then(channel_id_of)
                    .ok_or_else(|| {
                        ProtocolError::Malformed("subscribed event without chanId".to_string())
                    })?;
                self.check_channel(id)?;
                Ok(ParsedFrame::ChannelAck(id))
            }
            Some("error") => {
                let message = map
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                Err(ProtocolError::Rejected(message.to_string()))
            }
            _ => Ok(ParsedFrame::Info),
        }
    }

    fn decode_data(&mut self, items: &[Value]) -> Result<ParsedFrame, ProtocolError> {
        let (id, payload) = match items {
            [id, payload, ..] => (id, payload),
            _ => {
                return Err(ProtocolError::Malformed(format!(
                    "expected [chanId, payload], got {} element(s)",
                    items.len()
                )))
            }
        };
        let id = channel_id_of(id)
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid channel id: {}", id)))?;
        self.check_channel(id)?;

        match payload {
            Value::String(s) if s == "hb" => Ok(ParsedFrame::Heartbeat),
            Value::Array(levels) if levels.first().map_or(true, Value::is_array) => {
                if self.snapshot_seen {
                    return Err(ProtocolError::UnexpectedSnapshot);
                }
                let entries = levels
                    .iter()
                    .map(parse_entry)
                    .collect::<Result<Vec<_>, _>>()?;
                self.snapshot_seen = true;
                Ok(ParsedFrame::Snapshot(entries))
            }
            Value::Array(_) => {
                if !self.snapshot_seen {
                    return Err(ProtocolError::MissingSnapshot);
                }
                Ok(ParsedFrame::Update(parse_entry(payload)?))
            }
            other => Err(ProtocolError::Malformed(format!(
                "unexpected payload: {}",
                other
            ))),
        }
    }

    fn check_channel(&mut self, id: u64) -> Result<(), ProtocolError> {
        match self.channel_id {
            None => {
                self.channel_id = Some(id);
                Ok(())
            }
            Some(expected) if expected == id => Ok(()),
            Some(expected) => Err(ProtocolError::ChannelMismatch {
                expected,
                actual: id,
            }),
        }
    }
}

fn channel_id_of(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

fn parse_entry(value: &Value) -> Result<BookEntry, ProtocolError> {
    match value.as_array().map(Vec::as_slice) {
        Some([price, count, amount]) => Ok(BookEntry::new(
            parse_decimal(price)?,
            parse_decimal(count)?,
            parse_decimal(amount)?,
        )),
        _ => Err(ProtocolError::Malformed(format!(
            "expected [price, count, amount], got {}",
            value
        ))),
    }
}

/// Numbers are parsed from their shortest textual form, so `100.1` becomes
/// exactly `100.1` rather than the nearest binary float.
fn parse_decimal(value: &Value) -> Result<Decimal, ProtocolError> {
    let text = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Decimal::from(i));
            }
            n.to_string()
        }
        Value::String(s) => s.clone(),
        other => {
            return Err(ProtocolError::Malformed(format!(
                "expected a number, got {}",
                other
            )))
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ProtocolError::Malformed(format!("invalid decimal: {}", text)))
}
