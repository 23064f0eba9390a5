//! Townhall stream boundary.
//!
//! The conversation lives in an append-only Redis stream. The chronicle
//! worker reads it with open-range, non-destructive XRANGE queries keyed on
//! its watermark, so an abandoned batch stays in place and is re-fetched on
//! the next wake. Speakers write through the same boundary with XADD.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use redis::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};

/// A Redis stream entry id (`millis-seq`), ordered numerically.
///
/// Parsing up front means malformed ids are rejected at the boundary and
/// everything downstream can rely on the `millis-seq` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || MemoryError::InvalidRecord(format!("malformed stream id '{}'", s));
        let (millis, seq) = s.split_once('-').ok_or_else(malformed)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

/// One townhall utterance as read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: StreamId,
    pub role: String,
    pub text: String,
}

/// Role-prefixed transcript for prompt assembly.
pub fn format_transcript(messages: &[StreamMessage]) -> String {
    let mut transcript = String::new();
    for message in messages {
        transcript.push_str(&format!("{}: {}\n\n", message.role, message.text));
    }
    transcript
}

/// Broker boundary. The chronicle worker and speakers only see this trait;
/// the broker's own delivery guarantees stay its business.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Non-destructive read of up to `count` entries strictly after `after`
    /// (from the beginning of the stream when `after` is `None`).
    async fn read_after(
        &self,
        stream: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamMessage>>;

    /// Append an utterance to the stream, returning its assigned id.
    async fn append(&self, stream: &str, role: &str, text: &str) -> Result<StreamId>;

    /// Connectivity check; failure here is fatal at startup.
    async fn ping(&self) -> Result<()>;
}

/// `ChatTransport` over a Redis stream.
pub struct RedisTransport {
    client: redis::Client,
}

impl RedisTransport {
    /// Open a client and verify connectivity before handing it out.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(transport_err)?;
        let transport = Self { client };
        transport.ping().await?;
        info!("Connected to townhall broker at {}", url);
        Ok(transport)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport_err)
    }
}

fn transport_err(e: redis::RedisError) -> MemoryError {
    MemoryError::TransportUnavailable(e.to_string())
}

#[async_trait]
impl ChatTransport for RedisTransport {
    async fn read_after(
        &self,
        stream: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.connection().await?;
        // "(" makes the lower bound exclusive: everything after the cursor.
        let start = match after {
            Some(id) => format!("({}", id),
            None => "-".to_string(),
        };
        let reply: Value = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(transport_err)?;
        parse_entries(reply)
    }

    async fn append(&self, stream: &str, role: &str, text: &str) -> Result<StreamId> {
        let mut conn = self.connection().await?;
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("role")
            .arg(role)
            .arg("text")
            .arg(text)
            .query_async(&mut conn)
            .await
            .map_err(transport_err)?;
        id.parse()
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transport_err)?;
        Ok(())
    }
}

fn parse_entries(reply: Value) -> Result<Vec<StreamMessage>> {
    let entries = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        other => {
            return Err(MemoryError::TransportUnavailable(format!(
                "unexpected xrange reply value type: {:?}",
                other
            )))
        }
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(parts) = entry else { continue };
        let Some(id) = parts.first().and_then(string_value) else {
            continue;
        };
        let fields = parts.get(1).map(field_map).unwrap_or_default();
        let (Some(role), Some(text)) = (fields.get("role"), fields.get("text")) else {
            // Entries written outside the agent protocol are skipped.
            debug!("Skipping stream entry {} without role/text fields", id);
            continue;
        };
        messages.push(StreamMessage {
            id: id.parse()?,
            role: role.clone(),
            text: text.clone(),
        });
    }
    Ok(messages)
}

fn string_value(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(value) => Some(value.clone()),
        _ => None,
    }
}

fn field_map(value: &Value) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    match value {
        Value::Array(items) => {
            for pair in items.chunks(2) {
                let key = pair.first().and_then(string_value);
                let val = pair.get(1).and_then(string_value);
                if let (Some(key), Some(val)) = (key, val) {
                    fields.insert(key, val);
                }
            }
        }
        Value::Map(items) => {
            for (key, val) in items {
                if let (Some(key), Some(val)) = (string_value(key), string_value(val)) {
                    fields.insert(key, val);
                }
            }
        }
        _ => {}
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_round_trips_through_display() {
        let id: StreamId = "1700000000000-4".parse().unwrap();
        assert_eq!(id, StreamId::new(1_700_000_000_000, 4));
        assert_eq!(id.to_string(), "1700000000000-4");
    }

    #[test]
    fn stream_id_orders_numerically_not_lexically() {
        let nine: StreamId = "9-0".parse().unwrap();
        let ten: StreamId = "10-0".parse().unwrap();
        let ten_one: StreamId = "10-1".parse().unwrap();
        assert!(nine < ten);
        assert!(ten < ten_one);
    }

    #[test]
    fn stream_id_rejects_malformed_input() {
        for bad in ["", "12345", "a-b", "100-", "-7", "1-2-3"] {
            assert!(bad.parse::<StreamId>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn transcript_is_role_prefixed() {
        let messages = vec![
            StreamMessage {
                id: StreamId::new(1, 0),
                role: "Mayor".into(),
                text: "Order, please.".into(),
            },
            StreamMessage {
                id: StreamId::new(2, 0),
                role: "Villager".into(),
                text: "The bandits are back!".into(),
            },
        ];
        let transcript = format_transcript(&messages);
        assert_eq!(
            transcript,
            "Mayor: Order, please.\n\nVillager: The bandits are back!\n\n"
        );
    }

    #[test]
    fn parse_entries_skips_malformed_and_foreign_entries() {
        let reply = Value::Array(vec![
            Value::Array(vec![
                Value::BulkString(b"100-0".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"role".to_vec()),
                    Value::BulkString(b"Judge".to_vec()),
                    Value::BulkString(b"text".to_vec()),
                    Value::BulkString(b"Guilty.".to_vec()),
                ]),
            ]),
            // No role/text fields: not part of the agent protocol.
            Value::Array(vec![
                Value::BulkString(b"101-0".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"metric".to_vec()),
                    Value::BulkString(b"42".to_vec()),
                ]),
            ]),
        ]);
        let messages = parse_entries(reply).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, StreamId::new(100, 0));
        assert_eq!(messages[0].role, "Judge");
        assert_eq!(messages[0].text, "Guilty.");
    }

    #[test]
    fn parse_entries_handles_nil_reply() {
        assert!(parse_entries(Value::Nil).unwrap().is_empty());
    }
}
