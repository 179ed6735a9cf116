//! Relay wire codec.
//!
//! Every frame is a JSON array whose first element names the command.
//! Client frames: EVENT, REQ, CLOSE, AUTH, COUNT. Relay frames: EVENT, OK,
//! EOSE, CLOSED, NOTICE, AUTH, NOTIFY, COUNT.

use crate::event::Event;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Frames the engine writes.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event
    Event(Event),
    /// Open or replace a subscription
    Req {
        /// Client-chosen id, echoed back in EVENT/EOSE/CLOSED
        subscription_id: String,
        /// Matched as a union; must not be empty
        filters: Vec<Filter>,
    },
    /// End a subscription
    Close {
        /// Id of the REQ to stop
        subscription_id: String,
    },
    /// Signed answer to a relay's AUTH challenge (NIP-42)
    Auth(Event),
    /// Ask for a match count instead of events (NIP-45)
    Count {
        /// Echoed back in the COUNT answer
        subscription_id: String,
        /// Filters to count across
        filters: Vec<Filter>,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => with_filters("REQ", subscription_id, filters)?,
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::Auth(event) => json!(["AUTH", event]),
            ClientMessage::Count {
                subscription_id,
                filters,
            } => with_filters("COUNT", subscription_id, filters)?,
        };
        Ok(value.to_string())
    }

    /// Parse a client frame. Relays and test doubles use this to read what the
    /// engine wrote.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = Frame::parse(json)?;
        match frame.command()? {
            "EVENT" => Ok(ClientMessage::Event(frame.decode(1, "event")?)),
            "AUTH" => Ok(ClientMessage::Auth(frame.decode(1, "event")?)),
            "REQ" => Ok(ClientMessage::Req {
                subscription_id: frame.string(1, "subscription_id")?,
                filters: frame.decode_rest(2)?,
            }),
            "COUNT" => Ok(ClientMessage::Count {
                subscription_id: frame.string(1, "subscription_id")?,
                filters: frame.decode_rest(2)?,
            }),
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: frame.string(1, "subscription_id")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

fn with_filters(command: &str, subscription_id: &str, filters: &[Filter]) -> Result<Value, MessageError> {
    let mut items = Vec::with_capacity(filters.len() + 2);
    items.push(Value::from(command));
    items.push(Value::from(subscription_id));
    for filter in filters {
        items.push(serde_json::to_value(filter)?);
    }
    Ok(Value::Array(items))
}

/// A decoded, non-empty JSON array frame.
struct Frame(Vec<Value>);

impl Frame {
    fn parse(json: &str) -> Result<Self, MessageError> {
        let items: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
        if items.is_empty() {
            return Err(MessageError::InvalidFormat("empty array".to_string()));
        }
        Ok(Self(items))
    }

    fn command(&self) -> Result<&str, MessageError> {
        self.0[0]
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("command is not a string".to_string()))
    }

    fn value(&self, index: usize, field: &str) -> Result<&Value, MessageError> {
        self.0
            .get(index)
            .ok_or_else(|| MessageError::MissingField(field.to_string()))
    }

    fn string(&self, index: usize, field: &str) -> Result<String, MessageError> {
        self.value(index, field)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MessageError::InvalidFormat(format!("{} is not a string", field)))
    }

    /// Trailing free-text fields may be omitted by relays.
    fn text_or_empty(&self, index: usize) -> String {
        self.0
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn decode<T: DeserializeOwned>(&self, index: usize, field: &str) -> Result<T, MessageError> {
        Ok(T::deserialize(self.value(index, field)?)?)
    }

    fn decode_rest<T: DeserializeOwned>(&self, from: usize) -> Result<Vec<T>, MessageError> {
        self.0
            .iter()
            .skip(from)
            .map(|v| T::deserialize(v).map_err(MessageError::from))
            .collect()
    }
}

/// Frames a relay sends.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// An event matching a subscription
    Event {
        /// Subscription the event answers
        subscription_id: String,
        /// The event as the relay sent it
        event: Event,
    },
    /// Answer to an EVENT or AUTH
    Ok {
        /// Id of the event being acknowledged
        event_id: String,
        /// Whether the relay accepted it
        success: bool,
        /// Free text, by convention `"<code>: <reason>"`
        message: String,
    },
    /// Stored events for the subscription are exhausted
    Eose {
        /// Subscription now streaming live
        subscription_id: String,
    },
    /// The relay ended the subscription
    Closed {
        /// Subscription that was ended
        subscription_id: String,
        /// Reason, e.g. `"auth-required: ..."`
        message: String,
    },
    /// Human readable relay message
    Notice {
        /// Notice text
        message: String,
    },
    /// NIP-42 challenge
    Auth {
        /// String to sign into a kind 22242 event
        challenge: String,
    },
    /// Relay text meant for the user rather than the client
    Notify {
        /// Text to show
        message: String,
    },
    /// Answer to a COUNT (NIP-45)
    Count {
        /// Subscription id of the COUNT request
        subscription_id: String,
        /// Number of matching events
        count: u64,
    },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = Frame::parse(json)?;
        match frame.command()? {
            "EVENT" => Ok(RelayMessage::Event {
                subscription_id: frame.string(1, "subscription_id")?,
                event: frame.decode(2, "event")?,
            }),
            "OK" => Ok(RelayMessage::Ok {
                event_id: frame.string(1, "event_id")?,
                success: frame.value(2, "success")?.as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("success is not a boolean".to_string())
                })?,
                message: frame.text_or_empty(3),
            }),
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: frame.string(1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: frame.string(1, "subscription_id")?,
                message: frame.text_or_empty(2),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: frame.string(1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: frame.string(1, "challenge")?,
            }),
            "NOTIFY" => Ok(RelayMessage::Notify {
                message: frame.string(1, "message")?,
            }),
            "COUNT" => {
                let count = frame
                    .value(2, "count")?
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MessageError::InvalidFormat("count is not a number".to_string()))?;
                Ok(RelayMessage::Count {
                    subscription_id: frame.string(1, "subscription_id")?,
                    count,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Serialize to the relay wire form.
    pub fn to_json(&self) -> String {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => json!(["OK", event_id, success, message]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
            RelayMessage::Notify { message } => json!(["NOTIFY", message]),
            RelayMessage::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, { "count": count }]),
        };
        value.to_string()
    }
}

/// Subscription filter.
///
/// The engine never interprets a filter. It serializes it onto the wire and
/// compares filters for equality, so tag queries live in a `BTreeMap` to keep
/// equal filters byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// NIP-50 search term
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// `#<letter>` -> values
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(self, ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            ..self
        }
    }

    pub fn authors(self, authors: Vec<String>) -> Self {
        Self {
            authors: Some(authors),
            ..self
        }
    }

    pub fn kinds(self, kinds: Vec<u16>) -> Self {
        Self {
            kinds: Some(kinds),
            ..self
        }
    }

    /// Window of `created_at` values, either end open.
    pub fn between(self, since: Option<u64>, until: Option<u64>) -> Self {
        Self {
            since,
            until,
            ..self
        }
    }

    pub fn limit(self, limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    pub fn search(self, term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..self
        }
    }

    /// Match events carrying tag `letter` with any of `values`, e.g.
    /// `tag('e', ids)` serializes as `"#e": ids`.
    pub fn tag(mut self, letter: char, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", letter), values);
        self
    }

    /// True if the filter has no constraints at all.
    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }
}
