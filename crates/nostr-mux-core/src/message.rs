//! Relay protocol messages (NIP-01, NIP-42, NIP-45).
//!
//! - Client to relay: EVENT, REQ, COUNT, CLOSE, AUTH
//! - Relay to client: EVENT, OK, EOSE, CLOSED, COUNT, NOTICE, AUTH
//!
//! Both directions encode to and decode from the JSON array form. The
//! client only ever encodes [`Command`] and decodes [`RelayMessage`]; the
//! opposite direction exists for in-memory relays and tests.

use serde_json::{json, Value};

use crate::error::MessageError;
use crate::event::Event;
use crate::filter::Filter;
use crate::types::{EventId, SubscriptionId};

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `["REQ", <sub_id>, <filter>...]`
    Req {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },

    /// `["COUNT", <sub_id>, <filter>...]`
    Count {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <sub_id>]`
    Close { subscription_id: SubscriptionId },

    /// `["EVENT", <event>]`
    Event(Event),

    /// `["AUTH", <event>]`
    Auth(Event),
}

impl Command {
    /// Short wire name, for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Req { .. } => "REQ",
            Command::Count { .. } => "COUNT",
            Command::Close { .. } => "CLOSE",
            Command::Event(_) => "EVENT",
            Command::Auth(_) => "AUTH",
        }
    }

    /// The subscription this command addresses, if any.
    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            Command::Req { subscription_id, .. }
            | Command::Count { subscription_id, .. }
            | Command::Close { subscription_id } => Some(subscription_id),
            Command::Event(_) | Command::Auth(_) => None,
        }
    }

    /// REQ and COUNT without filters are rejected by relays.
    pub fn is_valid(&self) -> bool {
        match self {
            Command::Req { filters, .. } | Command::Count { filters, .. } => !filters.is_empty(),
            _ => true,
        }
    }

    /// Commands that only make sense on an already-open socket.
    ///
    /// Opening a connection just to CLOSE a subscription or answer an AUTH
    /// challenge from a previous session is pointless.
    pub fn requires_open_connection(&self) -> bool {
        matches!(self, Command::Close { .. } | Command::Auth(_))
    }

    /// Serialize to the JSON array form.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            Command::Req {
                subscription_id,
                filters,
            } => with_filters("REQ", subscription_id, filters)?,
            Command::Count {
                subscription_id,
                filters,
            } => with_filters("COUNT", subscription_id, filters)?,
            Command::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            Command::Event(event) => json!(["EVENT", event]),
            Command::Auth(event) => json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }

    /// Parse the JSON array form.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let arr = parse_array(text)?;
        match label_of(&arr)? {
            "REQ" => Ok(Command::Req {
                subscription_id: subscription_at(&arr, 1)?,
                filters: filters_from(&arr[2..])?,
            }),
            "COUNT" => Ok(Command::Count {
                subscription_id: subscription_at(&arr, 1)?,
                filters: filters_from(&arr[2..])?,
            }),
            "CLOSE" => Ok(Command::Close {
                subscription_id: subscription_at(&arr, 1)?,
            }),
            "EVENT" => Ok(Command::Event(event_at(&arr, 1)?)),
            "AUTH" => Ok(Command::Auth(event_at(&arr, 1)?)),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", <sub_id>, <event>]`
    Event {
        subscription_id: SubscriptionId,
        event: Event,
    },

    /// `["OK", <event_id>, <bool>, <message>]`
    Ok {
        event_id: EventId,
        success: bool,
        message: String,
    },

    /// `["EOSE", <sub_id>]`
    Eose { subscription_id: SubscriptionId },

    /// `["CLOSED", <sub_id>, <message>]`
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },

    /// `["COUNT", <sub_id>, {"count": <n>}]`
    Count {
        subscription_id: SubscriptionId,
        count: u64,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },

    /// `["AUTH", <challenge>]`
    Auth { challenge: String },
}

impl RelayMessage {
    /// Parse a JSON message received from a relay.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let arr = parse_array(text)?;
        match label_of(&arr)? {
            "EVENT" => Ok(RelayMessage::Event {
                subscription_id: subscription_at(&arr, 1)?,
                event: event_at(&arr, 2)?,
            }),
            "OK" => {
                let event_id = EventId::from_hex(str_at(&arr, 1, "event_id")?)?;
                let success = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(MessageError::MissingField("success"))?;
                // Some relays omit the message; treat it as empty.
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: subscription_at(&arr, 1)?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: subscription_at(&arr, 1)?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            "COUNT" => {
                let count = arr
                    .get(2)
                    .and_then(|v| v.get("count"))
                    .and_then(Value::as_u64)
                    .ok_or(MessageError::MissingField("count"))?;
                Ok(RelayMessage::Count {
                    subscription_id: subscription_at(&arr, 1)?,
                    count,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice {
                message: str_at(&arr, 1, "message")?.to_string(),
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(&arr, 1, "challenge")?.to_string(),
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Serialize to the JSON array form.
    pub fn to_json(&self) -> Result<String, MessageError> {
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
            RelayMessage::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, { "count": count }]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
        };
        Ok(value.to_string())
    }

    /// The subscription this message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            RelayMessage::Event { subscription_id, .. }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed { subscription_id, .. }
            | RelayMessage::Count { subscription_id, .. } => Some(subscription_id),
            _ => None,
        }
    }
}

fn with_filters(
    label: &str,
    subscription_id: &SubscriptionId,
    filters: &[Filter],
) -> Result<Value, MessageError> {
    let mut arr = Vec::with_capacity(filters.len() + 2);
    arr.push(Value::from(label));
    arr.push(Value::from(subscription_id.as_str()));
    for filter in filters {
        arr.push(serde_json::to_value(filter)?);
    }
    Ok(Value::Array(arr))
}

fn parse_array(text: &str) -> Result<Vec<Value>, MessageError> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(arr) if !arr.is_empty() => Ok(arr),
        Value::Array(_) => Err(MessageError::InvalidFormat("empty array".into())),
        _ => Err(MessageError::InvalidFormat("not a JSON array".into())),
    }
}

fn label_of(arr: &[Value]) -> Result<&str, MessageError> {
    arr[0]
        .as_str()
        .ok_or_else(|| MessageError::InvalidFormat("first element not a string".into()))
}

fn str_at<'a>(arr: &'a [Value], idx: usize, field: &'static str) -> Result<&'a str, MessageError> {
    arr.get(idx)
        .and_then(Value::as_str)
        .ok_or(MessageError::MissingField(field))
}

fn subscription_at(arr: &[Value], idx: usize) -> Result<SubscriptionId, MessageError> {
    Ok(SubscriptionId::new(str_at(arr, idx, "subscription_id")?)?)
}

fn event_at(arr: &[Value], idx: usize) -> Result<Event, MessageError> {
    let value = arr.get(idx).ok_or(MessageError::MissingField("event"))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn filters_from(values: &[Value]) -> Result<Vec<Filter>, MessageError> {
    values
        .iter()
        .map(|v| serde_json::from_value(v.clone()).map_err(MessageError::from))
        .collect()
}
