//! Wire envelopes: the JSON arrays exchanged over a relay WebSocket.
//!
//! Every envelope is `["LABEL", ...payload]`. Parsing runs in two tiers: a
//! hand-written framing scanner slices the top-level array elements without
//! a full parse, and anything the scanner cannot commit to falls back to a
//! full `serde_json` pass. Both tiers accept the same inputs. A parse
//! failure is always recoverable; callers drop the message and keep the
//! connection.

use serde_json::Value;
use thiserror::Error;

use crate::event::Event;
use crate::filter::Filter;

/// Errors from envelope encoding and decoding.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("parse failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", event]` publish
    Event(Event),
    /// `["REQ", sub_id, filter, ...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["COUNT", sub_id, filter, ...]`
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", sub_id]`
    Close(String),
    /// `["AUTH", signed_kind_22242_event]` (NIP-42)
    Auth(Event),
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", sub_id, event]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", sub_id]`
    Eose(String),
    /// `["CLOSED", sub_id, message]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice(String),
    /// `["COUNT", sub_id, {"count": n}]`
    Count { subscription_id: String, count: u64 },
    /// `["AUTH", challenge]` (NIP-42)
    Auth(String),
    /// Any label this client does not understand; ignored by higher layers.
    Unknown { label: String, raw: String },
}

/// Slice the top-level elements of a JSON array without parsing them.
///
/// Returns `None` when the input is not a structurally balanced array;
/// the caller then falls back to the full parser. Structural characters
/// are ASCII, so byte scanning is UTF-8 safe.
fn frame_elements(input: &str) -> Option<Vec<&str>> {
    let s = input.trim();
    let bytes = s.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'[' || bytes[bytes.len() - 1] != b']' {
        return None;
    }

    let mut elems = Vec::new();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut esc = false;
    let mut start = 1usize;
    let end = bytes.len() - 1;

    for i in 1..end {
        let b = bytes[i];
        if in_str {
            if esc {
                esc = false;
            } else if b == b'\\' {
                esc = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => depth = depth.checked_sub(1)?,
            b',' if depth == 0 => {
                elems.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 || in_str {
        return None;
    }
    let last = s[start..end].trim();
    if last.is_empty() {
        if elems.is_empty() {
            return Some(elems);
        }
        return None;
    }
    elems.push(last);
    Some(elems)
}

fn parse_str(elem: &str) -> Result<String, EnvelopeError> {
    Ok(serde_json::from_str(elem)?)
}

fn expect_len(elems: &[&str], at_least: usize, label: &str) -> Result<(), EnvelopeError> {
    if elems.len() < at_least {
        return Err(EnvelopeError::ParseFailed(format!(
            "{label} envelope needs {at_least} elements, got {}",
            elems.len()
        )));
    }
    Ok(())
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let arr: Vec<Value> = match self {
            ClientMessage::Event(event) => {
                vec![Value::from("EVENT"), serde_json::to_value(event)?]
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("REQ"), Value::from(subscription_id.clone())];
                for f in filters {
                    arr.push(serde_json::to_value(f)?);
                }
                arr
            }
            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("COUNT"), Value::from(subscription_id.clone())];
                for f in filters {
                    arr.push(serde_json::to_value(f)?);
                }
                arr
            }
            ClientMessage::Close(subscription_id) => {
                vec![Value::from("CLOSE"), Value::from(subscription_id.clone())]
            }
            ClientMessage::Auth(event) => {
                vec![Value::from("AUTH"), serde_json::to_value(event)?]
            }
        };
        Ok(serde_json::to_string(&arr)?)
    }

    pub fn from_json(input: &str) -> Result<Self, EnvelopeError> {
        if let Some(elems) = frame_elements(input)
            && let Ok(msg) = Self::from_elements(&elems)
        {
            return Ok(msg);
        }
        let value: Value = serde_json::from_str(input)?;
        let arr = value
            .as_array()
            .ok_or_else(|| EnvelopeError::ParseFailed("envelope is not an array".to_string()))?;
        let owned: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        Self::from_elements(&refs)
    }

    fn from_elements(elems: &[&str]) -> Result<Self, EnvelopeError> {
        let label = parse_str(
            elems
                .first()
                .ok_or_else(|| EnvelopeError::ParseFailed("empty envelope".to_string()))?,
        )?;
        match label.as_str() {
            "EVENT" => {
                expect_len(elems, 2, "EVENT")?;
                Ok(ClientMessage::Event(serde_json::from_str(elems[1])?))
            }
            "REQ" | "COUNT" => {
                expect_len(elems, 3, label.as_str())?;
                let subscription_id = parse_str(elems[1])?;
                let mut filters = Vec::with_capacity(elems.len() - 2);
                for elem in &elems[2..] {
                    filters.push(serde_json::from_str(elem)?);
                }
                if label == "REQ" {
                    Ok(ClientMessage::Req {
                        subscription_id,
                        filters,
                    })
                } else {
                    Ok(ClientMessage::Count {
                        subscription_id,
                        filters,
                    })
                }
            }
            "CLOSE" => {
                expect_len(elems, 2, "CLOSE")?;
                Ok(ClientMessage::Close(parse_str(elems[1])?))
            }
            "AUTH" => {
                expect_len(elems, 2, "AUTH")?;
                Ok(ClientMessage::Auth(serde_json::from_str(elems[1])?))
            }
            other => Err(EnvelopeError::ParseFailed(format!(
                "unknown client envelope label: {other}"
            ))),
        }
    }
}

impl RelayMessage {
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let arr: Vec<Value> = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => vec![
                Value::from("EVENT"),
                Value::from(subscription_id.clone()),
                serde_json::to_value(event)?,
            ],
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => vec![
                Value::from("OK"),
                Value::from(event_id.clone()),
                Value::from(*accepted),
                Value::from(message.clone()),
            ],
            RelayMessage::Eose(subscription_id) => {
                vec![Value::from("EOSE"), Value::from(subscription_id.clone())]
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => vec![
                Value::from("CLOSED"),
                Value::from(subscription_id.clone()),
                Value::from(message.clone()),
            ],
            RelayMessage::Notice(message) => {
                vec![Value::from("NOTICE"), Value::from(message.clone())]
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => vec![
                Value::from("COUNT"),
                Value::from(subscription_id.clone()),
                serde_json::json!({ "count": count }),
            ],
            RelayMessage::Auth(challenge) => {
                vec![Value::from("AUTH"), Value::from(challenge.clone())]
            }
            RelayMessage::Unknown { raw, .. } => {
                return Ok(raw.clone());
            }
        };
        Ok(serde_json::to_string(&arr)?)
    }

    pub fn from_json(input: &str) -> Result<Self, EnvelopeError> {
        if let Some(elems) = frame_elements(input)
            && let Ok(msg) = Self::from_elements(&elems, input)
        {
            return Ok(msg);
        }
        let value: Value = serde_json::from_str(input)?;
        let arr = value
            .as_array()
            .ok_or_else(|| EnvelopeError::ParseFailed("envelope is not an array".to_string()))?;
        let owned: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        Self::from_elements(&refs, input)
    }

    fn from_elements(elems: &[&str], raw: &str) -> Result<Self, EnvelopeError> {
        let label = parse_str(
            elems
                .first()
                .ok_or_else(|| EnvelopeError::ParseFailed("empty envelope".to_string()))?,
        )?;
        match label.as_str() {
            "EVENT" => {
                expect_len(elems, 3, "EVENT")?;
                Ok(RelayMessage::Event {
                    subscription_id: parse_str(elems[1])?,
                    event: serde_json::from_str(elems[2])?,
                })
            }
            "OK" => {
                expect_len(elems, 3, "OK")?;
                Ok(RelayMessage::Ok {
                    event_id: parse_str(elems[1])?,
                    accepted: serde_json::from_str(elems[2])?,
                    message: match elems.get(3) {
                        Some(elem) => parse_str(elem)?,
                        None => String::new(),
                    },
                })
            }
            "EOSE" => {
                expect_len(elems, 2, "EOSE")?;
                Ok(RelayMessage::Eose(parse_str(elems[1])?))
            }
            "CLOSED" => {
                expect_len(elems, 2, "CLOSED")?;
                Ok(RelayMessage::Closed {
                    subscription_id: parse_str(elems[1])?,
                    message: match elems.get(2) {
                        Some(elem) => parse_str(elem)?,
                        None => String::new(),
                    },
                })
            }
            "NOTICE" => {
                expect_len(elems, 2, "NOTICE")?;
                Ok(RelayMessage::Notice(parse_str(elems[1])?))
            }
            "COUNT" => {
                expect_len(elems, 3, "COUNT")?;
                #[derive(serde::Deserialize)]
                struct CountPayload {
                    count: u64,
                }
                let payload: CountPayload = serde_json::from_str(elems[2])?;
                Ok(RelayMessage::Count {
                    subscription_id: parse_str(elems[1])?,
                    count: payload.count,
                })
            }
            "AUTH" => {
                expect_len(elems, 2, "AUTH")?;
                Ok(RelayMessage::Auth(parse_str(elems[1])?))
            }
            other => Ok(RelayMessage::Unknown {
                label: other.to_string(),
                raw: raw.to_string(),
            }),
        }
    }
}
