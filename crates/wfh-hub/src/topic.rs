use chrono::{DateTime, Utc};

use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};

// First segment of every device topic.
const TOPIC_ROOT: &str = "device";
// Payload field carrying the device state.
const STATE_FIELD: &str = "state";
// State value of a device that is online.
const ONLINE: &str = "online";

fn parse_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Parse, description)
}

/// Kind of a device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The device reports whether it is online.
    State,
    /// The device reports a measurement record.
    Record,
}

impl EventKind {
    /// Returns the topic literal of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Record => "record",
        }
    }

    fn from_literal(literal: &str) -> Option<Self> {
        match literal {
            "state" => Some(Self::State),
            "record" => Some(Self::Record),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    device_id: String,
    kind: EventKind,
    payload: Map<String, Value>,
    received_at: DateTime<Utc>,
}

impl DeviceEvent {
    /// Returns the device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the [`EventKind`].
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns the event payload.
    #[must_use]
    pub const fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Returns when the event has been received.
    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Whether a [`EventKind::State`] event reports the device as online.
    ///
    /// Any state other than `online` is considered offline.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.payload.get(STATE_FIELD).and_then(Value::as_str) == Some(ONLINE)
    }

    /// Consumes the event and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }
}

/// Classifier of broker messages.
///
/// Accepted topics have the shape `device/<device_id>/<kind>`, where `kind`
/// is one of the [`EventKind`] literals, and carry a `JSON` object payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicRouter;

impl TopicRouter {
    /// Turns a broker message into a [`DeviceEvent`].
    ///
    /// # Errors
    ///
    /// A parse error is returned when the topic is malformed, the kind is
    /// unknown, the payload is not a `JSON` object, or a state payload lacks
    /// a textual `state` field.
    pub fn classify(topic: &str, payload: &[u8]) -> Result<DeviceEvent> {
        let mut segments = topic.split('/');
        let (Some(root), Some(device_id), Some(literal), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(parse_error(format!(
                "Topic `{topic}` is not made of three segments"
            )));
        };

        if root != TOPIC_ROOT {
            return Err(parse_error(format!(
                "Topic `{topic}` does not start with `{TOPIC_ROOT}`"
            )));
        }

        if device_id.is_empty() {
            return Err(parse_error(format!(
                "Topic `{topic}` has an empty device identifier"
            )));
        }

        // Dot segments would be resolved away in the server `URL`.
        if device_id == "." || device_id == ".." {
            return Err(parse_error(format!(
                "Topic `{topic}` has an invalid device identifier `{device_id}`"
            )));
        }

        let kind = EventKind::from_literal(literal).ok_or_else(|| {
            parse_error(format!("Topic `{topic}` has an unknown kind `{literal}`"))
        })?;

        let Value::Object(payload) = serde_json::from_slice::<Value>(payload)? else {
            return Err(parse_error(format!(
                "Payload of topic `{topic}` is not a JSON object"
            )));
        };

        if kind == EventKind::State
            && !payload.get(STATE_FIELD).is_some_and(Value::is_string)
        {
            return Err(parse_error(format!(
                "State payload of topic `{topic}` lacks a `{STATE_FIELD}` field"
            )));
        }

        Ok(DeviceEvent {
            device_id: device_id.to_string(),
            kind,
            payload,
            received_at: Utc::now(),
        })
    }
}
