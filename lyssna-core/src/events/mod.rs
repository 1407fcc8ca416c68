//! Event model for the in-process bus.
//!
//! An event is a typed, read-only record: an event-type string (the routing
//! channel) plus a map of named attachments. Producers fill attachments
//! before publishing; listeners only ever see a shared reference.

pub mod bus;

use std::collections::BTreeMap;

use bytes::Bytes;
use uuid::Uuid;

/// One attachment value on an event.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Text(String),
    Bytes(Bytes),
    Uuid(Uuid),
    TextList(Vec<String>),
}

impl EventPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EventPayload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            EventPayload::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            EventPayload::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            EventPayload::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// A typed record published on the bus.
///
/// Mutable while the producer holds it; immutable once published, when
/// listeners observe it through a shared reference.
#[derive(Clone, Debug)]
pub struct Event {
    event_type: String,
    attachments: BTreeMap<String, EventPayload>,
}

impl Event {
    pub(crate) fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            attachments: BTreeMap::new(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn attach(&mut self, name: impl Into<String>, payload: EventPayload) {
        self.attachments.insert(name.into(), payload);
    }

    pub fn with(mut self, name: impl Into<String>, payload: EventPayload) -> Self {
        self.attach(name, payload);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EventPayload> {
        self.attachments.get(name)
    }

    pub fn attachments(&self) -> impl Iterator<Item = (&str, &EventPayload)> {
        self.attachments.iter().map(|(k, v)| (k.as_str(), v))
    }
}
