use serde::{Deserialize, Serialize};

use sourcekit_core::{AggregateId, AggregateType, EventMetadata, Version};

/// A committed event together with its stream metadata.
///
/// This is the unit handed to the [`EventBus`](crate::EventBus) after the
/// store accepted the append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    metadata: EventMetadata,
    event_type: String,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(metadata: EventMetadata, event_type: impl Into<String>, payload: E) -> Self {
        Self {
            metadata,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.metadata.aggregate_id
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.metadata.aggregate_type
    }

    pub fn version(&self) -> Version {
        self.metadata.version
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Convert the payload, keeping metadata and event type.
    pub fn map_payload<F, T>(self, f: F) -> EventEnvelope<T>
    where
        F: FnOnce(E) -> T,
    {
        EventEnvelope {
            metadata: self.metadata,
            event_type: self.event_type,
            payload: f(self.payload),
        }
    }
}

/// Envelope shape handed to the bus: payload rendered as JSON.
pub type JsonEventEnvelope = EventEnvelope<serde_json::Value>;

impl<E: Serialize> EventEnvelope<E> {
    pub fn to_json(&self) -> Result<JsonEventEnvelope, serde_json::Error> {
        Ok(EventEnvelope {
            metadata: self.metadata.clone(),
            event_type: self.event_type.clone(),
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}
