//! Wire envelope
//!
//! The transport-level wrapper for every message: `{ MessageId, Hops, Payload }`.
//! The payload's type discriminator travels out-of-band on the transport
//! metadata (`envelope_type` header); the envelope itself stays opaque JSON.
//! `Hops` is an append-only trail recording which service instance touched
//! the message and when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, MessageId};

/// One entry in the envelope's hop trail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hop {
    #[serde(rename = "Type")]
    pub hop_type: String,
    pub timestamp: DateTime<Utc>,
    pub service_instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

/// Transport envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub message_id: MessageId,
    #[serde(default)]
    pub hops: Vec<Hop>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            message_id: MessageId::new(),
            hops: Vec::new(),
            payload,
        }
    }

    pub fn with_message_id(message_id: MessageId, payload: serde_json::Value) -> Self {
        Self {
            message_id,
            hops: Vec::new(),
            payload,
        }
    }

    /// Append a hop to the trail. Hops are never removed or rewritten.
    pub fn record_hop(
        &mut self,
        hop_type: impl Into<String>,
        instance: &InstanceId,
        metadata: &MessageMetadata,
        now: DateTime<Utc>,
    ) {
        self.hops.push(Hop {
            hop_type: hop_type.into(),
            timestamp: now,
            service_instance: instance.as_str().to_string(),
            correlation_id: metadata.correlation_id.clone(),
            causation_id: metadata.causation_id.clone(),
        });
    }
}

/// Typed view over the opaque metadata column carried next to each message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Opaque user/tenant scope propagated to handlers; never interpreted
    /// by the runtime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_scope: Option<serde_json::Value>,
}

impl MessageMetadata {
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    /// Metadata for a message caused by another: correlation carries over,
    /// causation points at the cause.
    pub fn caused_by(&self, cause: &MessageId) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(cause.as_str().to_string()),
            user_scope: self.user_scope.clone(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}
