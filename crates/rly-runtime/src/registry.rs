//! Serializer registry
//!
//! Maps envelope type tags to payload validators so the inbox worker can
//! decode transport deliveries. The registry is built explicitly at program
//! start (static construction, no runtime reflection) and passed into the
//! workers. A process-wide copy can be installed once via
//! `install_global_registry`; it lives for the remainder of the process —
//! there is no teardown short of exit.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use rly_domain::{Envelope, WorkError};

/// Payload shape validator for one envelope type
pub type PayloadValidator = Arc<dyn Fn(&serde_json::Value) -> Result<(), WorkError> + Send + Sync>;

/// Envelope type tag → validator table
#[derive(Default)]
pub struct SerializerRegistry {
    types: HashMap<String, PayloadValidator>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type with a payload validator
    pub fn register<F>(&mut self, envelope_type: impl Into<String>, validate: F)
    where
        F: Fn(&serde_json::Value) -> Result<(), WorkError> + Send + Sync + 'static,
    {
        self.types.insert(envelope_type.into(), Arc::new(validate));
    }

    /// Register a type whose payload is accepted as-is
    pub fn register_opaque(&mut self, envelope_type: impl Into<String>) {
        self.register(envelope_type, |_| Ok(()));
    }

    pub fn contains(&self, envelope_type: &str) -> bool {
        self.types.contains_key(envelope_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Decode a delivery's payload bytes into an envelope
    ///
    /// Fails on an unregistered type tag, malformed JSON, or a payload the
    /// type's validator rejects — all `SERIALIZATION_ERROR`s, usually
    /// terminal.
    pub fn decode_envelope(
        &self,
        envelope_type: &str,
        payload: &[u8],
    ) -> Result<Envelope, WorkError> {
        let validate = self.types.get(envelope_type).ok_or_else(|| {
            WorkError::serialization(format!("unregistered envelope type: {envelope_type}"))
        })?;
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| WorkError::serialization(e.to_string()))?;
        validate(&envelope.payload)?;
        Ok(envelope)
    }
}

static GLOBAL_REGISTRY: OnceCell<Arc<SerializerRegistry>> = OnceCell::new();

/// Install the process-wide registry; returns false if one is already set
pub fn install_global_registry(registry: Arc<SerializerRegistry>) -> bool {
    GLOBAL_REGISTRY.set(registry).is_ok()
}

/// The process-wide registry, if installed
pub fn global_registry() -> Option<Arc<SerializerRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_registered_type() {
        let mut registry = SerializerRegistry::new();
        registry.register_opaque("OrderPlaced");

        let payload = br#"{"MessageId": "msg_01", "Hops": [], "Payload": {"order": 9}}"#;
        let envelope = registry.decode_envelope("OrderPlaced", payload).unwrap();
        assert_eq!(envelope.message_id.as_str(), "msg_01");
        assert_eq!(envelope.payload["order"], 9);
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let registry = SerializerRegistry::new();
        let err = registry
            .decode_envelope("Unknown", br#"{"MessageId":"m","Payload":{}}"#)
            .unwrap_err();
        assert_eq!(err.kind, rly_domain::ErrorKind::SerializationError);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let mut registry = SerializerRegistry::new();
        registry.register_opaque("OrderPlaced");
        assert!(registry.decode_envelope("OrderPlaced", b"not json").is_err());
    }

    #[test]
    fn test_validator_runs_on_payload() {
        let mut registry = SerializerRegistry::new();
        registry.register("OrderPlaced", |payload| {
            if payload.get("order").is_some() {
                Ok(())
            } else {
                Err(WorkError::validation("missing order field"))
            }
        });

        let good = br#"{"MessageId": "msg_01", "Hops": [], "Payload": {"order": 1}}"#;
        assert!(registry.decode_envelope("OrderPlaced", good).is_ok());

        let bad = br#"{"MessageId": "msg_02", "Hops": [], "Payload": {}}"#;
        assert!(registry.decode_envelope("OrderPlaced", bad).is_err());
    }
}
