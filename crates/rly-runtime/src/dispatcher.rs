//! Handler registry and dispatcher
//!
//! Handlers are `(envelope_type, handler_fn)` entries registered at startup.
//! A handler returns its primary result plus any events to cascade; the
//! inbox worker appends those events to the event store and queues them as
//! new outbox messages on the strategy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use rly_domain::{ErrorKind, WorkError};
use rly_ports::{DeliveryReceipt, DispatchOutcome, DispatchRequest, Dispatcher, OutboundEvent};

/// What a handler produced: the primary result and events to auto-publish
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub primary: serde_json::Value,
    pub events: Vec<OutboundEvent>,
}

impl HandlerResult {
    pub fn ok(primary: serde_json::Value) -> Self {
        Self {
            primary,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: OutboundEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Boxed handler future
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerResult, WorkError>> + Send>>;

/// Boxed handler function
pub type HandlerFn = Arc<dyn Fn(DispatchRequest) -> HandlerFuture + Send + Sync>;

struct RegisteredHandler {
    name: String,
    handler: HandlerFn,
}

/// Static handler routing table
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an envelope type
    pub fn register<F, Fut>(
        &mut self,
        envelope_type: impl Into<String>,
        handler_name: impl Into<String>,
        handler: F,
    ) where
        F: Fn(DispatchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResult, WorkError>> + Send + 'static,
    {
        self.handlers.insert(
            envelope_type.into(),
            RegisteredHandler {
                name: handler_name.into(),
                handler: Arc::new(move |request| -> HandlerFuture {
                    Box::pin(handler(request))
                }),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Dispatcher for HandlerRegistry {
    fn handler_name_for(&self, envelope_type: &str) -> Option<String> {
        self.handlers.get(envelope_type).map(|h| h.name.clone())
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, WorkError> {
        let registered = self.handlers.get(&request.envelope_type).ok_or_else(|| {
            WorkError::new(
                ErrorKind::ValidationError,
                format!("no handler registered for {}", request.envelope_type),
            )
        })?;

        let message_id = request.envelope.message_id.clone();
        let handler_name = registered.name.clone();

        let result = (registered.handler)(request).await?;

        debug!(
            message_id = %message_id,
            handler = %handler_name,
            events = result.events.len(),
            "Handler completed"
        );

        Ok(DispatchOutcome {
            receipt: DeliveryReceipt {
                message_id,
                handled_by: handler_name,
                completed_at: Utc::now(),
                result: result.primary,
            },
            events: result.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rly_domain::{Envelope, MessageMetadata, StreamId};

    fn request(envelope_type: &str) -> DispatchRequest {
        DispatchRequest {
            handler_name: "order-handler".to_string(),
            envelope_type: envelope_type.to_string(),
            envelope: Envelope::new(serde_json::json!({"order": 5})),
            metadata: MessageMetadata::default(),
            stream_id: StreamId::from_string("s1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_envelope_type() {
        let mut registry = HandlerRegistry::new();
        registry.register("OrderPlaced", "order-handler", |req: DispatchRequest| async move {
            let order = req.envelope.payload["order"].clone();
            Ok(HandlerResult::ok(serde_json::json!({"accepted": order})))
        });

        let outcome = registry.dispatch(request("OrderPlaced")).await.unwrap();
        assert_eq!(outcome.receipt.handled_by, "order-handler");
        assert_eq!(outcome.receipt.result["accepted"], 5);
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type_fails_validation() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch(request("Unknown")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_handler_events_cascade_through_outcome() {
        let mut registry = HandlerRegistry::new();
        registry.register("OrderPlaced", "order-handler", |_req: DispatchRequest| async move {
            Ok(HandlerResult::ok(serde_json::json!({}))
                .with_event(OutboundEvent {
                    destination: "billing".to_string(),
                    envelope_type: "InvoiceRequested".to_string(),
                    payload: serde_json::json!({"amount": 10}),
                    stream_id: StreamId::from_string("s1".to_string()),
                })
                .with_event(OutboundEvent {
                    destination: "shipping".to_string(),
                    envelope_type: "ShipmentRequested".to_string(),
                    payload: serde_json::json!({}),
                    stream_id: StreamId::from_string("s1".to_string()),
                }))
        });

        let outcome = registry.dispatch(request("OrderPlaced")).await.unwrap();
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0].envelope_type, "InvoiceRequested");
        assert_eq!(outcome.events[1].destination, "shipping");
    }

    #[test]
    fn test_handler_name_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("OrderPlaced", "order-handler", |_req: DispatchRequest| async move {
            Ok(HandlerResult::default())
        });

        assert_eq!(
            registry.handler_name_for("OrderPlaced").as_deref(),
            Some("order-handler")
        );
        assert!(registry.handler_name_for("Unknown").is_none());
    }
}
