//! Relay Runtime
//!
//! The moving parts of a service instance:
//! - `CoordinatorStrategy` — per-instance accumulator feeding one atomic
//!   `process_work_batch` call per flush
//! - `OutboxPublisherWorker` — drains claimed outbox work to the transport
//! - `InboxConsumerWorker` — ingests transport deliveries through the
//!   durable inbox and local handlers
//! - `HandlerRegistry` / `SerializerRegistry` — static routing tables built
//!   at startup
//! - `MessageScope` — per-message resource scope with guaranteed release

pub mod dispatcher;
pub mod inbox_worker;
pub mod outbox_worker;
pub mod registry;
pub mod scope;
pub mod strategy;

pub use dispatcher::{HandlerRegistry, HandlerResult};
pub use inbox_worker::{InboxConsumerWorker, InboxWorkerConfig};
pub use outbox_worker::{OutboxPublisherWorker, OutboxWorkerConfig};
pub use registry::{global_registry, install_global_registry, SerializerRegistry};
pub use scope::{MessageScope, ScopeFactory, ScopedResource};
pub use strategy::{CoordinatorStrategy, FlushOutcome};

use rly_domain::{InstanceDescriptor, InstanceId};

/// Describe this process as a service instance
///
/// Mints a fresh instance id; host name and pid are captured for the
/// registry's operational metadata.
pub fn describe_instance(service_name: impl Into<String>) -> InstanceDescriptor {
    let host_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    InstanceDescriptor {
        instance_id: InstanceId::new(),
        service_name: service_name.into(),
        host_name: host_name.clone(),
        process_id: std::process::id(),
        metadata: serde_json::json!({
            "host_name": host_name,
            "version": env!("CARGO_PKG_VERSION"),
        }),
    }
}
