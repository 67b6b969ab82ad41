//! Per-message scopes
//!
//! Scoped resources (DB handles, read-model writers) must outlive handler
//! execution and be released deterministically afterward, on every exit
//! path including panics. The scope releases its resources on `Drop`, in
//! reverse acquisition order.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use rly_domain::MessageId;

/// A resource tied to one message's handling
pub trait ScopedResource: Send {
    fn release(&mut self);
}

type ResourceProvider = Arc<dyn Fn() -> Box<dyn ScopedResource> + Send + Sync>;

/// Builds a scope per handled message
#[derive(Default, Clone)]
pub struct ScopeFactory {
    providers: Vec<ResourceProvider>,
}

impl ScopeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider invoked once per opened scope
    pub fn add_provider<F, R>(&mut self, provider: F)
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: ScopedResource + 'static,
    {
        self.providers
            .push(Arc::new(move || Box::new(provider()) as Box<dyn ScopedResource>));
    }

    pub fn open(&self, message_id: MessageId) -> MessageScope {
        MessageScope {
            message_id,
            opened_at: Instant::now(),
            resources: self.providers.iter().map(|p| p()).collect(),
        }
    }
}

/// One message's resource scope
pub struct MessageScope {
    message_id: MessageId,
    opened_at: Instant,
    resources: Vec<Box<dyn ScopedResource>>,
}

impl MessageScope {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Attach a resource acquired mid-handling
    pub fn attach(&mut self, resource: Box<dyn ScopedResource>) {
        self.resources.push(resource);
    }
}

impl Drop for MessageScope {
    fn drop(&mut self) {
        while let Some(mut resource) = self.resources.pop() {
            resource.release();
        }
        debug!(
            message_id = %self.message_id,
            elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
            "Message scope closed"
        );
    }
}
