//! In-process transport
//!
//! Channel-backed transport for single-process deployments and tests. One
//! unbounded channel per destination; publishes before the subscriber
//! attaches are buffered. Not durable: capability bitmap advertises
//! publish/subscribe only.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use rly_ports::{
    AckDisposition, PauseHandle, Subscription, Transport, TransportCapabilities,
    TransportDelivery, TransportError,
};

struct Channel {
    sender: mpsc::UnboundedSender<TransportDelivery>,
    receiver: Option<mpsc::UnboundedReceiver<TransportDelivery>>,
}

impl Channel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process channel transport
pub struct InProcessTransport {
    channels: Mutex<HashMap<String, Channel>>,
    ready: AtomicBool,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(true),
        }
    }

    /// Flip readiness; used to exercise the workers' not-ready path
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl Transport for InProcessTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::PUBLISH_SUBSCRIBE
    }

    async fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        destination: &str,
        envelope_type: &str,
        stream_id: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady);
        }
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(destination.to_string())
            .or_insert_with(Channel::new);
        channel
            .sender
            .send(TransportDelivery {
                destination: destination.to_string(),
                envelope_type: envelope_type.to_string(),
                stream_id: stream_id.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::PublishError {
                message: format!("subscriber for '{destination}' is gone"),
            })
    }

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(destination.to_string())
            .or_insert_with(Channel::new);
        let receiver = channel
            .receiver
            .take()
            .ok_or_else(|| TransportError::SubscribeError {
                message: format!("'{destination}' already has a subscriber"),
            })?;

        Ok(Box::new(InProcessSubscription {
            receiver,
            pause: PauseHandle::new(),
            disposed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// One destination's subscription
pub struct InProcessSubscription {
    receiver: mpsc::UnboundedReceiver<TransportDelivery>,
    pause: PauseHandle,
    disposed: Arc<AtomicBool>,
}

impl Subscription for InProcessSubscription {
    fn next(
        &mut self,
    ) -> Pin<Box<dyn std::future::Future<Output = Option<TransportDelivery>> + Send + '_>> {
        Box::pin(async move {
            if self.disposed.load(Ordering::SeqCst) {
                return None;
            }
            self.pause.wait_while_paused().await;
            if self.disposed.load(Ordering::SeqCst) {
                return None;
            }
            self.receiver.recv().await
        })
    }

    fn settle(
        &mut self,
        _disposition: AckDisposition,
    ) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        // Channel deliveries carry no broker-side state to settle
        Box::pin(async {})
    }

    fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    fn dispose(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.receiver.close();
    }
}
