//! NATS JetStream transport adapter
//!
//! Durable transport with at-least-once delivery:
//! - One JetStream stream per deployment, wildcard-bound to every
//!   destination subject
//! - Publishes carry a payload-hash `Nats-Msg-Id` so broker-side duplicate
//!   detection drops redelivered publishes inside the window
//! - Subscriptions are durable pull consumers; delivery honors the pause
//!   handle and each message stays unacked until the consumer settles it —
//!   ack once durably recorded, nak for redelivery, term for poison
//!   payloads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy, ReplayPolicy},
    stream::Config as StreamConfig,
    Context as JetStreamContext,
};
use async_nats::Client as NatsClient;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use rly_ports::{
    AckDisposition, PauseHandle, Subscription, Transport, TransportCapabilities,
    TransportDelivery, TransportError,
};

/// Header carrying the envelope's type discriminator
pub const ENVELOPE_TYPE_HEADER: &str = "Relay-Envelope-Type";

/// Header carrying the originating stream id
pub const STREAM_ID_HEADER: &str = "Relay-Stream-Id";

/// NATS JetStream configuration
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// Stream/subject prefix
    pub stream_prefix: String,
    /// Durable consumer name prefix
    pub consumer_prefix: String,
    /// Message TTL in seconds (default: 7 days)
    pub message_ttl_secs: i64,
    /// Duplicate detection window (default: 2 minutes)
    pub duplicate_window_secs: i64,
    /// Per-fetch wait before retrying an empty pull, in milliseconds
    pub fetch_expires_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_prefix: "relay".to_string(),
            consumer_prefix: "relay-consumer".to_string(),
            message_ttl_secs: 7 * 24 * 60 * 60,
            duplicate_window_secs: 120,
            fetch_expires_ms: 500,
        }
    }
}

impl NatsConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("RELAY_NATS_URL").unwrap_or(defaults.url),
            stream_prefix: std::env::var("RELAY_NATS_STREAM_PREFIX")
                .unwrap_or(defaults.stream_prefix),
            consumer_prefix: std::env::var("RELAY_NATS_CONSUMER_PREFIX")
                .unwrap_or(defaults.consumer_prefix),
            message_ttl_secs: std::env::var("RELAY_NATS_MESSAGE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.message_ttl_secs),
            duplicate_window_secs: std::env::var("RELAY_NATS_DUPLICATE_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.duplicate_window_secs),
            fetch_expires_ms: std::env::var("RELAY_NATS_FETCH_EXPIRES_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.fetch_expires_ms),
        }
    }

    fn stream_name(&self) -> String {
        format!("{}-messages", self.stream_prefix)
    }

    fn subject_for(&self, destination: &str) -> String {
        format!("{}.msg.{}", self.stream_prefix, destination)
    }

    fn subject_wildcard(&self) -> String {
        format!("{}.msg.>", self.stream_prefix)
    }

    fn consumer_name(&self, destination: &str) -> String {
        format!("{}-{}", self.consumer_prefix, destination.replace(['.', '>', '*'], "-"))
    }
}

/// Compute the broker dedup id for a payload
fn payload_msg_id(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    format!("sha256:{}", hex::encode(digest))
}

/// NATS JetStream transport
pub struct NatsTransport {
    client: NatsClient,
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsTransport {
    /// Connect to NATS and ensure the message stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self, TransportError> {
        info!(url = %config.url, "Connecting to NATS");

        let client =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| TransportError::ConnectionError {
                    message: format!("Failed to connect to NATS: {}", e),
                })?;

        let jetstream = jetstream::new(client.clone());
        let transport = Self {
            client,
            jetstream,
            config,
        };
        transport.ensure_stream().await?;

        info!("NATS JetStream transport initialized");
        Ok(transport)
    }

    /// Create or update the deployment's message stream
    async fn ensure_stream(&self) -> Result<(), TransportError> {
        let stream_name = self.config.stream_name();
        let stream_config = StreamConfig {
            name: stream_name.clone(),
            subjects: vec![self.config.subject_wildcard()],
            max_age: std::time::Duration::from_secs(self.config.message_ttl_secs as u64),
            duplicate_window: std::time::Duration::from_secs(
                self.config.duplicate_window_secs as u64,
            ),
            ..Default::default()
        };

        match self.jetstream.get_stream(&stream_name).await {
            Ok(_) => {
                debug!(stream = %stream_name, "Stream exists, updating config");
                self.jetstream
                    .update_stream(stream_config)
                    .await
                    .map_err(|e| TransportError::ConnectionError {
                        message: format!("Failed to update stream: {}", e),
                    })?;
            }
            Err(_) => {
                info!(stream = %stream_name, "Creating message stream");
                self.jetstream.create_stream(stream_config).await.map_err(|e| {
                    TransportError::ConnectionError {
                        message: format!("Failed to create stream: {}", e),
                    }
                })?;
            }
        }
        Ok(())
    }
}

impl Transport for NatsTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::PUBLISH_SUBSCRIBE.union(TransportCapabilities::RELIABLE)
    }

    async fn ready(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    #[instrument(skip(self, payload), fields(destination = %destination, envelope_type = %envelope_type))]
    async fn publish(
        &self,
        destination: &str,
        envelope_type: &str,
        stream_id: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let subject = self.config.subject_for(destination);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", payload_msg_id(payload));
        headers.insert(ENVELOPE_TYPE_HEADER, envelope_type.to_string());
        headers.insert(STREAM_ID_HEADER, stream_id.to_string());

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, payload.to_vec().into())
            .await
            .map_err(|e| TransportError::PublishError {
                message: format!("Failed to publish: {}", e),
            })?;

        // Wait for the JetStream ack so "published" means durably accepted
        ack.await.map_err(|e| TransportError::PublishError {
            message: format!("Failed to get publish ack: {}", e),
        })?;

        debug!("Message published to JetStream");
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name())
            .await
            .map_err(|e| TransportError::SubscribeError {
                message: format!("Failed to get stream: {}", e),
            })?;

        let consumer_name = self.config.consumer_name(destination);
        let consumer_config = PullConsumerConfig {
            durable_name: Some(consumer_name.clone()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            filter_subject: self.config.subject_for(destination),
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&consumer_name, consumer_config)
            .await
            .map_err(|e| TransportError::SubscribeError {
                message: format!("Failed to create consumer: {}", e),
            })?;

        info!(
            destination = %destination,
            consumer = %consumer_name,
            "Subscribed to destination"
        );

        Ok(Box::new(NatsSubscription {
            consumer,
            destination: destination.to_string(),
            pause: PauseHandle::new(),
            disposed: Arc::new(AtomicBool::new(false)),
            fetch_expires_ms: self.config.fetch_expires_ms,
            pending: None,
        }))
    }
}

/// A durable pull-consumer subscription
///
/// The JetStream message behind the last delivery is held unacked until the
/// consumer settles it; a crash before settle leaves it in flight and the
/// broker redelivers after the ack wait.
pub struct NatsSubscription {
    consumer: jetstream::consumer::Consumer<PullConsumerConfig>,
    destination: String,
    pause: PauseHandle,
    disposed: Arc<AtomicBool>,
    fetch_expires_ms: u64,
    pending: Option<jetstream::Message>,
}

impl Subscription for NatsSubscription {
    fn next(
        &mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<TransportDelivery>> + Send + '_>>
    {
        Box::pin(async move {
            // An unsettled previous delivery goes back for redelivery
            if let Some(previous) = self.pending.take() {
                if let Err(e) = previous.ack_with(jetstream::AckKind::Nak(None)).await {
                    warn!(error = %e, "Failed to nak unsettled delivery");
                }
            }

            loop {
                if self.disposed.load(Ordering::SeqCst) {
                    return None;
                }
                self.pause.wait_while_paused().await;

                let mut batch = match self
                    .consumer
                    .fetch()
                    .max_messages(1)
                    .expires(std::time::Duration::from_millis(self.fetch_expires_ms))
                    .messages()
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch from consumer");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                match batch.next().await {
                    Some(Ok(message)) => {
                        let envelope_type = message
                            .headers
                            .as_ref()
                            .and_then(|h| h.get(ENVELOPE_TYPE_HEADER))
                            .map(|v| v.as_str().to_string())
                            .unwrap_or_default();
                        let stream_id = message
                            .headers
                            .as_ref()
                            .and_then(|h| h.get(STREAM_ID_HEADER))
                            .map(|v| v.as_str().to_string())
                            .unwrap_or_default();
                        let payload = message.payload.to_vec();

                        drop(batch);
                        self.pending = Some(message);

                        return Some(TransportDelivery {
                            destination: self.destination.clone(),
                            envelope_type,
                            stream_id,
                            payload,
                        });
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to receive message");
                    }
                    // Empty pull; poll again
                    None => {}
                }
            }
        })
    }

    fn settle(
        &mut self,
        disposition: AckDisposition,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let pending = self.pending.take();
        Box::pin(async move {
            let Some(message) = pending else {
                return;
            };
            let result = match disposition {
                AckDisposition::Accept => message.ack().await,
                AckDisposition::Retry => message.ack_with(jetstream::AckKind::Nak(None)).await,
                AckDisposition::Reject => message.ack_with(jetstream::AckKind::Term).await,
            };
            if let Err(e) = result {
                warn!(disposition = ?disposition, error = %e, "Failed to settle delivery");
            }
        })
    }

    fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    fn dispose(&mut self) {
        // A pending message stays unacked; the broker redelivers it
        self.disposed.store(true, Ordering::SeqCst);
    }
}
