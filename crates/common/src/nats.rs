use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Thin wrapper around a core NATS connection.
///
/// Core pub/sub rather than JetStream on purpose: sensor deliveries are
/// never re-queued by this layer, so there is no ack/redelivery machinery
/// to manage.
pub struct NatsClient {
    client: async_nats::Client,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Successfully connected to NATS");
        Ok(Self { client })
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("Failed to subscribe to {subject}"))
    }

    /// Create a BusPublisher trait object from this client
    pub fn create_publisher(&self) -> Arc<dyn BusPublisher> {
        Arc::new(NatsBusPublisher {
            client: self.client.clone(),
        })
    }

    pub async fn close(self) {
        info!("Closing NATS connection");
        // Connection closes automatically when dropped
    }
}

/// Trait for publishing raw payloads to the bus.
/// Components publish through this seam so bids and job announcements can
/// be exercised without a live broker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;
}

/// Concrete BusPublisher backed by a core NATS client.
pub struct NatsBusPublisher {
    client: async_nats::Client,
}

#[async_trait]
impl BusPublisher for NatsBusPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject, payload)
            .await
            .context("Failed to publish message")?;
        Ok(())
    }
}
