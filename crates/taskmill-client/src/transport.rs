//! Transport for shipping event batches to the ingestion server.

use std::time::Duration;

use async_trait::async_trait;
use taskmill_core::error::{MillError, Result};
use taskmill_core::event::EventsWrapper;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstract destination for serialized event batches.
///
/// The pipe only needs a single operation; the trait exists so tests can
/// substitute an in-memory transport for the HTTP one.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Ships one batch. Any error (transport failure or non-success
    /// response) is retried by the caller.
    async fn send_batch(&self, batch: &EventsWrapper) -> Result<()>;
}

/// HTTP transport POSTing batches to `<server>/events` as JSON.
pub struct HttpEventTransport {
    client: reqwest::Client,
    events_url: reqwest::Url,
}

impl HttpEventTransport {
    /// Creates a transport for the given server base URL.
    ///
    /// # Errors
    ///
    /// Returns [`MillError::Config`] when the URL cannot be parsed.
    pub fn new(server_url: &str) -> Result<Self> {
        let base = reqwest::Url::parse(server_url)
            .map_err(|e| MillError::config(format!("Invalid server URL: {e}")))?;
        let events_url = base
            .join("events")
            .map_err(|e| MillError::config(format!("Invalid server URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| MillError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, events_url })
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn send_batch(&self, batch: &EventsWrapper) -> Result<()> {
        let response = self
            .client
            .post(self.events_url.clone())
            .json(batch)
            .send()
            .await
            .map_err(|e| MillError::Http {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 200 {
            tracing::debug!("{} events were sent to the ingestion server", batch.len());
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(MillError::http_status(status.as_u16(), message))
        }
    }
}
