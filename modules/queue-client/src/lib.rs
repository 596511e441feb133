//! HTTP client for a pull-based message queue.
//!
//! Three calls: publish a message, pull a leased batch, and settle leases by
//! acking or retrying them. Unsettled leases expire after the visibility
//! timeout and the queue redelivers the message.

pub mod error;

pub use error::{QueueError, Result};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

pub struct QueueClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// A leased message returned by [`QueueClient::pull`].
#[derive(Debug, Clone, Deserialize)]
pub struct PulledMessage {
    pub lease_id: String,
    pub id: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub timestamp_ms: i64,
    pub body: serde_json::Value,
}

impl PulledMessage {
    /// The body as JSON. Bodies published as text are parsed; anything that
    /// is not JSON text is returned unchanged.
    pub fn json_body(&self) -> serde_json::Value {
        match &self.body {
            serde_json::Value::String(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| self.body.clone())
            }
            other => other.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PullResult {
    #[serde(default)]
    messages: Vec<PulledMessage>,
}

#[derive(Debug, Serialize)]
struct LeaseRef<'a> {
    lease_id: &'a str,
}

impl QueueClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, queue: &str, path: &str) -> String {
        format!("{}/queues/{}/messages{}", self.base_url, queue, path)
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(QueueError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }

    /// Publish one JSON body to `queue`.
    pub async fn publish(&self, queue: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .post(&self.endpoint(queue, ""))
            .json(&json!({ "body": body, "content_type": "json" }))
            .send()
            .await?;
        Self::check(resp).await?;

        debug!(queue, "Published message");
        Ok(())
    }

    /// Lease up to `batch_size` messages for `visibility_timeout`.
    pub async fn pull(
        &self,
        queue: &str,
        batch_size: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<PulledMessage>> {
        let resp = self
            .post(&self.endpoint(queue, "/pull"))
            .json(&json!({
                "batch_size": batch_size,
                "visibility_timeout_ms": visibility_timeout.as_millis() as u64,
            }))
            .send()
            .await?;
        let envelope: Envelope<PullResult> = Self::check(resp).await?.json().await?;

        if envelope.success == Some(false) {
            return Err(QueueError::Decode("pull reported success=false".into()));
        }
        Ok(envelope.result.map(|r| r.messages).unwrap_or_default())
    }

    /// Ack and retry leases in one call. Retried messages become visible
    /// again after `retry_delay`.
    pub async fn settle(
        &self,
        queue: &str,
        acks: &[String],
        retries: &[String],
        retry_delay: Duration,
    ) -> Result<()> {
        if acks.is_empty() && retries.is_empty() {
            return Ok(());
        }

        let acks: Vec<LeaseRef<'_>> = acks.iter().map(|id| LeaseRef { lease_id: id }).collect();
        let retries: Vec<serde_json::Value> = retries
            .iter()
            .map(|id| json!({ "lease_id": id, "delay_seconds": retry_delay.as_secs() }))
            .collect();

        let resp = self
            .post(&self.endpoint(queue, "/ack"))
            .json(&json!({ "acks": acks, "retries": retries }))
            .send()
            .await?;
        Self::check(resp).await?;

        debug!(queue, acked = acks.len(), retried = retries.len(), "Settled leases");
        Ok(())
    }
}
