use super::protocol::{ENDPOINT_REPLICATE, ENDPOINT_SYNC, ReplicateRequest, SyncRequest};
use crate::codec::operation::OperationCodec;
use crate::entity::replication::{PassiveLink, ReplicatedOperation, SyncPosition};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Reaches a passive node over HTTP.
///
/// Requests are retried on transport errors. A passive drops a replicated operation
/// it has already applied and a sync frame whose position it has already accepted, so
/// a resend after a lost response is harmless.
pub struct HttpPassiveLink {
    addr: String,
    http_client: reqwest::Client,
    codec: OperationCodec,
    timeout: Duration,
    attempts: usize,
}

impl HttpPassiveLink {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            http_client: reqwest::Client::new(),
            codec: OperationCodec::new(),
            timeout,
            attempts: 3,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn post_with_retry(&self, url: String, body: Vec<u8>) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.clone())
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    async fn post(&self, endpoint: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .post_with_retry(format!("http://{}{}", self.addr, endpoint), body)
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let reason = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("{} failed {}: {}", endpoint, status, reason));
        }
        Ok(())
    }
}

#[async_trait]
impl PassiveLink for HttpPassiveLink {
    async fn replicate(&self, message: &ReplicatedOperation) -> Result<()> {
        let request = ReplicateRequest::from_message(&self.codec, message)?;
        self.post(ENDPOINT_REPLICATE, bincode::serialize(&request)?)
            .await
    }

    async fn sync(&self, position: SyncPosition, frame: &[u8]) -> Result<()> {
        let request = SyncRequest {
            position,
            frame: frame.to_vec(),
        };
        self.post(ENDPOINT_SYNC, bincode::serialize(&request)?).await
    }
}
