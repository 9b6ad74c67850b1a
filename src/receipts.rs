//! Best-effort receipt archival.
//!
//! Workload receipts (the reply envelope minus the bare result) are posted to
//! an external HTTP store for audit. Upload failures are logged and counted,
//! never propagated: archival must not block or fail response submission.

use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::metrics::Metrics;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ReceiptsClient {
    http: reqwest::Client,
    endpoint: Url,
    metrics: Arc<Metrics>,
}

impl ReceiptsClient {
    /// Builds a client for `<base>/agent-receipts`.
    pub fn new(base: &Url, metrics: Arc<Metrics>) -> Result<Self, ReceiptsError> {
        let endpoint = base.join("agent-receipts")?;
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(ReceiptsError::Client)?;
        Ok(Self {
            http,
            endpoint,
            metrics,
        })
    }

    /// Uploads one receipt, keyed by the request id. Never returns an error;
    /// the outcome is visible in logs and metrics only.
    pub async fn upload(&self, request_id: &str, receipt: &serde_json::Value) {
        let result = self
            .http
            .post(self.endpoint.clone())
            .query(&[("requestId", request_id)])
            .json(receipt)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        match result {
            Ok(_) => {
                self.metrics.receipt_uploads.inc();
                tracing::debug!(request_id, "receipt archived");
            }
            Err(error) => {
                self.metrics.receipt_upload_failures.inc();
                tracing::warn!(request_id, %error, "receipt upload failed");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiptsError {
    #[error("invalid receipts service url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_joined_from_base() {
        let base = Url::parse("https://receipts.example.test/").unwrap();
        let client = ReceiptsClient::new(&base, Metrics::new()).unwrap();
        assert_eq!(
            client.endpoint.as_str(),
            "https://receipts.example.test/agent-receipts"
        );
    }
}
