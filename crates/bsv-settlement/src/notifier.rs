//! HTTP webhook delivery of settlement events.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::collaborators::Notifier;
use crate::config::WebhookConfig;
use crate::SettlementError;

#[derive(Serialize)]
struct Envelope<'a> {
    merchant_id: &'a str,
    event: &'a str,
    payload: &'a Value,
}

/// POSTs `{merchant_id, event, payload}` to a fixed URL.
///
/// Server errors, throttling and transport failures are retried up to
/// `max_attempts` times with linear backoff; other 4xx answers are final.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, SettlementError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SettlementError::Config(format!("webhook client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn retryable(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, merchant_id: &str, event: &str, payload: Value) -> Result<(), SettlementError> {
        let body = serde_json::to_vec(&Envelope {
            merchant_id,
            event,
            payload: &payload,
        })
        .map_err(|e| SettlementError::Notification(e.to_string()))?;

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            let sent = self
                .client
                .post(&self.config.url)
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body.clone())
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status().is_success() => {
                    debug!(merchant = merchant_id, event, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(resp) if !Self::retryable(resp.status()) => {
                    return Err(SettlementError::Notification(format!(
                        "webhook rejected {} event with {}",
                        event,
                        resp.status()
                    )));
                }
                Ok(resp) => last_error = format!("status {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            warn!(merchant = merchant_id, event, attempt, error = %last_error, "webhook attempt failed");
            if attempt < self.config.max_attempts {
                sleep(self.config.retry_backoff * attempt).await;
            }
        }
        Err(SettlementError::Notification(format!(
            "{} event undelivered after {} attempts: {}",
            event, self.config.max_attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(server: &MockServer) -> WebhookConfig {
        WebhookConfig {
            url: format!("{}/hooks/settlement", server.uri()),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_delivers_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/settlement"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({
                "merchant_id": "m1",
                "event": "balance_update",
                "payload": {"incoming": 5000}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(&server)).expect("client");
        notifier
            .notify("m1", "balance_update", json!({"incoming": 5000}))
            .await
            .expect("delivered");
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(&server)).expect("client");
        notifier.notify("m1", "balance_update", json!({})).await.expect("third try");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(&server)).expect("client");
        let err = notifier.notify("m1", "balance_update", json!({})).await.expect_err("undelivered");
        assert!(matches!(err, SettlementError::Notification(_)));
    }

    #[tokio::test]
    async fn test_client_error_is_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(&server)).expect("client");
        let err = notifier.notify("m1", "balance_update", json!({})).await.expect_err("rejected");
        assert!(err.to_string().contains("404"));
    }
}
