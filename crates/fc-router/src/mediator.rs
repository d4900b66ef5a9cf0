//! HTTP Mediator (C1): performs one egress call per pointer and classifies
//! the outcome. Never retries internally -- retry is the broker's job via
//! nak + visibility.

use async_trait::async_trait;
use fc_common::{MediationOutcome, MessagePointer, WarningCategory, WarningSeverity, WarningSink};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub connect_timeout: Duration,
    pub default_request_timeout: Duration,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(5), default_request_timeout: Duration::from_secs(30) }
    }
}

const RESERVED_REQUEST_HEADERS: &[&str] = &["host", "content-length"];

pub struct HttpMediator {
    client: Client,
    warning_sink: Option<Arc<dyn WarningSink>>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .expect("reqwest client with static TLS backend always builds");
        Self { client, warning_sink: None }
    }

    pub fn with_warning_sink(mut self, sink: Arc<dyn WarningSink>) -> Self {
        self.warning_sink = Some(sink);
        self
    }

    fn warn(&self, message: String) {
        if let Some(sink) = &self.warning_sink {
            sink.warn(WarningCategory::Routing, WarningSeverity::Warn, message, "HttpMediator");
        }
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    #[instrument(skip(self, pointer), fields(pointer_id = %pointer.id))]
    async fn mediate(&self, pointer: &MessagePointer) -> MediationOutcome {
        let mut request = self.client.post(&pointer.mediation_target);

        if let Some(token) = pointer.auth_token.as_ref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let mut saw_content_type = false;
        for (name, value) in &pointer.headers {
            let lower = name.to_ascii_lowercase();
            if RESERVED_REQUEST_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if lower == "content-type" {
                saw_content_type = true;
            }
            request = request.header(name, value);
        }
        if !saw_content_type {
            request = request.header("Content-Type", "application/json");
        }

        request = request.body(pointer.payload.clone()).timeout(pointer.timeout());

        match request.send().await {
            Ok(response) => MediationOutcome::classify(response.status().as_u16()),
            Err(e) if e.is_timeout() => MediationOutcome::timeout(),
            Err(e) => {
                self.warn(format!("transport error delivering {}: {e}", pointer.id));
                MediationOutcome::transport(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pointer(target: String) -> MessagePointer {
        MessagePointer {
            id: "M1".to_string(),
            pool_code: "P".to_string(),
            message_group_id: None,
            mediation_type: fc_common::MediationType::Http,
            mediation_target: target,
            auth_token: Some("secret-token".to_string()),
            payload: b"{\"hello\":true}".to_vec(),
            headers: HashMap::new(),
            timeout_seconds: Some(5),
        }
    }

    #[tokio::test]
    async fn success_response_classifies_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mediator = HttpMediator::new(HttpMediatorConfig::default());
        let outcome = mediator.mediate(&pointer(server.uri())).await;
        assert_eq!(outcome.result, fc_common::MediationResult::Success);
    }

    #[tokio::test]
    async fn not_found_classifies_as_permanent_misconfiguration() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let mediator = HttpMediator::new(HttpMediatorConfig::default());
        let outcome = mediator.mediate(&pointer(server.uri())).await;
        assert_eq!(outcome.result, fc_common::MediationResult::ErrorConfig);
        assert!(outcome.result.is_ack());
    }

    #[tokio::test]
    async fn connection_refused_classifies_as_transport_error() {
        let mediator = HttpMediator::new(HttpMediatorConfig::default());
        let outcome = mediator.mediate(&pointer("http://127.0.0.1:1".to_string())).await;
        assert_eq!(outcome.result, fc_common::MediationResult::ErrorTransport);
    }
}
