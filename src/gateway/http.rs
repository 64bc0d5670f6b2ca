//! HTTP messaging gateway: posts text sends to the gateway's REST API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::MessagingGateway;

/// Gateway client for `{base_url}/message/send-text`.
pub struct HttpGateway {
    base_url: String,
    token: SecretString,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/message/{method}", self.base_url)
    }
}

#[async_trait]
impl MessagingGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn send_text(
        &self,
        instance: Option<&str>,
        phone: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        let url = self.api_url("send-text");
        let body = serde_json::json!({
            "instance": instance,
            "phone": phone,
            "message": text,
        });

        let mut request = self.client.post(&url).json(&body);
        let token = self.token.expose_secret();
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| GatewayError::SendFailed {
            name: self.name().into(),
            reason: e.to_string(),
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            tracing::warn!(status = ?status, phone, "Gateway rejected send: {}", detail);
            return Err(GatewayError::Status {
                url,
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}
