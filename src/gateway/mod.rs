//! Outbound messaging gateway abstraction.

pub mod http;

use async_trait::async_trait;

use crate::error::GatewayError;

pub use http::HttpGateway;

/// Sends text messages to phone-addressed recipients.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Gateway name for logs.
    fn name(&self) -> &str;

    /// Send `text` to `phone`, through `instance` when the send is tied to a connection.
    async fn send_text(
        &self,
        instance: Option<&str>,
        phone: &str,
        text: &str,
    ) -> Result<(), GatewayError>;
}
