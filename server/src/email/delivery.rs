//! Email delivery seam.
//!
//! The sender hands a built MIME message to this trait. Sandbox-mode
//! rejections ("recipient unverified") are distinguished from generic
//! failures because retrying them can never succeed.

use std::env;

use async_trait::async_trait;
use derive_more::derive::Display;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};

#[derive(Debug, Display)]
pub enum DeliveryError {
    /// The provider refused the recipient (sandbox mode / unverified
    /// address). Permanent for this message.
    #[display("recipient unverified: {_0}")]
    RecipientUnverified(String),
    #[display("delivery failed: {_0}")]
    Other(String),
}

impl std::error::Error for DeliveryError {}

#[async_trait]
pub trait EmailDelivery: Send + Sync {
    async fn send(&self, message: &lettre::Message) -> Result<(), DeliveryError>;
}

/// SMTP relay delivery. Credentials come from `SMTP_USERNAME` /
/// `SMTP_PASSWORD`; unauthenticated relays work without them.
pub struct SmtpDelivery {
    transport: SmtpTransport,
}

impl SmtpDelivery {
    pub fn new(host: &str) -> anyhow::Result<Self> {
        let mut builder = SmtpTransport::relay(host)?;

        if let (Ok(username), Ok(password)) = (env::var("SMTP_USERNAME"), env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl EmailDelivery for SmtpDelivery {
    async fn send(&self, message: &lettre::Message) -> Result<(), DeliveryError> {
        let transport = self.transport.clone();
        let message = message.clone();

        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DeliveryError::Other(format!("send task panicked: {}", e)))?;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let text = e.to_string();
                if text.to_lowercase().contains("not verified") {
                    Err(DeliveryError::RecipientUnverified(text))
                } else {
                    Err(DeliveryError::Other(text))
                }
            }
        }
    }
}
