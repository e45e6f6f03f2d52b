use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::resource::ResourceDeliveryMessage;
use crate::subscription::Endpoint;

const DEFAULT_BODY: &str = "A subscription update has been received";

/// Outbound mail server settings shared by every email subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailTransportConfig {
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    pub port: u16,
    /// Sender used when the subscription names none.
    pub from: String,
    /// Subject used when the subscription names none.
    pub subject: String,
}

impl Default for EmailTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            from: "noreply@unknown.com".to_string(),
            subject: "Resource change notification".to_string(),
        }
    }
}

/// A rendered notification email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl EmailMessage {
    /// Renders the email for `message` using the subscription's mail
    /// parameters, falling back to the transport defaults.
    pub fn render(transport: &EmailTransportConfig, message: &ResourceDeliveryMessage) -> Result<Self, DeliveryError> {
        let Endpoint::Email { to, from, subject } = message.subscription().endpoint() else {
            return Err(DeliveryError::EndpointMismatch {
                reason: format!("subscription {} has no email endpoint", message.subscription_id),
            });
        };

        let from = from
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(transport.from.as_str())
            .to_string();
        let subject = subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(transport.subject.as_str())
            .to_string();
        let body = match message.payload.as_deref() {
            Some(payload) if !payload.is_empty() => payload.to_string(),
            _ => DEFAULT_BODY.to_string(),
        };

        Ok(Self {
            from,
            to: to.clone(),
            subject,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::resource::{ResourceModifiedMessage, ResourceOperation};
    use crate::subscription::{ActiveSubscription, Criteria, PayloadContent, SubscriptionId};

    fn delivery(endpoint: Endpoint, payload: PayloadContent) -> ResourceDeliveryMessage {
        let sub = ActiveSubscription::new(
            SubscriptionId::new("mail-1").unwrap(),
            Criteria::parse("Observation").unwrap(),
            endpoint,
        )
        .unwrap()
        .with_payload(payload);
        let msg = ResourceModifiedMessage::builder("Observation", "o1", ResourceOperation::Create)
            .build()
            .unwrap();
        ResourceDeliveryMessage::for_match(&Arc::new(sub), &msg).unwrap()
    }

    #[test]
    fn falls_back_to_transport_defaults() {
        let transport = EmailTransportConfig::default();
        let email = EmailMessage::render(&transport, &delivery(Endpoint::email("a@b.org"), PayloadContent::Empty)).unwrap();
        assert_eq!(email.from, transport.from);
        assert_eq!(email.subject, transport.subject);
        assert_eq!(email.to, vec!["a@b.org".to_string()]);
        assert_eq!(email.body, DEFAULT_BODY);
    }

    #[test]
    fn subscription_parameters_win() {
        let endpoint = Endpoint::Email {
            to: vec!["x@y.org".to_string()],
            from: Some("alerts@y.org".to_string()),
            subject: Some("Lab result".to_string()),
        };
        let email = EmailMessage::render(
            &EmailTransportConfig::default(),
            &delivery(endpoint, PayloadContent::IdOnly),
        )
        .unwrap();
        assert_eq!(email.from, "alerts@y.org");
        assert_eq!(email.subject, "Lab result");
        assert_eq!(email.body, "Observation/o1");
    }

    #[test]
    fn non_email_endpoint_is_mismatch() {
        let err = EmailMessage::render(
            &EmailTransportConfig::default(),
            &delivery(Endpoint::rest_hook("http://h/cb"), PayloadContent::Full),
        )
        .unwrap_err();
        assert!(matches!(err, DeliveryError::EndpointMismatch { .. }));
    }
}
