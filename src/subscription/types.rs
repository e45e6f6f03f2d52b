//! Subscription identity, endpoints and status.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, ValidationError};
use crate::resource::ResourceModifiedMessage;

use super::criteria::Criteria;

static SUBSCRIPTION_ID_RE: OnceLock<Regex> = OnceLock::new();

fn subscription_id_re() -> &'static Regex {
    SUBSCRIPTION_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-.]{1,64}$").expect("static regex"))
}

/// Logical id of a subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wraps a persisted id after checking its shape.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let trimmed = id.trim();
        if !subscription_id_re().is_match(trimmed) {
            return Err(ValidationError::InvalidSubscriptionId { value: id });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Creates a new random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Delivery mechanism of a subscription.
///
/// This is a closed set: a new mechanism is a new variant plus a new
/// [`crate::delivery::DeliverySubscriber`] arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    /// HTTP callback.
    RestHook,
    Email,
    /// Push over an open socket session.
    #[serde(rename = "websocket")]
    WebSocket,
}

impl ChannelType {
    pub const ALL: [Self; 3] = [Self::RestHook, Self::Email, Self::WebSocket];

    /// Stable code used in channel names and configuration.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::RestHook => "rest-hook",
            Self::Email => "email",
            Self::WebSocket => "websocket",
        }
    }

    /// Name of the matching channel feeding this type's engine.
    #[must_use]
    pub fn matching_channel_name(self) -> String {
        format!("subscription-matching-{}", self.code())
    }

    /// Name of the delivery channel of subscription `id`.
    #[must_use]
    pub fn delivery_channel_name(self, id: &SubscriptionId) -> String {
        format!("subscription-delivery-{}-{}", self.code(), id)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ChannelType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest-hook" | "resthook" => Ok(Self::RestHook),
            "email" => Ok(Self::Email),
            "websocket" => Ok(Self::WebSocket),
            other => Err(ConfigurationError::UnsupportedChannelType {
                channel_type: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "REQUESTED",
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Off => "OFF",
        };
        f.write_str(s)
    }
}

/// What a delivery carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadContent {
    /// The full resource body as JSON.
    #[default]
    Full,
    /// Only the `Type/id` reference.
    IdOnly,
    /// No body; the notification itself is the signal.
    Empty,
}

impl PayloadContent {
    /// Renders `message` according to this preference.
    pub fn render(self, message: &ResourceModifiedMessage) -> Result<Option<String>, serde_json::Error> {
        match self {
            Self::Full => serde_json::to_string(&message.content()).map(Some),
            Self::IdOnly => Ok(Some(message.reference())),
            Self::Empty => Ok(None),
        }
    }

    /// Content type of the rendered body, if any.
    #[must_use]
    pub const fn content_type(self) -> Option<&'static str> {
        match self {
            Self::Full => Some("application/json"),
            Self::IdOnly => Some("text/plain"),
            Self::Empty => None,
        }
    }
}

/// Destination of a subscription, one shape per [`ChannelType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Endpoint {
    RestHook {
        url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<(String, String)>,
    },
    Email {
        to: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    WebSocket {
        session_id: String,
    },
}

impl Endpoint {
    /// HTTP callback endpoint without extra headers.
    #[must_use]
    pub fn rest_hook(url: impl Into<String>) -> Self {
        Self::RestHook {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Email endpoint for a single recipient.
    #[must_use]
    pub fn email(to: impl Into<String>) -> Self {
        Self::Email {
            to: vec![to.into()],
            from: None,
            subject: None,
        }
    }

    /// Socket endpoint bound to an open session.
    #[must_use]
    pub fn web_socket(session_id: impl Into<String>) -> Self {
        Self::WebSocket {
            session_id: session_id.into(),
        }
    }

    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        match self {
            Self::RestHook { .. } => ChannelType::RestHook,
            Self::Email { .. } => ChannelType::Email,
            Self::WebSocket { .. } => ChannelType::WebSocket,
        }
    }

    /// Checks the endpoint and normalizes `mailto:` recipients.
    pub fn normalized(self) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidEndpoint {
            channel_type: self.channel_type().code().to_string(),
            reason: reason.to_string(),
        };

        match &self {
            Self::RestHook { url, headers } => {
                let url = url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid("url must be http(s)"));
                }
                if url.len() <= "https://".len() && url.ends_with("//") {
                    return Err(invalid("url has no host"));
                }
                if headers.iter().any(|(k, _)| k.trim().is_empty()) {
                    return Err(invalid("header name is empty"));
                }
                Ok(Self::RestHook {
                    url: url.to_string(),
                    headers: headers.clone(),
                })
            }
            Self::Email { to, from, subject } => {
                if to.is_empty() {
                    return Err(invalid("no recipients"));
                }
                let mut recipients = Vec::with_capacity(to.len());
                for addr in to {
                    let addr = addr.trim();
                    let addr = addr.strip_prefix("mailto:").unwrap_or(addr).trim();
                    if !addr.contains('@') {
                        return Err(invalid("recipient is not an email address"));
                    }
                    recipients.push(addr.to_string());
                }
                Ok(Self::Email {
                    to: recipients,
                    from: from.clone(),
                    subject: subject.clone(),
                })
            }
            Self::WebSocket { session_id } => {
                if session_id.trim().is_empty() {
                    return Err(invalid("session id is empty"));
                }
                Ok(Self::WebSocket {
                    session_id: session_id.trim().to_string(),
                })
            }
        }
    }
}

/// A subscription as held by the registry.
#[derive(Debug, Clone)]
pub struct ActiveSubscription {
    id: SubscriptionId,
    criteria: Criteria,
    endpoint: Endpoint,
    channel_name: String,
    payload_content: PayloadContent,
    status: SubscriptionStatus,
}

impl ActiveSubscription {
    /// Builds a subscription in `REQUESTED` state.
    pub fn new(id: SubscriptionId, criteria: Criteria, endpoint: Endpoint) -> Result<Self, ValidationError> {
        let endpoint = endpoint.normalized()?;
        let channel_name = endpoint.channel_type().delivery_channel_name(&id);
        Ok(Self {
            id,
            criteria,
            endpoint,
            channel_name,
            payload_content: PayloadContent::default(),
            status: SubscriptionStatus::Requested,
        })
    }

    #[must_use]
    pub const fn with_payload(mut self, payload_content: PayloadContent) -> Self {
        self.payload_content = payload_content;
        self
    }

    /// Sets the status carried by the persisted record.
    #[must_use]
    pub const fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn id(&self) -> &SubscriptionId {
        &self.id
    }

    #[must_use]
    pub const fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        self.endpoint.channel_type()
    }

    #[must_use]
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    #[must_use]
    pub const fn payload_content(&self) -> PayloadContent {
        self.payload_content
    }

    #[must_use]
    pub const fn status(&self) -> SubscriptionStatus {
        self.status
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, SubscriptionStatus::Active)
    }

    pub(crate) fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_id_validates_shape() {
        assert!(SubscriptionId::new("123").is_ok());
        assert_eq!(SubscriptionId::new(" abc-1 ").unwrap().as_str(), "abc-1");
        assert!(SubscriptionId::new("").is_err());
        assert!(SubscriptionId::new("a/b").is_err());
        assert_ne!(SubscriptionId::generate(), SubscriptionId::generate());
    }

    #[test]
    fn channel_names_are_deterministic() {
        let id = SubscriptionId::new("42").unwrap();
        assert_eq!(
            ChannelType::RestHook.delivery_channel_name(&id),
            "subscription-delivery-rest-hook-42"
        );
        assert_eq!(
            ChannelType::Email.matching_channel_name(),
            "subscription-matching-email"
        );
    }

    #[test]
    fn channel_type_round_trips_codes() {
        for t in ChannelType::ALL {
            assert_eq!(t.code().parse::<ChannelType>().unwrap(), t);
        }
        assert!("sms".parse::<ChannelType>().is_err());
    }

    #[test]
    fn endpoint_normalizes_mailto() {
        let ep = Endpoint::Email {
            to: vec!["mailto:alice@example.org".to_string()],
            from: None,
            subject: None,
        }
        .normalized()
        .unwrap();
        let Endpoint::Email { to, .. } = ep else {
            panic!("expected email endpoint");
        };
        assert_eq!(to, vec!["alice@example.org".to_string()]);
    }

    #[test]
    fn endpoint_rejects_malformed() {
        assert!(Endpoint::rest_hook("ftp://x").normalized().is_err());
        assert!(Endpoint::rest_hook("https://").normalized().is_err());
        assert!(Endpoint::email("nobody").normalized().is_err());
        assert!(Endpoint::web_socket("  ").normalized().is_err());
        assert!(Endpoint::rest_hook("https://hooks.example.org/fhir").normalized().is_ok());
    }

    #[test]
    fn active_subscription_derives_channel() {
        let sub = ActiveSubscription::new(
            SubscriptionId::new("7").unwrap(),
            Criteria::parse("Patient").unwrap(),
            Endpoint::web_socket("sess-1"),
        )
        .unwrap()
        .with_payload(PayloadContent::IdOnly);

        assert_eq!(sub.channel_type(), ChannelType::WebSocket);
        assert_eq!(sub.channel_name(), "subscription-delivery-websocket-7");
        assert_eq!(sub.status(), SubscriptionStatus::Requested);
        assert!(!sub.is_active());
    }
}
