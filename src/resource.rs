//! Resource change messages.
//!
//! A [`ResourceModifiedMessage`] is produced once per external mutation and
//! fanned out to every wired matching channel. Each match against an active
//! subscription produces one [`ResourceDeliveryMessage`] for that
//! subscription's delivery channel.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::subscription::{ActiveSubscription, PayloadContent, SubscriptionId};

static RESOURCE_TYPE_RE: OnceLock<Regex> = OnceLock::new();
static RESOURCE_ID_RE: OnceLock<Regex> = OnceLock::new();

fn resource_type_re() -> &'static Regex {
    RESOURCE_TYPE_RE.get_or_init(|| Regex::new(r"^[A-Z][A-Za-z0-9]{0,63}$").expect("static regex"))
}

fn resource_id_re() -> &'static Regex {
    RESOURCE_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-.]{1,64}$").expect("static regex"))
}

/// Returns true if `value` is a well-formed resource type name (`Patient`).
#[must_use]
pub fn is_valid_resource_type(value: &str) -> bool {
    resource_type_re().is_match(value)
}

/// Returns true if `value` is a well-formed logical resource id.
#[must_use]
pub fn is_valid_resource_id(value: &str) -> bool {
    resource_id_re().is_match(value)
}

/// Kind of mutation applied to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
}

impl ResourceOperation {
    /// All operations, in declaration order.
    pub const ALL: [Self; 3] = [Self::Create, Self::Update, Self::Delete];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceOperation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(ValidationError::InvalidCriteria {
                criteria: other.to_string(),
                reason: "unknown resource operation".to_string(),
            }),
        }
    }
}

/// A mutation observed on a domain record.
///
/// Immutable once constructed; the snapshot is shared between the copies that
/// are fanned out to matching channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceModifiedMessage {
    message_id: Uuid,
    resource_type: String,
    resource_id: String,
    operation: ResourceOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<Arc<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ResourceModifiedMessage {
    /// Starts a message for `resource_type/resource_id`.
    ///
    /// The message is not validated until [`ResourceModifiedMessageBuilder::build`].
    #[must_use]
    pub fn builder(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operation: ResourceOperation,
    ) -> ResourceModifiedMessageBuilder {
        ResourceModifiedMessageBuilder {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            operation,
            snapshot: None,
            transaction_id: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        self.message_id
    }

    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    #[must_use]
    pub const fn operation(&self) -> ResourceOperation {
        self.operation
    }

    /// The changed content, if the producer supplied one.
    #[must_use]
    pub fn snapshot(&self) -> Option<&serde_json::Value> {
        self.snapshot.as_deref()
    }

    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// `Type/id` reference to the changed resource.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }

    /// The snapshot, or a minimal `{resourceType, id}` body when none was supplied.
    #[must_use]
    pub fn content(&self) -> serde_json::Value {
        match &self.snapshot {
            Some(v) => v.as_ref().clone(),
            None => serde_json::json!({
                "resourceType": self.resource_type,
                "id": self.resource_id,
            }),
        }
    }

    /// Re-checks the invariants enforced by the builder.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_parts(
            &self.resource_type,
            &self.resource_id,
            self.snapshot.as_deref(),
            self.transaction_id.as_deref(),
        )
    }
}

/// Builder for [`ResourceModifiedMessage`].
#[derive(Debug, Clone)]
pub struct ResourceModifiedMessageBuilder {
    resource_type: String,
    resource_id: String,
    operation: ResourceOperation,
    snapshot: Option<serde_json::Value>,
    transaction_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl ResourceModifiedMessageBuilder {
    #[must_use]
    pub fn snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validates and freezes the message.
    pub fn build(self) -> Result<ResourceModifiedMessage, ValidationError> {
        let resource_type = self.resource_type.trim().to_string();
        let resource_id = self.resource_id.trim().to_string();
        validate_parts(
            &resource_type,
            &resource_id,
            self.snapshot.as_ref(),
            self.transaction_id.as_deref(),
        )?;

        Ok(ResourceModifiedMessage {
            message_id: Uuid::new_v4(),
            resource_type,
            resource_id,
            operation: self.operation,
            snapshot: self.snapshot.map(Arc::new),
            transaction_id: self.transaction_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

fn validate_parts(
    resource_type: &str,
    resource_id: &str,
    snapshot: Option<&serde_json::Value>,
    transaction_id: Option<&str>,
) -> Result<(), ValidationError> {
    if resource_type.is_empty() {
        return Err(ValidationError::MissingField {
            field: "resource_type".to_string(),
        });
    }
    if !is_valid_resource_type(resource_type) {
        return Err(ValidationError::InvalidResourceType {
            value: resource_type.to_string(),
        });
    }
    if resource_id.is_empty() {
        return Err(ValidationError::MissingField {
            field: "resource_id".to_string(),
        });
    }
    if !is_valid_resource_id(resource_id) {
        return Err(ValidationError::InvalidResourceId {
            value: resource_id.to_string(),
        });
    }
    if let Some(tx) = transaction_id {
        if tx.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "transaction_id".to_string(),
            });
        }
    }

    let Some(snapshot) = snapshot else {
        return Ok(());
    };
    let Some(body) = snapshot.as_object() else {
        return Err(ValidationError::SnapshotMismatch {
            reason: "snapshot must be a JSON object".to_string(),
        });
    };
    if let Some(t) = body.get("resourceType") {
        if t.as_str() != Some(resource_type) {
            return Err(ValidationError::SnapshotMismatch {
                reason: format!("resourceType {t} does not match {resource_type}"),
            });
        }
    }
    if let Some(id) = body.get("id") {
        if id.as_str() != Some(resource_id) {
            return Err(ValidationError::SnapshotMismatch {
                reason: format!("id {id} does not match {resource_id}"),
            });
        }
    }
    Ok(())
}

/// A matched event bound for one subscription's delivery channel.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDeliveryMessage {
    pub subscription_id: SubscriptionId,
    pub channel_name: String,
    pub resource_reference: String,
    pub operation: ResourceOperation,
    pub payload_content: PayloadContent,
    /// Rendered body; `None` for [`PayloadContent::Empty`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub source_message_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Subscription as it was when the match happened.
    #[serde(skip)]
    subscription: Arc<ActiveSubscription>,
}

impl ResourceDeliveryMessage {
    /// Renders the delivery for `subscription` matching `message`.
    pub fn for_match(
        subscription: &Arc<ActiveSubscription>,
        message: &ResourceModifiedMessage,
    ) -> Result<Self, serde_json::Error> {
        let payload_content = subscription.payload_content();
        let payload = payload_content.render(message)?;
        Ok(Self {
            subscription_id: subscription.id().clone(),
            channel_name: subscription.channel_name().to_string(),
            resource_reference: message.reference(),
            operation: message.operation(),
            payload_content,
            payload,
            source_message_id: message.message_id(),
            transaction_id: message.transaction_id().map(str::to_string),
            timestamp: Utc::now(),
            subscription: Arc::clone(subscription),
        })
    }

    /// The subscription this message was rendered for.
    #[must_use]
    pub fn subscription(&self) -> &ActiveSubscription {
        &self.subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn builder_accepts_well_formed_message() {
        let msg = ResourceModifiedMessage::builder("Patient", "123", ResourceOperation::Create)
            .snapshot(json!({"resourceType": "Patient", "id": "123", "active": true}))
            .transaction_id("tx-1")
            .build()
            .unwrap();

        assert_eq!(msg.resource_type(), "Patient");
        assert_eq!(msg.reference(), "Patient/123");
        assert_eq!(msg.transaction_id(), Some("tx-1"));
        assert_eq!(msg.content()["active"], json!(true));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn builder_rejects_lowercase_type() {
        let err = ResourceModifiedMessage::builder("patient", "1", ResourceOperation::Create)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidResourceType {
                value: "patient".to_string()
            }
        );
    }

    #[test]
    fn builder_rejects_missing_id() {
        let err = ResourceModifiedMessage::builder("Patient", "  ", ResourceOperation::Update)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { field } if field == "resource_id"));
    }

    #[test]
    fn builder_rejects_snapshot_for_other_resource() {
        let err = ResourceModifiedMessage::builder("Patient", "1", ResourceOperation::Update)
            .snapshot(json!({"resourceType": "Observation", "id": "1"}))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::SnapshotMismatch { .. }));

        let err = ResourceModifiedMessage::builder("Patient", "1", ResourceOperation::Update)
            .snapshot(json!(["not", "an", "object"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::SnapshotMismatch { .. }));
    }

    #[test]
    fn content_falls_back_to_reference_body() {
        let msg = ResourceModifiedMessage::builder("Observation", "o-1", ResourceOperation::Delete)
            .build()
            .unwrap();
        assert_eq!(msg.snapshot(), None);
        assert_eq!(msg.content(), json!({"resourceType": "Observation", "id": "o-1"}));
    }

    #[test]
    fn operation_parses_case_insensitively() {
        assert_eq!("create".parse::<ResourceOperation>().unwrap(), ResourceOperation::Create);
        assert_eq!(" Delete ".parse::<ResourceOperation>().unwrap(), ResourceOperation::Delete);
        assert!("PATCH".parse::<ResourceOperation>().is_err());
        assert_eq!(ResourceOperation::Update.to_string(), "UPDATE");
    }
}
