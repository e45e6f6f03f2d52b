//! Subscription criteria.
//!
//! A [`Criteria`] is split into a cheap interest filter (resource types and
//! operations) and an opaque [`ResourcePredicate`] evaluated against the
//! message. The predicate language itself belongs to the caller; this module
//! only parses the `Type` / `Type?query` envelope.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::ValidationError;
use crate::resource::{is_valid_resource_type, ResourceModifiedMessage, ResourceOperation};

/// Failure raised while evaluating a predicate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("criteria evaluation failed: {message}")]
pub struct CriteriaError {
    pub message: String,
}

impl CriteriaError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Boolean evaluator over a resource snapshot.
pub trait ResourcePredicate: Send + Sync {
    /// Returns whether `message` satisfies the predicate.
    fn evaluate(&self, message: &ResourceModifiedMessage) -> Result<bool, CriteriaError>;
}

impl<F> ResourcePredicate for F
where
    F: Fn(&ResourceModifiedMessage) -> Result<bool, CriteriaError> + Send + Sync,
{
    fn evaluate(&self, message: &ResourceModifiedMessage) -> Result<bool, CriteriaError> {
        self(message)
    }
}

/// Match criteria of a subscription.
#[derive(Clone)]
pub struct Criteria {
    expression: String,
    /// Empty means every resource type (`*`).
    resource_types: BTreeSet<String>,
    /// Empty means every operation.
    operations: BTreeSet<ResourceOperation>,
    query: Option<String>,
    predicate: Option<Arc<dyn ResourcePredicate>>,
}

impl fmt::Debug for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Criteria")
            .field("expression", &self.expression)
            .field("resource_types", &self.resource_types)
            .field("operations", &self.operations)
            .field("query", &self.query)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Criteria {
    /// Parses a type-only expression: `Patient`, `Patient,Observation` or `*`.
    ///
    /// Expressions carrying a query part (`Patient?name=smith`) need an
    /// evaluator and must go through [`Criteria::parse_with`].
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let criteria = Self::parse_envelope(expression)?;
        if criteria.query.is_some() {
            return Err(ValidationError::InvalidCriteria {
                criteria: expression.to_string(),
                reason: "query criteria require an evaluator".to_string(),
            });
        }
        Ok(criteria)
    }

    /// Parses `expression` and attaches the evaluator for its query part.
    pub fn parse_with(
        expression: &str,
        predicate: Arc<dyn ResourcePredicate>,
    ) -> Result<Self, ValidationError> {
        let mut criteria = Self::parse_envelope(expression)?;
        criteria.predicate = Some(predicate);
        Ok(criteria)
    }

    fn parse_envelope(expression: &str) -> Result<Self, ValidationError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingField {
                field: "criteria".to_string(),
            });
        }

        let (types_part, query) = match trimmed.split_once('?') {
            Some((t, q)) => {
                let q = q.trim();
                if q.is_empty() {
                    return Err(ValidationError::InvalidCriteria {
                        criteria: trimmed.to_string(),
                        reason: "empty query after '?'".to_string(),
                    });
                }
                (t, Some(q.to_string()))
            }
            None => (trimmed, None),
        };

        let mut resource_types = BTreeSet::new();
        if types_part.trim() != "*" {
            for t in types_part.split(',') {
                let t = t.trim();
                if !is_valid_resource_type(t) {
                    return Err(ValidationError::InvalidCriteria {
                        criteria: trimmed.to_string(),
                        reason: format!("invalid resource type '{t}'"),
                    });
                }
                resource_types.insert(t.to_string());
            }
        }

        Ok(Self {
            expression: trimmed.to_string(),
            resource_types,
            operations: BTreeSet::new(),
            query,
            predicate: None,
        })
    }

    /// Criteria matching every change to the given resource types.
    pub fn for_types<I, S>(types: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let types: Vec<String> = types.into_iter().map(|s| s.as_ref().trim().to_string()).collect();
        if types.is_empty() {
            return Err(ValidationError::MissingField {
                field: "criteria".to_string(),
            });
        }
        Self::parse(&types.join(","))
    }

    /// Restricts the criteria to the given operations.
    #[must_use]
    pub fn with_operations<I>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = ResourceOperation>,
    {
        self.operations = operations.into_iter().collect();
        self
    }

    /// Replaces the evaluator.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Arc<dyn ResourcePredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    #[must_use]
    pub const fn resource_types(&self) -> &BTreeSet<String> {
        &self.resource_types
    }

    #[must_use]
    pub const fn operations(&self) -> &BTreeSet<ResourceOperation> {
        &self.operations
    }

    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Cheap pre-filter on resource type and operation.
    #[must_use]
    pub fn is_interested_in(&self, message: &ResourceModifiedMessage) -> bool {
        let type_ok =
            self.resource_types.is_empty() || self.resource_types.contains(message.resource_type());
        let op_ok = self.operations.is_empty() || self.operations.contains(&message.operation());
        type_ok && op_ok
    }

    /// Runs the predicate. Criteria without one match on interest alone.
    pub fn evaluate(&self, message: &ResourceModifiedMessage) -> Result<bool, CriteriaError> {
        match &self.predicate {
            Some(p) => p.evaluate(message),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn patient(op: ResourceOperation) -> ResourceModifiedMessage {
        ResourceModifiedMessage::builder("Patient", "123", op)
            .snapshot(json!({"resourceType": "Patient", "id": "123", "gender": "female"}))
            .build()
            .unwrap()
    }

    #[test]
    fn parse_type_only() {
        let c = Criteria::parse("Patient").unwrap();
        assert!(c.resource_types().contains("Patient"));
        assert!(c.is_interested_in(&patient(ResourceOperation::Create)));
        assert_eq!(c.evaluate(&patient(ResourceOperation::Create)), Ok(true));

        let obs = ResourceModifiedMessage::builder("Observation", "1", ResourceOperation::Create)
            .build()
            .unwrap();
        assert!(!c.is_interested_in(&obs));
    }

    #[test]
    fn parse_wildcard_and_lists() {
        let any = Criteria::parse("*").unwrap();
        assert!(any.resource_types().is_empty());
        assert!(any.is_interested_in(&patient(ResourceOperation::Delete)));

        let two = Criteria::parse("Patient, Observation").unwrap();
        assert_eq!(two.resource_types().len(), 2);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(
            Criteria::parse("  "),
            Err(ValidationError::MissingField { .. })
        ));
        assert!(matches!(
            Criteria::parse("patient"),
            Err(ValidationError::InvalidCriteria { .. })
        ));
        assert!(matches!(
            Criteria::parse("Patient?"),
            Err(ValidationError::InvalidCriteria { .. })
        ));
        assert!(matches!(
            Criteria::parse("Patient?gender=female"),
            Err(ValidationError::InvalidCriteria { .. })
        ));
    }

    #[test]
    fn parse_with_uses_predicate() {
        let c = Criteria::parse_with(
            "Patient?gender=female",
            Arc::new(|m: &ResourceModifiedMessage| -> Result<bool, CriteriaError> {
                Ok(m.content()["gender"] == json!("female"))
            }),
        )
        .unwrap();
        assert_eq!(c.query(), Some("gender=female"));
        assert_eq!(c.evaluate(&patient(ResourceOperation::Update)), Ok(true));
    }

    #[test]
    fn operation_interest_filters() {
        let c = Criteria::parse("Patient")
            .unwrap()
            .with_operations([ResourceOperation::Create]);
        assert!(c.is_interested_in(&patient(ResourceOperation::Create)));
        assert!(!c.is_interested_in(&patient(ResourceOperation::Delete)));
    }

    #[test]
    fn predicate_error_is_returned() {
        let c = Criteria::parse("Patient")
            .unwrap()
            .with_predicate(Arc::new(|_: &ResourceModifiedMessage| -> Result<bool, CriteriaError> {
                Err(CriteriaError::new("boom"))
            }));
        assert_eq!(
            c.evaluate(&patient(ResourceOperation::Create)),
            Err(CriteriaError::new("boom"))
        );
    }
}
