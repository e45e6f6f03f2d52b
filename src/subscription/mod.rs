//! Subscriptions and the registry that indexes them.

/// Match criteria and the predicate seam.
pub mod criteria;
/// Copy-on-write subscription index.
pub mod registry;
/// Ids, channel types, endpoints, status.
pub mod types;

pub use criteria::{Criteria, CriteriaError, ResourcePredicate};
pub use registry::{SubscriptionRegistry, SubscriptionSnapshot};
pub use types::{ActiveSubscription, ChannelType, Endpoint, PayloadContent, SubscriptionId, SubscriptionStatus};
