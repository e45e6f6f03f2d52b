//! # resnotify - resource change notification pipeline
//!
//! resnotify watches mutations to domain records, matches each one against
//! the criteria of active subscriptions and hands every match to a delivery
//! mechanism (HTTP callback, email or push socket) over bounded, concurrent
//! channels.
//!
//! ## Core Concepts
//!
//! - **Subscription**: criteria plus an endpoint, indexed by the
//!   [`SubscriptionRegistry`]
//! - **Channel**: a named, bounded queue with its own worker pool
//! - **Matching engine**: one per wired channel type, turning a
//!   [`ResourceModifiedMessage`] into [`ResourceDeliveryMessage`]s
//! - **Delivery subscriber**: performs the external send, one variant per
//!   [`ChannelType`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use resnotify::{PipelineConfig, SubscriptionPipeline};
//! use resnotify::delivery::Senders;
//!
//! let pipeline = SubscriptionPipeline::new(PipelineConfig::default(), senders)?;
//! pipeline.register_interceptors([ChannelType::RestHook, ChannelType::Email])?;
//! pipeline.upsert_subscription(subscription)?;
//! pipeline.submit(change)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod delivery;
pub mod error;
pub mod interceptor;
pub mod matching;
pub mod pipeline;
pub mod resource;
pub mod subscription;

pub use channel::{ChannelRegistry, ChannelSpec, MessageHandler, TeardownPolicy};
pub use config::{ChannelSettings, PipelineConfig};
pub use delivery::{DeliveryOutcome, DeliveryState, DeliveryStats, RetryPolicy, Senders};
pub use error::{
    ConfigurationError, DeliveryError, LookupError, NotifyError, NotifyResult, ValidationError,
};
pub use interceptor::InterceptorLoader;
pub use matching::MatchingStats;
pub use pipeline::{SubmitReceipt, SubscriptionPipeline};
pub use resource::{ResourceDeliveryMessage, ResourceModifiedMessage, ResourceOperation};
pub use subscription::{
    ActiveSubscription, ChannelType, Criteria, Endpoint, PayloadContent, SubscriptionId,
    SubscriptionRegistry, SubscriptionStatus,
};
