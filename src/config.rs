//! Pipeline configuration.
//!
//! Loading is left to the embedding application; this module only defines
//! the shape, defaults and validation.
//!
//! ```rust
//! use resnotify::config::PipelineConfig;
//! use resnotify::subscription::ChannelType;
//!
//! let config = PipelineConfig::from_json_str(
//!     r#"{
//!         "supported_channel_types": ["rest-hook", "email"],
//!         "matching": { "default": { "concurrency": 2, "capacity": 64 } },
//!         "email": { "host": "smtp.example.org", "port": 2525 }
//!     }"#,
//! )
//! .unwrap();
//!
//! assert!(config.supported_channel_types.contains(&ChannelType::Email));
//! assert_eq!(config.matching_settings(ChannelType::Email).concurrency, 2);
//! assert_eq!(config.email.port, 2525);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelSpec, TeardownPolicy};
use crate::delivery::{EmailTransportConfig, RetryPolicy};
use crate::error::{ConfigurationError, NotifyResult};
use crate::subscription::ChannelType;

/// Worker count and queue capacity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub concurrency: usize,
    pub capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            capacity: 1024,
        }
    }
}

impl ChannelSettings {
    #[must_use]
    pub const fn new(concurrency: usize, capacity: usize) -> Self {
        Self { concurrency, capacity }
    }

    /// Spec for a channel named `name`; zero sizes are clamped to 1.
    #[must_use]
    pub fn spec(&self, name: impl Into<String>) -> ChannelSpec {
        ChannelSpec::new(name, self.concurrency, self.capacity)
    }
}

/// Matching channel settings with per-type overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub default: ChannelSettings,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub per_type: BTreeMap<ChannelType, ChannelSettings>,
}

/// Everything a [`crate::SubscriptionPipeline`] is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Channel types subscriptions may use. Fixed for the pipeline's life.
    pub supported_channel_types: BTreeSet<ChannelType>,
    pub matching: MatchingSettings,
    /// Settings of every per-subscription delivery channel.
    pub delivery: ChannelSettings,
    pub email: EmailTransportConfig,
    pub retry: RetryPolicy,
    pub teardown: TeardownPolicy,
    /// Outcomes kept for [`crate::SubscriptionPipeline::delivery_outcomes`];
    /// 0 disables the feed.
    pub outcome_feed_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            supported_channel_types: ChannelType::ALL.into_iter().collect(),
            matching: MatchingSettings::default(),
            delivery: ChannelSettings::new(1, 256),
            email: EmailTransportConfig::default(),
            retry: RetryPolicy::default(),
            teardown: TeardownPolicy::default(),
            outcome_feed_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json_str(input: &str) -> NotifyResult<Self> {
        let config: Self = serde_json::from_str(input).map_err(|e| ConfigurationError::Invalid {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Restricts the supported channel types.
    #[must_use]
    pub fn with_supported(mut self, types: impl IntoIterator<Item = ChannelType>) -> Self {
        self.supported_channel_types = types.into_iter().collect();
        self
    }

    /// Settings of the matching channel for `channel_type`.
    #[must_use]
    pub fn matching_settings(&self, channel_type: ChannelType) -> ChannelSettings {
        self.matching
            .per_type
            .get(&channel_type)
            .copied()
            .unwrap_or(self.matching.default)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::Invalid { reason };

        if self.email.host.trim().is_empty() {
            return Err(invalid("email.host is empty".to_string()));
        }
        if self.email.port == 0 {
            return Err(invalid("email.port must be non-zero".to_string()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(invalid(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if let Some(ct) = self
            .matching
            .per_type
            .keys()
            .find(|ct| !self.supported_channel_types.contains(*ct))
        {
            return Err(invalid(format!("matching override for unsupported channel type '{ct}'")));
        }
        Ok(())
    }
}
