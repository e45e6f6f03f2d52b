//! Delivery bookkeeping: per-type counters and a bounded outcome feed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::debug;

use crate::subscription::{ChannelType, SubscriptionId};

/// Lifecycle of one delivery message inside a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Received,
    Attempting,
    Delivered,
    Failed,
}

impl DeliveryState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Attempting => "attempting",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Terminal result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub subscription_id: SubscriptionId,
    pub channel_type: ChannelType,
    pub resource_reference: String,
    pub state: DeliveryState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters for one channel type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeDeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    /// Attempts beyond the first.
    pub retries: u64,
}

/// Snapshot of a [`DeliveryTracker`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub by_type: BTreeMap<ChannelType, TypeDeliveryStats>,
    /// Outcomes not published because the feed was full.
    pub outcomes_dropped: u64,
}

impl DeliveryStats {
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.by_type.values().map(|s| s.delivered).sum()
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.by_type.values().map(|s| s.failed).sum()
    }

    #[must_use]
    pub fn of(&self, channel_type: ChannelType) -> TypeDeliveryStats {
        self.by_type.get(&channel_type).copied().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct TypeCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Shared by every delivery subscriber of a pipeline.
#[derive(Debug)]
pub struct DeliveryTracker {
    rest_hook: TypeCounters,
    email: TypeCounters,
    web_socket: TypeCounters,
    feed: Option<(Sender<DeliveryOutcome>, Receiver<DeliveryOutcome>)>,
    dropped: AtomicU64,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeliveryTracker {
    /// A tracker whose outcome feed keeps up to `feed_capacity` outcomes;
    /// 0 disables the feed.
    #[must_use]
    pub fn new(feed_capacity: usize) -> Self {
        Self {
            rest_hook: TypeCounters::default(),
            email: TypeCounters::default(),
            web_socket: TypeCounters::default(),
            feed: (feed_capacity > 0).then(|| bounded(feed_capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    const fn counters(&self, channel_type: ChannelType) -> &TypeCounters {
        match channel_type {
            ChannelType::RestHook => &self.rest_hook,
            ChannelType::Email => &self.email,
            ChannelType::WebSocket => &self.web_socket,
        }
    }

    /// Records a terminal outcome. Never blocks.
    pub fn record(&self, outcome: DeliveryOutcome) {
        let counters = self.counters(outcome.channel_type);
        match outcome.state {
            DeliveryState::Delivered => counters.delivered.fetch_add(1, Ordering::Relaxed),
            DeliveryState::Failed => counters.failed.fetch_add(1, Ordering::Relaxed),
            DeliveryState::Received | DeliveryState::Attempting => return,
        };
        if outcome.attempts > 1 {
            counters
                .retries
                .fetch_add(u64::from(outcome.attempts - 1), Ordering::Relaxed);
        }

        if let Some((tx, _)) = &self.feed {
            match tx.try_send(outcome) {
                Ok(()) => {}
                Err(TrySendError::Full(outcome)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscription_id = %outcome.subscription_id, "outcome feed full, outcome dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Receiver of the outcome feed, if enabled.
    #[must_use]
    pub fn outcomes(&self) -> Option<Receiver<DeliveryOutcome>> {
        self.feed.as_ref().map(|(_, rx)| rx.clone())
    }

    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        let by_type = ChannelType::ALL
            .iter()
            .map(|&ct| {
                let c = self.counters(ct);
                (
                    ct,
                    TypeDeliveryStats {
                        delivered: c.delivered.load(Ordering::Relaxed),
                        failed: c.failed.load(Ordering::Relaxed),
                        retries: c.retries.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        DeliveryStats {
            by_type,
            outcomes_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(state: DeliveryState, attempts: u32) -> DeliveryOutcome {
        DeliveryOutcome {
            subscription_id: SubscriptionId::new("s1").unwrap(),
            channel_type: ChannelType::RestHook,
            resource_reference: "Patient/1".to_string(),
            state,
            attempts,
            error: None,
        }
    }

    #[test]
    fn counts_terminal_states_only() {
        let tracker = DeliveryTracker::default();
        tracker.record(outcome(DeliveryState::Delivered, 1));
        tracker.record(outcome(DeliveryState::Failed, 3));
        tracker.record(outcome(DeliveryState::Attempting, 1));

        let stats = tracker.stats();
        assert_eq!(stats.delivered(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.of(ChannelType::RestHook).retries, 2);
        assert_eq!(stats.of(ChannelType::Email), TypeDeliveryStats::default());
        assert!(tracker.outcomes().is_none());
    }

    #[test]
    fn full_feed_drops_without_blocking() {
        let tracker = DeliveryTracker::new(2);
        for _ in 0..5 {
            tracker.record(outcome(DeliveryState::Delivered, 1));
        }
        let rx = tracker.outcomes().unwrap();
        assert_eq!(rx.try_iter().count(), 2);
        let stats = tracker.stats();
        assert_eq!(stats.outcomes_dropped, 3);
        assert_eq!(stats.delivered(), 5);
    }

    #[test]
    fn terminal_states() {
        assert!(DeliveryState::Delivered.is_terminal());
        assert!(DeliveryState::Failed.is_terminal());
        assert!(!DeliveryState::Attempting.is_terminal());
        assert_eq!(DeliveryState::Received.to_string(), "received");
    }
}
