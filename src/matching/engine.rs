use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::channel::MessageHandler;
use crate::delivery::DeliveryRouter;
use crate::error::{NotifyError, NotifyResult};
use crate::resource::{ResourceDeliveryMessage, ResourceModifiedMessage};
use crate::subscription::{ActiveSubscription, ChannelType, SubscriptionRegistry};

/// Counters of the matching engines of a pipeline.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchingStats {
    /// Change messages processed.
    pub messages: u64,
    /// Predicates run.
    pub evaluated: u64,
    pub matched: u64,
    /// Predicates that returned an error or panicked.
    pub evaluation_failures: u64,
    /// Matches that could not be rendered or enqueued.
    pub enqueue_failures: u64,
}

/// Shared counters behind [`MatchingStats`].
#[derive(Debug, Default)]
pub struct MatchingCounters {
    messages: AtomicU64,
    evaluated: AtomicU64,
    matched: AtomicU64,
    evaluation_failures: AtomicU64,
    enqueue_failures: AtomicU64,
}

impl MatchingCounters {
    #[must_use]
    pub fn snapshot(&self) -> MatchingStats {
        MatchingStats {
            messages: self.messages.load(Ordering::Relaxed),
            evaluated: self.evaluated.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            evaluation_failures: self.evaluation_failures.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
        }
    }
}

/// Evaluates change messages against the active subscriptions of one
/// channel type.
#[derive(Debug)]
pub struct MatchingEngine {
    channel_type: ChannelType,
    subscriptions: Arc<SubscriptionRegistry>,
    router: Arc<DeliveryRouter>,
    counters: Arc<MatchingCounters>,
    name: String,
}

impl MatchingEngine {
    #[must_use]
    pub fn new(
        channel_type: ChannelType,
        subscriptions: Arc<SubscriptionRegistry>,
        router: Arc<DeliveryRouter>,
        counters: Arc<MatchingCounters>,
    ) -> Self {
        Self {
            channel_type,
            subscriptions,
            router,
            counters,
            name: format!("{}-matcher", channel_type.code()),
        }
    }

    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Returns true if `subscription` matches `message`. Errors and panics
    /// of the predicate count as no match.
    fn evaluate(&self, subscription: &ActiveSubscription, message: &ResourceModifiedMessage) -> bool {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(|| subscription.criteria().evaluate(message)));
        match result {
            Ok(Ok(matched)) => matched,
            Ok(Err(err)) => {
                self.counters.evaluation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription_id = %subscription.id(),
                    resource = %message.reference(),
                    error = %err,
                    "criteria evaluation failed"
                );
                false
            }
            Err(_) => {
                self.counters.evaluation_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscription_id = %subscription.id(),
                    resource = %message.reference(),
                    "criteria evaluation panicked"
                );
                false
            }
        }
    }

    fn deliver(&self, subscription: &Arc<ActiveSubscription>, message: &ResourceModifiedMessage) {
        let delivery = match ResourceDeliveryMessage::for_match(subscription, message) {
            Ok(d) => d,
            Err(e) => {
                self.counters.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                error!(subscription_id = %subscription.id(), error = %e, "failed to render delivery payload");
                return;
            }
        };

        match self.router.route(subscription, delivery) {
            Ok(()) => {
                debug!(
                    subscription_id = %subscription.id(),
                    channel = subscription.channel_name(),
                    resource = %message.reference(),
                    "delivery enqueued"
                );
            }
            // Deleted between the snapshot and now.
            Err(NotifyError::Lookup(_) | NotifyError::ChannelClosed { .. }) => {
                self.counters.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                debug!(subscription_id = %subscription.id(), "subscription removed during matching, delivery skipped");
            }
            Err(err) => {
                self.counters.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                error!(subscription_id = %subscription.id(), error = %err, "failed to enqueue delivery");
            }
        }
    }
}

impl MessageHandler<ResourceModifiedMessage> for MatchingEngine {
    fn handle(&self, message: &ResourceModifiedMessage) -> NotifyResult<()> {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.subscriptions.snapshot()?;

        let mut matched = 0usize;
        for subscription in snapshot.of_type(self.channel_type) {
            if !subscription.criteria().is_interested_in(message) {
                continue;
            }
            if !self.evaluate(subscription, message) {
                continue;
            }
            matched += 1;
            self.counters.matched.fetch_add(1, Ordering::Relaxed);
            self.deliver(subscription, message);
        }

        debug!(
            channel_type = %self.channel_type,
            resource = %message.reference(),
            operation = %message.operation(),
            matched,
            "message matched"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
