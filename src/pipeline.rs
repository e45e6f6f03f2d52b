//! The assembled notification pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::ChannelRegistry;
use crate::config::PipelineConfig;
use crate::delivery::{
    DeliveryHandler, DeliveryOutcome, DeliveryRouter, DeliveryStats, DeliverySubscriber, DeliveryTracker, Senders,
};
use crate::error::{NotifyError, NotifyResult};
use crate::interceptor::InterceptorLoader;
use crate::matching::{MatchingCounters, MatchingStats};
use crate::resource::ResourceModifiedMessage;
use crate::subscription::{ActiveSubscription, ChannelType, SubscriptionId, SubscriptionRegistry};

/// Acknowledgement of an accepted change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub message_id: Uuid,
    /// Matching channels the message was handed to.
    pub matching_channels: usize,
}

/// Subscription registry, channels, matching engines and delivery
/// subscribers wired together.
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use resnotify::delivery::{RecordingCallbackSender, Senders};
/// use resnotify::subscription::{ActiveSubscription, ChannelType, Criteria, Endpoint, SubscriptionId};
/// use resnotify::{PipelineConfig, ResourceModifiedMessage, ResourceOperation, SubscriptionPipeline};
///
/// let callbacks = Arc::new(RecordingCallbackSender::new());
/// let pipeline = SubscriptionPipeline::new(
///     PipelineConfig::default().with_supported([ChannelType::RestHook]),
///     Senders::new().with_callback(callbacks.clone()),
/// )
/// .unwrap();
///
/// pipeline.register_interceptors([ChannelType::RestHook]).unwrap();
/// pipeline
///     .upsert_subscription(
///         ActiveSubscription::new(
///             SubscriptionId::new("patients").unwrap(),
///             Criteria::parse("Patient").unwrap(),
///             Endpoint::rest_hook("http://localhost/hook"),
///         )
///         .unwrap(),
///     )
///     .unwrap();
///
/// let change = ResourceModifiedMessage::builder("Patient", "42", ResourceOperation::Create)
///     .build()
///     .unwrap();
/// pipeline.submit(change).unwrap();
///
/// assert!(pipeline.wait_for_idle(Duration::from_secs(5)).unwrap());
/// assert_eq!(callbacks.calls().len(), 1);
/// ```
pub struct SubscriptionPipeline {
    config: PipelineConfig,
    subscriptions: Arc<SubscriptionRegistry>,
    channels: Arc<ChannelRegistry>,
    router: Arc<DeliveryRouter>,
    loader: InterceptorLoader,
    tracker: Arc<DeliveryTracker>,
    matching: Arc<MatchingCounters>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for SubscriptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionPipeline")
            .field("config", &self.config)
            .field("loader", &self.loader)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl SubscriptionPipeline {
    /// Builds a pipeline. Nothing is matched until interceptors are
    /// registered.
    pub fn new(config: PipelineConfig, senders: Senders) -> NotifyResult<Self> {
        config.validate()?;

        let tracker = Arc::new(DeliveryTracker::new(config.outcome_feed_capacity));
        let mut handlers = Vec::new();
        for &channel_type in &config.supported_channel_types {
            let subscriber = match channel_type {
                ChannelType::RestHook => senders.callback.clone().map(DeliverySubscriber::RestHook),
                ChannelType::Email => senders.email.clone().map(|sender| DeliverySubscriber::Email {
                    sender,
                    transport: config.email.clone(),
                }),
                ChannelType::WebSocket => senders.socket.clone().map(DeliverySubscriber::WebSocket),
            };
            match subscriber {
                Some(subscriber) => handlers.push(DeliveryHandler::new(subscriber, config.retry, Arc::clone(&tracker))),
                None => warn!(channel_type = %channel_type, "supported channel type has no sender"),
            }
        }

        let subscriptions = Arc::new(SubscriptionRegistry::new(config.supported_channel_types.iter().copied()));
        let channels = Arc::new(ChannelRegistry::new(config.teardown));
        let router = Arc::new(DeliveryRouter::new(
            Arc::clone(&channels),
            Arc::clone(&subscriptions),
            handlers,
            config.delivery,
        ));
        let matching = Arc::new(MatchingCounters::default());
        let loader = InterceptorLoader::new(
            config.supported_channel_types.clone(),
            config.matching.clone(),
            Arc::clone(&channels),
            Arc::clone(&subscriptions),
            Arc::clone(&router),
            Arc::clone(&matching),
        );

        info!(supported = ?config.supported_channel_types, "subscription pipeline created");
        Ok(Self {
            config,
            subscriptions,
            channels,
            router,
            loader,
            tracker,
            matching,
            shut_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validates `message` and hands it to every wired matching channel,
    /// blocking while a channel is full.
    pub fn submit(&self, message: ResourceModifiedMessage) -> NotifyResult<SubmitReceipt> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(NotifyError::ChannelClosed {
                name: "pipeline".to_string(),
            });
        }
        message.validate()?;
        let matching_channels = self.loader.dispatch(&message)?;
        Ok(SubmitReceipt {
            message_id: message.message_id(),
            matching_channels,
        })
    }

    pub fn register_interceptors(&self, types: impl IntoIterator<Item = ChannelType>) -> NotifyResult<()> {
        self.loader.register(types)
    }

    /// Drains and removes every matching channel. Returns the number of
    /// channel types unwired.
    pub fn unregister_interceptors(&self) -> NotifyResult<usize> {
        self.loader.unregister()
    }

    #[must_use]
    pub fn registered_types(&self) -> Vec<ChannelType> {
        self.loader.registered_types().into_iter().collect()
    }

    /// Stores a persisted subscription and provisions its delivery channel.
    ///
    /// When an edit moves the subscription to another channel, or it is no
    /// longer active, the old delivery channel is drained and removed.
    pub fn upsert_subscription(&self, subscription: ActiveSubscription) -> NotifyResult<Arc<ActiveSubscription>> {
        let previous = match self.subscriptions.get(subscription.id()) {
            Ok(prev) => Some(prev),
            Err(NotifyError::Lookup(_)) => None,
            Err(err) => return Err(err),
        };
        let stored = self.subscriptions.put(subscription)?;

        if let Some(prev) = previous.filter(|p| p.channel_name() != stored.channel_name()) {
            self.router.release(prev.channel_name())?;
        }
        if stored.is_active() && self.router.can_deliver(stored.channel_type()) {
            self.router.channel_for(&stored)?;
        } else {
            self.router.release(stored.channel_name())?;
        }
        Ok(stored)
    }

    /// Removes a subscription, then drains and removes its delivery channel.
    /// No-op if absent.
    pub fn delete_subscription(&self, id: &SubscriptionId) -> NotifyResult<Option<Arc<ActiveSubscription>>> {
        let removed = self.subscriptions.remove(id)?;
        if let Some(sub) = &removed {
            self.router.release(sub.channel_name())?;
        }
        Ok(removed)
    }

    pub fn subscription(&self, id: &SubscriptionId) -> NotifyResult<Arc<ActiveSubscription>> {
        self.subscriptions.get(id)
    }

    #[must_use]
    pub const fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn queue_depth(&self, channel_name: &str) -> NotifyResult<usize> {
        self.channels.queue_depth(channel_name)
    }

    pub fn queue_depths(&self) -> NotifyResult<BTreeMap<String, usize>> {
        self.channels.queue_depths()
    }

    /// Queued messages across the matching channels.
    #[must_use]
    pub fn matching_queue_depth(&self) -> usize {
        self.loader.queue_depth()
    }

    /// Blocks until no message is queued or in flight anywhere, or `timeout`
    /// elapses. Returns false on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> NotifyResult<bool> {
        self.channels.wait_for_idle(&self.loader.channel_names(), timeout)
    }

    #[must_use]
    pub fn matching_stats(&self) -> MatchingStats {
        self.matching.snapshot()
    }

    #[must_use]
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.tracker.stats()
    }

    /// Feed of terminal delivery outcomes, if enabled in the config.
    #[must_use]
    pub fn delivery_outcomes(&self) -> Option<Receiver<DeliveryOutcome>> {
        self.tracker.outcomes()
    }

    /// Unregisters the interceptors and tears down every channel. Later
    /// calls do nothing.
    pub fn shutdown(&self) -> NotifyResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.loader.unregister()?;
        let removed = self.channels.teardown_all()?;
        info!(channels = removed, "subscription pipeline shut down");
        Ok(())
    }
}

impl Drop for SubscriptionPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "pipeline shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::delivery::{RecordingCallbackSender, RecordingEmailSender};
    use crate::resource::ResourceOperation;
    use crate::subscription::{Criteria, Endpoint, SubscriptionStatus};

    fn pipeline() -> (SubscriptionPipeline, Arc<RecordingCallbackSender>) {
        let callbacks = Arc::new(RecordingCallbackSender::new());
        let pipeline = SubscriptionPipeline::new(
            PipelineConfig::default().with_supported([ChannelType::RestHook, ChannelType::Email]),
            Senders::new()
                .with_callback(callbacks.clone())
                .with_email(Arc::new(RecordingEmailSender::new())),
        )
        .unwrap();
        (pipeline, callbacks)
    }

    fn hook(id: &str, url: &str) -> ActiveSubscription {
        ActiveSubscription::new(
            SubscriptionId::new(id).unwrap(),
            Criteria::parse("Patient").unwrap(),
            Endpoint::rest_hook(url),
        )
        .unwrap()
    }

    #[test]
    fn submit_without_interceptors_reaches_no_channel() {
        let (pipeline, _) = pipeline();
        let msg = ResourceModifiedMessage::builder("Patient", "1", ResourceOperation::Create)
            .build()
            .unwrap();
        let receipt = pipeline.submit(msg.clone()).unwrap();
        assert_eq!(receipt.message_id, msg.message_id());
        assert_eq!(receipt.matching_channels, 0);
    }

    #[test]
    fn upsert_provisions_and_delete_releases() {
        let (pipeline, _) = pipeline();
        let stored = pipeline.upsert_subscription(hook("a", "http://h/a")).unwrap();
        assert_eq!(stored.status(), SubscriptionStatus::Active);
        assert!(pipeline.queue_depth(stored.channel_name()).is_ok());

        let removed = pipeline.delete_subscription(stored.id()).unwrap();
        assert!(removed.is_some());
        assert!(pipeline.queue_depth(stored.channel_name()).unwrap_err().is_lookup());
        assert!(pipeline.delete_subscription(stored.id()).unwrap().is_none());
    }

    #[test]
    fn moving_channel_type_releases_old_channel() {
        let (pipeline, _) = pipeline();
        let old = pipeline.upsert_subscription(hook("m", "http://h/m")).unwrap();
        let moved = pipeline
            .upsert_subscription(
                ActiveSubscription::new(
                    SubscriptionId::new("m").unwrap(),
                    Criteria::parse("Patient").unwrap(),
                    Endpoint::email("x@y.org"),
                )
                .unwrap(),
            )
            .unwrap();
        assert_ne!(old.channel_name(), moved.channel_name());
        assert!(pipeline.queue_depth(old.channel_name()).unwrap_err().is_lookup());
        assert!(pipeline.queue_depth(moved.channel_name()).is_ok());
    }

    #[test]
    fn unsupported_subscription_is_stored_off_without_channel() {
        let (pipeline, _) = pipeline();
        let stored = pipeline
            .upsert_subscription(
                ActiveSubscription::new(
                    SubscriptionId::new("ws").unwrap(),
                    Criteria::parse("Patient").unwrap(),
                    Endpoint::web_socket("sess"),
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(stored.status(), SubscriptionStatus::Off);
        assert!(pipeline.queue_depths().unwrap().is_empty());
    }

    #[test]
    fn shutdown_is_idempotent_and_stops_intake() {
        let (pipeline, _) = pipeline();
        pipeline.register_interceptors([ChannelType::RestHook]).unwrap();
        pipeline.shutdown().unwrap();
        pipeline.shutdown().unwrap();
        assert!(pipeline.registered_types().is_empty());

        let msg = ResourceModifiedMessage::builder("Patient", "1", ResourceOperation::Create)
            .build()
            .unwrap();
        assert!(matches!(pipeline.submit(msg), Err(NotifyError::ChannelClosed { .. })));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.email.port = 0;
        assert!(SubscriptionPipeline::new(config, Senders::new())
            .unwrap_err()
            .is_configuration());
    }
}
