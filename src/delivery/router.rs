//! Routes delivery messages to per-subscription delivery channels.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::channel::{Channel, ChannelRegistry, MessageHandler};
use crate::config::ChannelSettings;
use crate::error::{ConfigurationError, LookupError, NotifyError, NotifyResult};
use crate::resource::ResourceDeliveryMessage;
use crate::subscription::{ActiveSubscription, ChannelType, SubscriptionRegistry};

use super::subscriber::DeliveryHandler;

/// Owns the delivery side of the channel registry.
pub struct DeliveryRouter {
    channels: Arc<ChannelRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    handlers: BTreeMap<ChannelType, Arc<DeliveryHandler>>,
    settings: ChannelSettings,
}

impl std::fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRouter")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DeliveryRouter {
    #[must_use]
    pub fn new(
        channels: Arc<ChannelRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        handlers: impl IntoIterator<Item = DeliveryHandler>,
        settings: ChannelSettings,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.subscriber().channel_type(), Arc::new(h)))
            .collect();
        Self {
            channels,
            subscriptions,
            handlers,
            settings,
        }
    }

    /// True if a subscriber exists for `channel_type`.
    #[must_use]
    pub fn can_deliver(&self, channel_type: ChannelType) -> bool {
        self.handlers.contains_key(&channel_type)
    }

    /// Delivery channel of `subscription`, created with its subscriber
    /// attached on first use.
    ///
    /// Creation fails with a lookup error if the subscription is no longer
    /// registered, so a concurrent delete never leaves a channel behind.
    pub fn channel_for(
        &self,
        subscription: &ActiveSubscription,
    ) -> NotifyResult<Arc<Channel<ResourceDeliveryMessage>>> {
        let channel_type = subscription.channel_type();
        let handler = self
            .handlers
            .get(&channel_type)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnsupportedChannelType {
                channel_type: channel_type.code().to_string(),
            })?;

        let spec = self.settings.spec(subscription.channel_name());
        self.channels
            .get_or_create_with::<ResourceDeliveryMessage, _>(spec, |channel| {
                let current = self.subscriptions.get(subscription.id())?;
                if !current.is_active() || current.channel_name() != subscription.channel_name() {
                    return Err(LookupError::SubscriptionNotFound {
                        id: subscription.id().to_string(),
                    }
                    .into());
                }
                channel.attach(handler as Arc<dyn MessageHandler<ResourceDeliveryMessage>>);
                debug!(
                    channel = channel.name(),
                    subscription_id = %subscription.id(),
                    "delivery channel provisioned"
                );
                Ok(())
            })
    }

    /// Enqueues `message` on its subscription's channel, blocking while full.
    pub fn route(&self, subscription: &ActiveSubscription, message: ResourceDeliveryMessage) -> NotifyResult<()> {
        self.channel_for(subscription)?.send(message)
    }

    /// Tears down the delivery channel `name`; false if it did not exist.
    pub fn release(&self, name: &str) -> NotifyResult<bool> {
        match self.channels.teardown(name) {
            Ok(()) => Ok(true),
            Err(NotifyError::Lookup(LookupError::ChannelNotFound { .. })) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
