//! Wiring of matching channels and engines per channel type.
//!
//! `register` and `unregister` are idempotent: registering a wired type is a
//! no-op and unregistering with nothing wired does nothing. Between them the
//! loader fans every submitted change out to the wired matching channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelRegistry, MessageHandler};
use crate::config::MatchingSettings;
use crate::delivery::DeliveryRouter;
use crate::error::{ConfigurationError, NotifyError, NotifyResult};
use crate::matching::{MatchingCounters, MatchingEngine};
use crate::resource::ResourceModifiedMessage;
use crate::subscription::{ChannelType, SubscriptionRegistry};

type MatchingChannel = Channel<ResourceModifiedMessage>;

/// Enables and disables matching for a set of channel types.
pub struct InterceptorLoader {
    supported: BTreeSet<ChannelType>,
    settings: MatchingSettings,
    channels: Arc<ChannelRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    router: Arc<DeliveryRouter>,
    counters: Arc<MatchingCounters>,
    wired: Mutex<BTreeMap<ChannelType, Arc<MatchingChannel>>>,
}

impl std::fmt::Debug for InterceptorLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorLoader")
            .field("supported", &self.supported)
            .field("registered", &self.registered_types())
            .finish_non_exhaustive()
    }
}

impl InterceptorLoader {
    #[must_use]
    pub fn new(
        supported: BTreeSet<ChannelType>,
        settings: MatchingSettings,
        channels: Arc<ChannelRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        router: Arc<DeliveryRouter>,
        counters: Arc<MatchingCounters>,
    ) -> Self {
        Self {
            supported,
            settings,
            channels,
            subscriptions,
            router,
            counters,
            wired: Mutex::new(BTreeMap::new()),
        }
    }

    /// Wires a matching channel and engine for each type not yet wired.
    ///
    /// Every type is checked before anything is wired: one unsupported type
    /// fails the whole call.
    pub fn register(&self, types: impl IntoIterator<Item = ChannelType>) -> NotifyResult<()> {
        let types: BTreeSet<ChannelType> = types.into_iter().collect();
        if let Some(ct) = types
            .iter()
            .find(|ct| !self.supported.contains(*ct) || !self.router.can_deliver(**ct))
        {
            return Err(ConfigurationError::UnsupportedChannelType {
                channel_type: ct.code().to_string(),
            }
            .into());
        }

        let mut wired = self.wired.lock().unwrap_or_else(PoisonError::into_inner);
        for channel_type in types {
            if wired.contains_key(&channel_type) {
                debug!(channel_type = %channel_type, "interceptor already registered");
                continue;
            }

            let settings = self
                .settings
                .per_type
                .get(&channel_type)
                .copied()
                .unwrap_or(self.settings.default);
            let engine: Arc<dyn MessageHandler<ResourceModifiedMessage>> = Arc::new(MatchingEngine::new(
                channel_type,
                Arc::clone(&self.subscriptions),
                Arc::clone(&self.router),
                Arc::clone(&self.counters),
            ));
            let channel = self.channels.get_or_create_with::<ResourceModifiedMessage, _>(
                settings.spec(channel_type.matching_channel_name()),
                move |channel| {
                    channel.attach(engine);
                    Ok(())
                },
            )?;

            info!(
                channel_type = %channel_type,
                channel = channel.name(),
                concurrency = channel.concurrency(),
                "interceptor registered"
            );
            wired.insert(channel_type, channel);
        }
        Ok(())
    }

    /// Stops intake on every matching channel, drains and tears them down.
    ///
    /// Returns the number of channel types that were unwired.
    pub fn unregister(&self) -> NotifyResult<usize> {
        let wired = std::mem::take(&mut *self.wired.lock().unwrap_or_else(PoisonError::into_inner));
        if wired.is_empty() {
            return Ok(0);
        }

        let mut first_err = None;
        for (channel_type, channel) in &wired {
            if let Err(err) = self.channels.teardown(channel.name()) {
                warn!(channel_type = %channel_type, error = %err, "failed to tear down matching channel");
                first_err.get_or_insert(err);
            } else {
                info!(channel_type = %channel_type, "interceptor unregistered");
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(wired.len()),
        }
    }

    /// Sends `message` to every wired matching channel, blocking on full
    /// queues. Returns how many channels accepted it.
    pub fn dispatch(&self, message: &ResourceModifiedMessage) -> NotifyResult<usize> {
        let targets: Vec<Arc<MatchingChannel>> = self
            .wired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut accepted = 0;
        for channel in targets {
            match channel.send(message.clone()) {
                Ok(()) => accepted += 1,
                // Unregistered while we were sending.
                Err(NotifyError::ChannelClosed { name }) => {
                    debug!(channel = %name, "matching channel closed, message skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(accepted)
    }

    #[must_use]
    pub fn registered_types(&self) -> BTreeSet<ChannelType> {
        self.wired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    #[must_use]
    pub fn is_registered(&self, channel_type: ChannelType) -> bool {
        self.wired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&channel_type)
    }

    /// Names of the wired matching channels.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.wired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Queued messages across the wired matching channels.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.wired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.queue_depth())
            .sum()
    }
}
