//! Named registry of typed channels.
//!
//! `get_or_create` is an atomic create-if-absent: concurrent callers racing on
//! one name all receive the same channel. A name is bound to one message type
//! for the life of the channel.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{ConfigurationError, LookupError, NotifyError, NotifyResult};

use super::handler::{HandlerId, MessageHandler};
use super::queue::{Channel, ChannelControl, ChannelSpec, TeardownPolicy};

fn lock_err(context: &'static str) -> NotifyError {
    NotifyError::internal(format!("poisoned lock: {context}"))
}

#[derive(Clone)]
struct ChannelEntry {
    type_id: TypeId,
    message_type: &'static str,
    control: Arc<dyn ChannelControl>,
}

impl ChannelEntry {
    fn downcast<M: Send + 'static>(&self, name: &str) -> NotifyResult<Arc<Channel<M>>> {
        if self.type_id != TypeId::of::<M>() {
            return Err(ConfigurationError::ChannelTypeMismatch {
                name: name.to_string(),
                existing: self.message_type,
                requested: type_name::<M>(),
            }
            .into());
        }
        Arc::clone(&self.control)
            .into_any()
            .downcast::<Channel<M>>()
            .map_err(|_| NotifyError::internal(format!("channel '{name}' failed to downcast")))
    }
}

/// Channel factory and registry.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, ChannelEntry>>,
    teardown_policy: TeardownPolicy,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names().unwrap_or_default();
        f.debug_struct("ChannelRegistry")
            .field("channels", &names)
            .field("teardown_policy", &self.teardown_policy)
            .finish()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(TeardownPolicy::default())
    }
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(teardown_policy: TeardownPolicy) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            teardown_policy,
        }
    }

    /// Returns the channel named `spec.name`, creating it if absent.
    ///
    /// An existing channel keeps its original sizing.
    pub fn get_or_create<M: Send + 'static>(&self, spec: ChannelSpec) -> NotifyResult<Arc<Channel<M>>> {
        self.get_or_create_with(spec, |_| Ok(()))
    }

    /// Like [`ChannelRegistry::get_or_create`], running `init` on a new
    /// channel before any other caller can see it.
    ///
    /// If `init` fails the new channel is closed and nothing is registered.
    pub fn get_or_create_with<M, F>(&self, spec: ChannelSpec, init: F) -> NotifyResult<Arc<Channel<M>>>
    where
        M: Send + 'static,
        F: FnOnce(&Channel<M>) -> NotifyResult<()>,
    {
        {
            let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
            if let Some(entry) = guard.get(&spec.name) {
                return entry.downcast::<M>(&spec.name);
            }
        }

        let mut guard = self.channels.write().map_err(|_| lock_err("channel registry"))?;
        // Another caller may have created it between the two locks.
        if let Some(entry) = guard.get(&spec.name) {
            return entry.downcast::<M>(&spec.name);
        }

        let name = spec.name.clone();
        let channel = Arc::new(Channel::<M>::start(spec)?);
        if let Err(err) = init(&channel) {
            channel.close(TeardownPolicy::Discard);
            return Err(err);
        }

        let control: Arc<dyn ChannelControl> = Arc::clone(&channel) as Arc<dyn ChannelControl>;
        guard.insert(
            name.clone(),
            ChannelEntry {
                type_id: TypeId::of::<M>(),
                message_type: type_name::<M>(),
                control,
            },
        );
        debug!(channel = %name, message_type = type_name::<M>(), "channel registered");
        Ok(channel)
    }

    /// Returns an existing channel.
    pub fn get<M: Send + 'static>(&self, name: &str) -> NotifyResult<Arc<Channel<M>>> {
        let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
        let entry = guard.get(name).ok_or_else(|| LookupError::ChannelNotFound {
            name: name.to_string(),
        })?;
        entry.downcast::<M>(name)
    }

    pub fn contains(&self, name: &str) -> NotifyResult<bool> {
        Ok(self
            .channels
            .read()
            .map_err(|_| lock_err("channel registry"))?
            .contains_key(name))
    }

    /// Names of all channels, sorted.
    pub fn names(&self) -> NotifyResult<Vec<String>> {
        let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn attach_handler<M: Send + 'static>(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler<M>>,
    ) -> NotifyResult<HandlerId> {
        Ok(self.get::<M>(name)?.attach(handler))
    }

    /// Detaches a handler; returns false if it was not attached.
    pub fn detach_handler<M: Send + 'static>(&self, name: &str, id: HandlerId) -> NotifyResult<bool> {
        Ok(self.get::<M>(name)?.detach(id))
    }

    /// Removes `name`, then drains (or discards) and joins its workers.
    pub fn teardown(&self, name: &str) -> NotifyResult<()> {
        let entry = {
            let mut guard = self.channels.write().map_err(|_| lock_err("channel registry"))?;
            guard.remove(name).ok_or_else(|| LookupError::ChannelNotFound {
                name: name.to_string(),
            })?
        };
        // Closing outside the lock: draining workers may create other channels.
        entry.control.close(self.teardown_policy);
        info!(channel = %name, "channel torn down");
        Ok(())
    }

    /// Tears down every channel; returns how many were removed.
    pub fn teardown_all(&self) -> NotifyResult<usize> {
        let entries: Vec<ChannelEntry> = {
            let mut guard = self.channels.write().map_err(|_| lock_err("channel registry"))?;
            guard.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            entry.control.close(self.teardown_policy);
        }
        Ok(entries.len())
    }

    /// Messages waiting in the queue of `name`.
    pub fn queue_depth(&self, name: &str) -> NotifyResult<usize> {
        let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
        guard
            .get(name)
            .map(|e| e.control.queue_depth())
            .ok_or_else(|| {
                LookupError::ChannelNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Queue depth of every channel.
    pub fn queue_depths(&self) -> NotifyResult<BTreeMap<String, usize>> {
        let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
        Ok(guard
            .iter()
            .map(|(name, e)| (name.clone(), e.control.queue_depth()))
            .collect())
    }

    /// Queued plus in-flight messages across all channels.
    pub fn total_pending(&self) -> NotifyResult<usize> {
        Ok(self.controls()?.iter().map(|c| c.pending()).sum())
    }

    fn controls(&self) -> NotifyResult<Vec<Arc<dyn ChannelControl>>> {
        let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
        Ok(guard.values().map(|e| Arc::clone(&e.control)).collect())
    }

    /// Blocks until every channel is idle, or `timeout` elapses.
    ///
    /// `upstream` channels are settled first on each pass, so messages they
    /// hand to other channels are already counted when those are checked.
    pub fn wait_for_idle(&self, upstream: &[String], timeout: Duration) -> NotifyResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let mut ordered: Vec<Arc<dyn ChannelControl>> = Vec::new();
            {
                let guard = self.channels.read().map_err(|_| lock_err("channel registry"))?;
                ordered.extend(
                    upstream
                        .iter()
                        .filter_map(|n| guard.get(n))
                        .map(|e| Arc::clone(&e.control)),
                );
                ordered.extend(
                    guard
                        .iter()
                        .filter(|(n, _)| !upstream.contains(*n))
                        .map(|(_, e)| Arc::clone(&e.control)),
                );
            }

            let mut settled = true;
            for control in &ordered {
                if control.pending() == 0 {
                    continue;
                }
                settled = false;
                let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
                if !control.wait_idle(remaining) {
                    debug!(channel = control.name(), "channel still busy at deadline");
                    return Ok(false);
                }
            }
            if settled {
                return Ok(true);
            }
        }
    }
}
