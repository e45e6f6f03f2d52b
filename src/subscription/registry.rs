//! In-memory index of subscriptions.
//!
//! Writers replace the whole map behind an `RwLock<Arc<..>>` (copy-on-write),
//! so a [`SubscriptionSnapshot`] is just a cloned `Arc` and never observes a
//! half-applied mutation.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::{LookupError, NotifyError, NotifyResult};

use super::types::{ActiveSubscription, ChannelType, SubscriptionId, SubscriptionStatus};

type SubscriptionMap = HashMap<SubscriptionId, Arc<ActiveSubscription>>;

fn lock_err(context: &'static str) -> NotifyError {
    NotifyError::internal(format!("poisoned lock: {context}"))
}

/// Registry of subscriptions keyed by id.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    supported: BTreeSet<ChannelType>,
    entries: RwLock<Arc<SubscriptionMap>>,
}

impl SubscriptionRegistry {
    /// Creates a registry accepting the given channel types.
    #[must_use]
    pub fn new(supported: impl IntoIterator<Item = ChannelType>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn is_supported(&self, channel_type: ChannelType) -> bool {
        self.supported.contains(&channel_type)
    }

    /// Inserts or replaces a subscription by id.
    ///
    /// The stored status is `OFF` when the channel type is unsupported, the
    /// record's own `OFF`/`ERROR` status when it carries one, and `ACTIVE`
    /// otherwise.
    pub fn put(&self, mut subscription: ActiveSubscription) -> NotifyResult<Arc<ActiveSubscription>> {
        let status = if !self.is_supported(subscription.channel_type()) {
            SubscriptionStatus::Off
        } else {
            match subscription.status() {
                SubscriptionStatus::Requested | SubscriptionStatus::Active => SubscriptionStatus::Active,
                other => other,
            }
        };
        subscription.set_status(status);

        let entry = Arc::new(subscription);
        let mut guard = self.entries.write().map_err(|_| lock_err("subscription registry"))?;
        let mut next = SubscriptionMap::clone(&guard);
        let replaced = next.insert(entry.id().clone(), Arc::clone(&entry)).is_some();
        *guard = Arc::new(next);
        drop(guard);

        info!(
            subscription_id = %entry.id(),
            channel_type = %entry.channel_type(),
            status = %status,
            replaced,
            "subscription registered"
        );
        Ok(entry)
    }

    /// Returns the subscription with `id`.
    pub fn get(&self, id: &SubscriptionId) -> NotifyResult<Arc<ActiveSubscription>> {
        let guard = self.entries.read().map_err(|_| lock_err("subscription registry"))?;
        guard.get(id).cloned().ok_or_else(|| {
            LookupError::SubscriptionNotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Removes the subscription with `id`; absent ids are a no-op.
    pub fn remove(&self, id: &SubscriptionId) -> NotifyResult<Option<Arc<ActiveSubscription>>> {
        let mut guard = self.entries.write().map_err(|_| lock_err("subscription registry"))?;
        if !guard.contains_key(id) {
            debug!(subscription_id = %id, "remove of unknown subscription ignored");
            return Ok(None);
        }
        let mut next = SubscriptionMap::clone(&guard);
        let removed = next.remove(id);
        *guard = Arc::new(next);
        drop(guard);

        info!(subscription_id = %id, "subscription removed");
        Ok(removed)
    }

    /// Consistent view of the `ACTIVE` subscriptions.
    pub fn snapshot(&self) -> NotifyResult<SubscriptionSnapshot> {
        let guard = self.entries.read().map_err(|_| lock_err("subscription registry"))?;
        Ok(SubscriptionSnapshot {
            entries: Arc::clone(&guard),
        })
    }

    /// Number of subscriptions in any status.
    pub fn len(&self) -> NotifyResult<usize> {
        Ok(self.entries.read().map_err(|_| lock_err("subscription registry"))?.len())
    }

    pub fn is_empty(&self) -> NotifyResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn active_count(&self) -> NotifyResult<usize> {
        Ok(self.snapshot()?.len())
    }

    /// Ids of all subscriptions, sorted.
    pub fn ids(&self) -> NotifyResult<Vec<SubscriptionId>> {
        let guard = self.entries.read().map_err(|_| lock_err("subscription registry"))?;
        let mut ids: Vec<SubscriptionId> = guard.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Drops every subscription and returns what was removed.
    pub fn clear(&self) -> NotifyResult<Vec<Arc<ActiveSubscription>>> {
        let mut guard = self.entries.write().map_err(|_| lock_err("subscription registry"))?;
        let old = std::mem::replace(&mut *guard, Arc::new(HashMap::new()));
        drop(guard);
        Ok(old.values().cloned().collect())
    }
}

/// Read-only view of the active subscriptions at one point in time.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    entries: Arc<SubscriptionMap>,
}

impl SubscriptionSnapshot {
    /// Active subscriptions.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ActiveSubscription>> {
        self.entries.values().filter(|s| s.is_active())
    }

    /// Active subscriptions delivering over `channel_type`.
    pub fn of_type(&self, channel_type: ChannelType) -> impl Iterator<Item = &Arc<ActiveSubscription>> {
        self.iter().filter(move |s| s.channel_type() == channel_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::subscription::{Criteria, Endpoint};

    fn sub(id: &str, endpoint: Endpoint) -> ActiveSubscription {
        ActiveSubscription::new(
            SubscriptionId::new(id).unwrap(),
            Criteria::parse("Patient").unwrap(),
            endpoint,
        )
        .unwrap()
    }

    #[test]
    fn put_activates_supported_types() {
        let reg = SubscriptionRegistry::new([ChannelType::RestHook]);
        let stored = reg.put(sub("1", Endpoint::rest_hook("http://h/1"))).unwrap();
        assert_eq!(stored.status(), SubscriptionStatus::Active);
        assert_eq!(reg.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn put_turns_off_unsupported_types() {
        let reg = SubscriptionRegistry::new([ChannelType::RestHook]);
        let stored = reg.put(sub("1", Endpoint::email("a@b.org"))).unwrap();
        assert_eq!(stored.status(), SubscriptionStatus::Off);
        assert!(reg.snapshot().unwrap().is_empty());
        assert_eq!(reg.len().unwrap(), 1);
        assert_eq!(reg.get(stored.id()).unwrap().status(), SubscriptionStatus::Off);
    }

    #[test]
    fn put_keeps_error_status() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        let stored = reg
            .put(sub("1", Endpoint::rest_hook("http://h/1")).with_status(SubscriptionStatus::Error))
            .unwrap();
        assert_eq!(stored.status(), SubscriptionStatus::Error);
        assert_eq!(reg.active_count().unwrap(), 0);
    }

    #[test]
    fn put_replaces_by_id() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        reg.put(sub("1", Endpoint::rest_hook("http://h/1"))).unwrap();
        reg.put(sub("1", Endpoint::rest_hook("http://h/2"))).unwrap();
        assert_eq!(reg.len().unwrap(), 1);
        let got = reg.get(&SubscriptionId::new("1").unwrap()).unwrap();
        assert_eq!(got.endpoint(), &Endpoint::rest_hook("http://h/2"));
    }

    #[test]
    fn get_unknown_is_lookup_error() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        let err = reg.get(&SubscriptionId::new("nope").unwrap()).unwrap_err();
        assert!(err.is_lookup());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        assert!(reg.remove(&SubscriptionId::new("nope").unwrap()).unwrap().is_none());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        reg.put(sub("1", Endpoint::rest_hook("http://h/1"))).unwrap();
        let snap = reg.snapshot().unwrap();

        reg.put(sub("2", Endpoint::rest_hook("http://h/2"))).unwrap();
        reg.remove(&SubscriptionId::new("1").unwrap()).unwrap();

        let ids: Vec<&str> = snap.iter().map(|s| s.id().as_str()).collect();
        assert_eq!(ids, vec!["1"]);
        assert_eq!(reg.ids().unwrap(), vec![SubscriptionId::new("2").unwrap()]);
    }

    #[test]
    fn snapshot_filters_by_type() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        reg.put(sub("1", Endpoint::rest_hook("http://h/1"))).unwrap();
        reg.put(sub("2", Endpoint::email("a@b.org"))).unwrap();
        let snap = reg.snapshot().unwrap();
        assert_eq!(snap.of_type(ChannelType::Email).count(), 1);
        assert_eq!(snap.of_type(ChannelType::WebSocket).count(), 0);
    }

    #[test]
    fn concurrent_readers_see_whole_entries() {
        let reg = Arc::new(SubscriptionRegistry::new(ChannelType::ALL));
        let writer = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let url = format!("http://h/{i}");
                    reg.put(sub("1", Endpoint::rest_hook(url))).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let snap = reg.snapshot().unwrap();
            for s in snap.iter() {
                assert_eq!(s.channel_name(), "subscription-delivery-rest-hook-1");
                assert!(matches!(s.endpoint(), Endpoint::RestHook { url, .. } if url.starts_with("http://h/")));
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn clear_returns_removed() {
        let reg = SubscriptionRegistry::new(ChannelType::ALL);
        reg.put(sub("1", Endpoint::rest_hook("http://h/1"))).unwrap();
        reg.put(sub("2", Endpoint::web_socket("s"))).unwrap();
        assert_eq!(reg.clear().unwrap().len(), 2);
        assert!(reg.is_empty().unwrap());
    }
}
