//! A named, bounded queue with its own worker pool.
//!
//! Producers block on a full queue; that is the pipeline's backpressure. Each
//! channel has its own workers, so a slow channel never stalls another.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{NotifyError, NotifyResult};

use super::handler::{HandlerId, MessageHandler};

/// What teardown does with messages still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Process every queued message before the workers exit.
    #[default]
    Drain,
    /// Skip queued messages; the one in flight still completes.
    Discard,
}

/// Name and sizing of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    /// Worker count, at least 1.
    pub concurrency: usize,
    /// Queue capacity, at least 1.
    pub capacity: usize,
}

impl ChannelSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, concurrency: usize, capacity: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            capacity: capacity.max(1),
        }
    }
}

/// Counters of one channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub dispatched: u64,
    pub unhandled: u64,
    pub handler_failures: u64,
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    unhandled: AtomicU64,
    handler_failures: AtomicU64,
    discarded: AtomicU64,
}

/// Queued plus in-flight message count, with a barrier on reaching zero.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        // `None` when the timeout is too large to represent: wait forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = match deadline {
                None => self.idle.wait(count).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.idle
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }
}

type HandlerList<M> = Vec<(HandlerId, Arc<dyn MessageHandler<M>>)>;

struct Shared<M> {
    name: String,
    handlers: RwLock<Arc<HandlerList<M>>>,
    pending: Pending,
    discard: AtomicBool,
    counters: Counters,
}

impl<M> Shared<M> {
    fn handlers(&self) -> Arc<HandlerList<M>> {
        Arc::clone(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn dispatch(&self, message: &M) {
        let handlers = self.handlers();
        if handlers.is_empty() {
            self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %self.name, "no handler attached, message dropped");
            return;
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        for (id, handler) in handlers.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = %self.name,
                        handler = handler.name(),
                        handler_id = %id,
                        error = %err,
                        "handler failed"
                    );
                }
                Err(_) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        channel = %self.name,
                        handler = handler.name(),
                        handler_id = %id,
                        "handler panicked"
                    );
                }
            }
        }
    }
}

fn worker_loop<M>(shared: Arc<Shared<M>>, rx: Receiver<M>) {
    while let Ok(message) = rx.recv() {
        if shared.discard.load(Ordering::Acquire) {
            shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.dispatch(&message);
        }
        shared.pending.done();
    }
    debug!(channel = %shared.name, "channel worker exiting");
}

/// A bounded channel carrying messages of type `M`.
pub struct Channel<M> {
    spec: ChannelSpec,
    shared: Arc<Shared<M>>,
    tx: RwLock<Option<Sender<M>>>,
    probe: Receiver<M>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<M> std::fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("spec", &self.spec)
            .field("queue_depth", &self.probe.len())
            .finish_non_exhaustive()
    }
}

impl<M: Send + 'static> Channel<M> {
    /// Creates the queue and starts `spec.concurrency` workers.
    pub fn start(spec: ChannelSpec) -> NotifyResult<Self> {
        let spec = ChannelSpec::new(spec.name, spec.concurrency, spec.capacity);
        let (tx, rx) = bounded::<M>(spec.capacity);

        let shared = Arc::new(Shared {
            name: spec.name.clone(),
            handlers: RwLock::new(Arc::new(Vec::new())),
            pending: Pending::default(),
            discard: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let mut handles = Vec::with_capacity(spec.concurrency);
        for idx in 0..spec.concurrency {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{idx}", spec.name))
                .spawn(move || worker_loop(shared, rx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Release the workers already started before bailing out.
                    drop(tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(NotifyError::internal(format!(
                        "failed to spawn worker for channel '{}': {e}",
                        spec.name
                    )));
                }
            }
        }

        info!(
            channel = %spec.name,
            concurrency = spec.concurrency,
            capacity = spec.capacity,
            "channel started"
        );

        Ok(Self {
            spec,
            shared,
            tx: RwLock::new(Some(tx)),
            probe: rx,
            workers: Mutex::new(handles),
        })
    }

    /// Enqueues `message`, blocking while the queue is full.
    pub fn send(&self, message: M) -> NotifyResult<()> {
        let tx = self.tx.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            return Err(NotifyError::ChannelClosed {
                name: self.spec.name.clone(),
            });
        };

        self.shared.pending.add();
        if tx.send(message).is_err() {
            self.shared.pending.done();
            return Err(NotifyError::ChannelClosed {
                name: self.spec.name.clone(),
            });
        }
        Ok(())
    }

    /// Attaches `handler`. Messages dispatched after this returns reach it.
    pub fn attach(&self, handler: Arc<dyn MessageHandler<M>>) -> HandlerId {
        let id = HandlerId::next();
        let mut guard = self.shared.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HandlerList::clone(&guard);
        next.push((id, handler));
        *guard = Arc::new(next);
        debug!(channel = %self.spec.name, handler_id = %id, "handler attached");
        id
    }

    /// Detaches a handler. The channel keeps running with zero handlers.
    pub fn detach(&self, id: HandlerId) -> bool {
        let mut guard = self.shared.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|(h, _)| *h == id) {
            return false;
        }
        let next: HandlerList<M> = guard.iter().filter(|(h, _)| *h != id).cloned().collect();
        *guard = Arc::new(next);
        debug!(channel = %self.spec.name, handler_id = %id, "handler detached");
        true
    }

    /// Stops intake and joins the workers after they drain (or discard).
    ///
    /// Called from one of this channel's own workers, the join is skipped.
    pub fn close(&self, policy: TeardownPolicy) {
        if policy == TeardownPolicy::Discard {
            self.shared.discard.store(true, Ordering::Release);
        }

        let tx = self.tx.write().unwrap_or_else(PoisonError::into_inner).take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                warn!(channel = %self.spec.name, "channel closed from its own worker; not joining");
                continue;
            }
            if handle.join().is_err() {
                error!(channel = %self.spec.name, "channel worker terminated abnormally");
            }
        }

        info!(channel = %self.spec.name, policy = ?policy, "channel closed");
    }
}

impl<M> Channel<M> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.spec.capacity
    }

    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.spec.concurrency
    }

    /// Messages waiting in the queue (not counting the ones being handled).
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.probe.len()
    }

    /// Queued plus in-flight messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.get()
    }

    /// Blocks until nothing is queued or in flight, or `timeout` elapses.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.pending.wait_idle(timeout)
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.handlers().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.read().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let c = &self.shared.counters;
        ChannelStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<M> Drop for Channel<M> {
    fn drop(&mut self) {
        // Closing the sender lets the workers drain and exit on their own.
        // Joining here could deadlock when the last reference is dropped on a worker.
        let tx = self.tx.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        drop(tx);
    }
}

/// Type-erased view used by the registry.
pub(crate) trait ChannelControl: Send + Sync {
    fn name(&self) -> &str;
    fn queue_depth(&self) -> usize;
    fn pending(&self) -> usize;
    fn wait_idle(&self, timeout: Duration) -> bool;
    fn close(&self, policy: TeardownPolicy);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<M: Send + 'static> ChannelControl for Channel<M> {
    fn name(&self) -> &str {
        Channel::name(self)
    }

    fn queue_depth(&self) -> usize {
        Channel::queue_depth(self)
    }

    fn pending(&self) -> usize {
        Channel::pending(self)
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        Channel::wait_idle(self, timeout)
    }

    fn close(&self, policy: TeardownPolicy) {
        Channel::close(self, policy);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use crate::channel::handler::FnHandler;

    fn recorder() -> (Arc<StdMutex<Vec<u32>>>, Arc<dyn MessageHandler<u32>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn MessageHandler<u32>> = Arc::new(FnHandler::new("recorder", move |m: &u32| -> NotifyResult<()> {
            sink.lock().unwrap().push(*m);
            Ok(())
        }));
        (seen, handler)
    }

    #[test]
    fn single_worker_preserves_fifo() {
        let ch = Channel::<u32>::start(ChannelSpec::new("fifo", 1, 8)).unwrap();
        let (seen, handler) = recorder();
        ch.attach(handler);

        for i in 0..100 {
            ch.send(i).unwrap();
        }
        assert!(ch.wait_idle(Duration::from_secs(5)));
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
        assert_eq!(ch.stats().dispatched, 100);
    }

    #[test]
    fn send_blocks_when_full() {
        let ch = Arc::new(Channel::<u32>::start(ChannelSpec::new("bp", 1, 1)).unwrap());
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        ch.attach(Arc::new(FnHandler::new("gate", move |_: &u32| -> NotifyResult<()> {
            let _ = started_tx.try_send(());
            let _ = gate_rx.recv();
            Ok(())
        })));

        ch.send(1).unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        ch.send(2).unwrap(); // fills the queue

        let (done_tx, done_rx) = bounded::<()>(1);
        let producer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                ch.send(3).unwrap();
                done_tx.send(()).unwrap();
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(ch.queue_depth(), 1);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        producer.join().unwrap();
        assert!(ch.wait_idle(Duration::from_secs(1)));
    }

    #[test]
    fn close_drains_queued_messages() {
        let ch = Channel::<u32>::start(ChannelSpec::new("drain", 2, 64)).unwrap();
        let (seen, handler) = recorder();
        ch.attach(handler);
        for i in 0..50 {
            ch.send(i).unwrap();
        }
        ch.close(TeardownPolicy::Drain);

        assert_eq!(seen.lock().unwrap().len(), 50);
        assert_eq!(ch.pending(), 0);
        assert!(ch.is_closed());
        assert!(matches!(ch.send(99), Err(NotifyError::ChannelClosed { .. })));
    }

    #[test]
    fn close_with_discard_skips_queue() {
        let ch = Channel::<u32>::start(ChannelSpec::new("discard", 1, 16)).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        ch.attach(Arc::new(FnHandler::new("gate", move |_: &u32| -> NotifyResult<()> {
            let _ = started_tx.try_send(());
            let _ = gate_rx.recv_timeout(Duration::from_secs(1));
            Ok(())
        })));

        ch.send(0).unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        for i in 1..5 {
            ch.send(i).unwrap();
        }

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = gate_tx.send(());
        });
        ch.close(TeardownPolicy::Discard);
        releaser.join().unwrap();

        let stats = ch.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.discarded, 4);
        assert_eq!(ch.pending(), 0);
    }

    #[test]
    fn handler_failure_and_panic_do_not_stop_worker() {
        let ch = Channel::<u32>::start(ChannelSpec::new("iso", 1, 8)).unwrap();
        ch.attach(Arc::new(FnHandler::new("flaky", |m: &u32| -> NotifyResult<()> {
            if *m == 1 {
                return Err(NotifyError::internal("bad message"));
            }
            if *m == 2 {
                panic!("handler bug");
            }
            Ok(())
        })));
        let (seen, handler) = recorder();
        ch.attach(handler);

        for i in 0..4 {
            ch.send(i).unwrap();
        }
        assert!(ch.wait_idle(Duration::from_secs(2)));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(ch.stats().handler_failures, 2);
    }

    #[test]
    fn detach_last_handler_keeps_channel() {
        let ch = Channel::<u32>::start(ChannelSpec::new("detach", 1, 8)).unwrap();
        let (_, handler) = recorder();
        let id = ch.attach(handler);
        assert!(ch.detach(id));
        assert!(!ch.detach(id));
        assert_eq!(ch.handler_count(), 0);

        ch.send(1).unwrap();
        assert!(ch.wait_idle(Duration::from_secs(1)));
        assert_eq!(ch.stats().unhandled, 1);
        assert!(!ch.is_closed());
    }

    #[test]
    fn spec_clamps_zero_sizes() {
        let spec = ChannelSpec::new("z", 0, 0);
        assert_eq!(spec.concurrency, 1);
        assert_eq!(spec.capacity, 1);
    }
}
