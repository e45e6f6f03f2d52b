use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::NotifyResult;

/// Identifies a handler attached to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Consumer logic invoked by a channel's workers for each message.
///
/// An `Err` is logged by the worker and never stops it.
pub trait MessageHandler<M>: Send + Sync {
    /// Processes one message.
    fn handle(&self, message: &M) -> NotifyResult<()>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Adapts a closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    #[must_use]
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<M, F> MessageHandler<M> for FnHandler<F>
where
    F: Fn(&M) -> NotifyResult<()> + Send + Sync,
{
    fn handle(&self, message: &M) -> NotifyResult<()> {
        (self.f)(message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
