//! Channel factory and registry.
//!
//! A channel is a named, bounded queue with a fixed message type and its own
//! worker pool. Workers dispatch each message to the handlers currently
//! attached to the channel.

/// Handler trait and closure adapter.
pub mod handler;
/// Bounded queue and worker pool.
pub mod queue;
/// Create-if-absent registry of named channels.
pub mod registry;

pub use handler::{FnHandler, HandlerId, MessageHandler};
pub use queue::{Channel, ChannelSpec, ChannelStats, TeardownPolicy};
pub use registry::ChannelRegistry;
