//! Matching engine.
//!
//! One engine per wired channel type consumes resource change messages from
//! that type's matching channel. For each message it takes a registry
//! snapshot, evaluates every interested active subscription of its type and
//! enqueues one delivery message per match on the subscription's delivery
//! channel.

mod engine;

pub use engine::{MatchingCounters, MatchingEngine, MatchingStats};
