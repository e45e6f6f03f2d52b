//! Delivery subscribers and the external sinks they hand messages to.

mod email;
/// In-memory sender implementations.
pub mod memory;
mod retry;
mod router;
mod sender;
mod subscriber;
mod tracker;

pub use email::{EmailMessage, EmailTransportConfig};
pub use memory::{CallbackCall, RecordingCallbackSender, RecordingEmailSender, SentEmail, SessionRegistry};
pub use retry::RetryPolicy;
pub use router::DeliveryRouter;
pub use sender::{CallbackSender, EmailSender, Senders, SocketPusher};
pub use subscriber::{DeliveryHandler, DeliverySubscriber};
pub use tracker::{DeliveryOutcome, DeliveryState, DeliveryStats, DeliveryTracker, TypeDeliveryStats};
