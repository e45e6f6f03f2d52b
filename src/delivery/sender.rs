//! Contracts of the external sinks deliveries are handed to.

use std::fmt;
use std::sync::Arc;

use crate::error::DeliveryError;

use super::email::{EmailMessage, EmailTransportConfig};

/// Performs an HTTP callback to a subscriber's endpoint.
pub trait CallbackSender: Send + Sync {
    /// Sends `payload` (absent for empty notifications) to `url`.
    fn send_callback(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: Option<&str>,
    ) -> Result<(), DeliveryError>;
}

/// Hands a rendered email to a mail transport.
pub trait EmailSender: Send + Sync {
    fn send_email(&self, transport: &EmailTransportConfig, message: &EmailMessage) -> Result<(), DeliveryError>;
}

/// Pushes a payload to an open socket session.
pub trait SocketPusher: Send + Sync {
    /// Fails with `SessionClosed`/`SessionNotFound` when the session is gone.
    fn push(&self, session_id: &str, payload: &str) -> Result<(), DeliveryError>;
}

/// The sinks available to a pipeline. A channel type without a sender
/// cannot be registered.
#[derive(Clone, Default)]
pub struct Senders {
    pub callback: Option<Arc<dyn CallbackSender>>,
    pub email: Option<Arc<dyn EmailSender>>,
    pub socket: Option<Arc<dyn SocketPusher>>,
}

impl Senders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_callback(mut self, sender: Arc<dyn CallbackSender>) -> Self {
        self.callback = Some(sender);
        self
    }

    #[must_use]
    pub fn with_email(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    #[must_use]
    pub fn with_socket(mut self, pusher: Arc<dyn SocketPusher>) -> Self {
        self.socket = Some(pusher);
        self
    }
}

impl fmt::Debug for Senders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Senders")
            .field("callback", &self.callback.is_some())
            .field("email", &self.email.is_some())
            .field("socket", &self.socket.is_some())
            .finish()
    }
}
