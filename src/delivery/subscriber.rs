//! Delivery subscribers: the handlers bound to delivery channels.
//!
//! Each message moves `Received → Attempting → {Delivered | Failed}`. A failed
//! attempt is retried only while the error is retryable and the
//! [`RetryPolicy`] has attempts left. The terminal state is recorded on the
//! shared [`DeliveryTracker`]; a failure never stops the worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

use crate::channel::MessageHandler;
use crate::error::{DeliveryError, NotifyResult};
use crate::resource::ResourceDeliveryMessage;
use crate::subscription::{ChannelType, Endpoint};

use super::email::{EmailMessage, EmailTransportConfig};
use super::retry::RetryPolicy;
use super::sender::{CallbackSender, EmailSender, SocketPusher};
use super::tracker::{DeliveryOutcome, DeliveryState, DeliveryTracker};

/// The external send of one channel type.
#[derive(Clone)]
pub enum DeliverySubscriber {
    RestHook(Arc<dyn CallbackSender>),
    Email {
        sender: Arc<dyn EmailSender>,
        transport: EmailTransportConfig,
    },
    WebSocket(Arc<dyn SocketPusher>),
}

impl std::fmt::Debug for DeliverySubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestHook(_) => f.write_str("DeliverySubscriber::RestHook"),
            Self::Email { transport, .. } => f
                .debug_struct("DeliverySubscriber::Email")
                .field("transport", transport)
                .finish_non_exhaustive(),
            Self::WebSocket(_) => f.write_str("DeliverySubscriber::WebSocket"),
        }
    }
}

impl DeliverySubscriber {
    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        match self {
            Self::RestHook(_) => ChannelType::RestHook,
            Self::Email { .. } => ChannelType::Email,
            Self::WebSocket(_) => ChannelType::WebSocket,
        }
    }

    /// Performs a single send of `message`.
    pub fn attempt(&self, message: &ResourceDeliveryMessage) -> Result<(), DeliveryError> {
        let endpoint = message.subscription().endpoint();
        match (self, endpoint) {
            (Self::RestHook(sender), Endpoint::RestHook { url, headers }) => {
                let mut headers = headers.clone();
                if let Some(content_type) = message.payload_content.content_type() {
                    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                        headers.push(("Content-Type".to_string(), content_type.to_string()));
                    }
                }
                sender.send_callback(url, &headers, message.payload.as_deref())
            }
            (Self::Email { sender, transport }, Endpoint::Email { .. }) => {
                let email = EmailMessage::render(transport, message)?;
                sender.send_email(transport, &email)
            }
            (Self::WebSocket(pusher), Endpoint::WebSocket { session_id }) => match message.payload.as_deref() {
                Some(payload) => pusher.push(session_id, payload),
                None => pusher.push(session_id, &format!("ping {}", message.subscription_id)),
            },
            (_, other) => Err(DeliveryError::EndpointMismatch {
                reason: format!(
                    "{} subscriber got a {} endpoint",
                    self.channel_type(),
                    other.channel_type()
                ),
            }),
        }
    }
}

/// A [`DeliverySubscriber`] with its retry policy and tracker, attached to
/// delivery channels.
#[derive(Debug)]
pub struct DeliveryHandler {
    subscriber: DeliverySubscriber,
    retry: RetryPolicy,
    tracker: Arc<DeliveryTracker>,
    name: String,
}

impl DeliveryHandler {
    #[must_use]
    pub fn new(subscriber: DeliverySubscriber, retry: RetryPolicy, tracker: Arc<DeliveryTracker>) -> Self {
        let name = format!("{}-subscriber", subscriber.channel_type().code());
        Self {
            subscriber,
            retry,
            tracker,
            name,
        }
    }

    #[must_use]
    pub const fn subscriber(&self) -> &DeliverySubscriber {
        &self.subscriber
    }

    fn finish(
        &self,
        message: &ResourceDeliveryMessage,
        state: DeliveryState,
        attempts: u32,
        error: Option<&DeliveryError>,
    ) {
        self.tracker.record(DeliveryOutcome {
            subscription_id: message.subscription_id.clone(),
            channel_type: self.subscriber.channel_type(),
            resource_reference: message.resource_reference.clone(),
            state,
            attempts,
            error: error.map(ToString::to_string),
        });
    }
}

impl MessageHandler<ResourceDeliveryMessage> for DeliveryHandler {
    fn handle(&self, message: &ResourceDeliveryMessage) -> NotifyResult<()> {
        let mut state = DeliveryState::Received;
        debug!(
            subscription_id = %message.subscription_id,
            resource = %message.resource_reference,
            state = %state,
            "delivery received"
        );

        let max_attempts = self.retry.attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            state = DeliveryState::Attempting;
            debug!(subscription_id = %message.subscription_id, attempt, state = %state, "delivery attempt");

            let result = panic::catch_unwind(AssertUnwindSafe(|| self.subscriber.attempt(message)));
            let err = match result {
                Ok(Ok(())) => {
                    state = DeliveryState::Delivered;
                    debug!(
                        subscription_id = %message.subscription_id,
                        resource = %message.resource_reference,
                        attempt,
                        state = %state,
                        "delivered"
                    );
                    self.finish(message, state, attempt, None);
                    return Ok(());
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    error!(subscription_id = %message.subscription_id, attempt, "sender panicked");
                    let err = DeliveryError::transport("sender panicked");
                    self.finish(message, DeliveryState::Failed, attempt, Some(&err));
                    return Err(err.into());
                }
            };

            if err.is_retryable() && attempt < max_attempts {
                let delay = self.retry.delay(attempt - 1);
                warn!(
                    subscription_id = %message.subscription_id,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "delivery attempt failed, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                continue;
            }

            state = DeliveryState::Failed;
            warn!(
                subscription_id = %message.subscription_id,
                resource = %message.resource_reference,
                attempt,
                state = %state,
                error = %err,
                "delivery failed"
            );
            self.finish(message, state, attempt, Some(&err));
            return Err(err.into());
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
