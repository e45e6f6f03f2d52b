//! In-memory senders, used for embedding and testing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

use crate::error::DeliveryError;

use super::email::{EmailMessage, EmailTransportConfig};
use super::sender::{CallbackSender, EmailSender, SocketPusher};

/// One recorded callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackCall {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<String>,
}

/// Records callbacks instead of performing HTTP requests.
///
/// URLs registered with [`RecordingCallbackSender::fail_for`] fail with the
/// given error and are not recorded.
#[derive(Debug, Default)]
pub struct RecordingCallbackSender {
    calls: Mutex<Vec<CallbackCall>>,
    failing: Mutex<HashMap<String, DeliveryError>>,
}

impl RecordingCallbackSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send to `url` fail with `error`.
    pub fn fail_for(&self, url: impl Into<String>, error: DeliveryError) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), error);
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).remove(url);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CallbackCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Recorded calls to `url`.
    #[must_use]
    pub fn calls_to(&self, url: &str) -> Vec<CallbackCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.url == url)
            .collect()
    }
}

impl CallbackSender for RecordingCallbackSender {
    fn send_callback(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: Option<&str>,
    ) -> Result<(), DeliveryError> {
        if let Some(err) = self.failing.lock().unwrap_or_else(PoisonError::into_inner).get(url) {
            return Err(err.clone());
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CallbackCall {
                url: url.to_string(),
                headers: headers.to_vec(),
                payload: payload.map(str::to_string),
            });
        Ok(())
    }
}

/// One recorded email with the transport it was handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub host: String,
    pub port: u16,
    pub message: EmailMessage,
}

/// Records emails instead of talking to a mail server.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<SentEmail>>,
    failure: Mutex<Option<DeliveryError>>,
}

impl RecordingEmailSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send fail with `error` until cleared with `None`.
    pub fn set_failure(&self, error: Option<DeliveryError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EmailSender for RecordingEmailSender {
    fn send_email(&self, transport: &EmailTransportConfig, message: &EmailMessage) -> Result<(), DeliveryError> {
        if let Some(err) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(err);
        }
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(SentEmail {
            host: transport.host.clone(),
            port: transport.port,
            message: message.clone(),
        });
        Ok(())
    }
}

#[derive(Debug)]
enum Session {
    Open(Sender<String>),
    Closed,
}

/// Open push sessions, each with a bounded inbox.
#[derive(Debug)]
pub struct SessionRegistry {
    inbox_capacity: usize,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(inbox_capacity: usize) -> Self {
        Self {
            inbox_capacity: inbox_capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Opens (or reopens) a session and returns its inbox.
    pub fn open(&self, session_id: impl Into<String>) -> Receiver<String> {
        let session_id = session_id.into();
        let (tx, rx) = bounded(self.inbox_capacity);
        debug!(session_id = %session_id, "socket session opened");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, Session::Open(tx));
        rx
    }

    /// Closes a session; returns false if it was not open.
    pub fn close(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(session_id) {
            Some(session @ Session::Open(_)) => {
                *session = Session::Closed;
                debug!(session_id, "socket session closed");
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_open(&self, session_id: &str) -> bool {
        matches!(
            self.sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(session_id),
            Some(Session::Open(_))
        )
    }
}

impl SocketPusher for SessionRegistry {
    fn push(&self, session_id: &str, payload: &str) -> Result<(), DeliveryError> {
        let tx = match self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            Some(Session::Open(tx)) => tx.clone(),
            Some(Session::Closed) => {
                return Err(DeliveryError::SessionClosed {
                    session_id: session_id.to_string(),
                })
            }
            None => {
                return Err(DeliveryError::SessionNotFound {
                    session_id: session_id.to_string(),
                })
            }
        };

        match tx.try_send(payload.to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::transport(format!(
                "inbox of session '{session_id}' is full"
            ))),
            // The client dropped its receiver.
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::SessionClosed {
                session_id: session_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_failure_injection_is_per_url() {
        let sender = RecordingCallbackSender::new();
        sender.fail_for("http://down/cb", DeliveryError::Rejected { status: 500 });

        assert!(sender.send_callback("http://down/cb", &[], Some("{}")).is_err());
        sender.send_callback("http://up/cb", &[], None).unwrap();
        assert_eq!(sender.calls().len(), 1);
        assert!(sender.calls_to("http://down/cb").is_empty());

        sender.heal("http://down/cb");
        sender.send_callback("http://down/cb", &[], Some("{}")).unwrap();
        assert_eq!(sender.calls_to("http://down/cb").len(), 1);
    }

    #[test]
    fn email_failure_toggle() {
        let sender = RecordingEmailSender::new();
        let msg = EmailMessage {
            from: "a@b.org".to_string(),
            to: vec!["c@d.org".to_string()],
            subject: "s".to_string(),
            body: "b".to_string(),
        };
        sender.set_failure(Some(DeliveryError::transport("smtp down")));
        assert!(sender.send_email(&EmailTransportConfig::default(), &msg).is_err());
        sender.set_failure(None);
        sender.send_email(&EmailTransportConfig::default(), &msg).unwrap();
        assert_eq!(sender.sent().len(), 1);
    }

    #[test]
    fn session_lifecycle() {
        let sessions = SessionRegistry::new(1);
        assert!(matches!(
            sessions.push("nope", "x"),
            Err(DeliveryError::SessionNotFound { .. })
        ));

        let inbox = sessions.open("s1");
        assert!(sessions.is_open("s1"));
        sessions.push("s1", "one").unwrap();
        assert!(sessions.push("s1", "two").unwrap_err().is_retryable());
        assert_eq!(inbox.recv().unwrap(), "one");

        assert!(sessions.close("s1"));
        assert!(!sessions.close("s1"));
        assert!(matches!(
            sessions.push("s1", "x"),
            Err(DeliveryError::SessionClosed { .. })
        ));
    }

    #[test]
    fn dropped_receiver_counts_as_closed() {
        let sessions = SessionRegistry::new(4);
        drop(sessions.open("s2"));
        assert!(matches!(
            sessions.push("s2", "x"),
            Err(DeliveryError::SessionClosed { .. })
        ));
    }
}
