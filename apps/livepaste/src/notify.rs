use std::fmt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use url::Url;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    UserCancelled,
    Abandoned,
    NegotiationFailed(String),
    /// Retired on process teardown.
    Exited,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::UserCancelled => f.write_str("cancelled"),
            EndReason::Abandoned => f.write_str("abandoned after too many errors"),
            EndReason::NegotiationFailed(cause) => write!(f, "could not start: {cause}"),
            EndReason::Exited => f.write_str("retired on exit"),
        }
    }
}

/// Receiver of session progress, implemented by whatever renders it.
///
/// Called from the controller and the upload task; implementations must not
/// block.
pub trait NotificationSink: Send + Sync {
    fn status_changed(&self, message: &str);
    fn success_count_changed(&self, count: u64);
    fn link_available(&self, link: &Url);
    fn session_ended(&self, reason: &EndReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(String),
    SuccessCount(u64),
    Link(Url),
    Ended(EndReason),
}

/// Forwards notifications as [`SessionEvent`]s over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        // A closed receiver just means nobody is rendering any more.
        let _ = self.tx.send(event);
    }
}

impl NotificationSink for ChannelSink {
    fn status_changed(&self, message: &str) {
        self.emit(SessionEvent::Status(message.to_string()));
    }

    fn success_count_changed(&self, count: u64) {
        self.emit(SessionEvent::SuccessCount(count));
    }

    fn link_available(&self, link: &Url) {
        self.emit(SessionEvent::Link(link.clone()));
    }

    fn session_ended(&self, reason: &EndReason) {
        self.emit(SessionEvent::Ended(reason.clone()));
    }
}
