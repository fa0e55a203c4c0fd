//! The re-upload state machine.
//!
//! [`UploadLoop`] holds the transition table and knows nothing about I/O:
//! every attempt result is fed in as one "attempt completed with outcome"
//! event and it answers with the next [`LoopAction`]. [`run`] drives it
//! against a transport, awaiting exactly one attempt at a time.

use super::SessionCredentials;
use crate::buffer::Buffer;
use crate::notify::NotificationSink;
use crate::transport::{
    CancelSignal, Outcome, TEXT_PLAIN_UTF8, Transport, TransportRequest, send_cancellable,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Consecutive transport failures, reset by any success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounter {
    consecutive: u32,
    threshold: u32,
}

impl ErrorCounter {
    pub const DEFAULT_THRESHOLD: u32 = 20;

    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Counts one failure; true once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for ErrorCounter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

/// Delay inserted between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Resend straight away.
    #[default]
    Immediate,
    /// `base * 2^(n-1)` after the n-th consecutive failure, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    pub fn delay_after(&self, consecutive_failures: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Immediate => None,
            RetryPolicy::Exponential { base, max } => {
                let exponent = consecutive_failures.saturating_sub(1);
                let factor = 2u32.saturating_pow(exponent);
                let delay = base.checked_mul(factor).unwrap_or(max).min(max);
                (!delay.is_zero()).then_some(delay)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Sending,
    BackoffRetry,
    GivenUp,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Send,
    Wait(Duration),
    GiveUp,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    GivenUp,
}

#[derive(Debug)]
pub struct UploadLoop {
    state: LoopState,
    successes: u64,
    retry: RetryPolicy,
}

impl UploadLoop {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            state: LoopState::Idle,
            successes: 0,
            retry,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn begin(&mut self, sink: &dyn NotificationSink) -> LoopAction {
        if self.state != LoopState::Idle {
            return self.terminal_action();
        }
        sink.status_changed("Starting upload");
        self.state = LoopState::Sending;
        LoopAction::Send
    }

    pub fn on_outcome(
        &mut self,
        outcome: &Outcome,
        errors: &mut ErrorCounter,
        sink: &dyn NotificationSink,
    ) -> LoopAction {
        if self.state != LoopState::Sending {
            return self.terminal_action();
        }
        match outcome {
            Outcome::Success(body) => {
                sink.status_changed(&format!("Upload ok: \"{body}\""));
                errors.reset();
                self.successes += 1;
                sink.success_count_changed(self.successes);
                LoopAction::Send
            }
            Outcome::HttpError { status, body } => {
                sink.status_changed(&format!("Upload failed with HTTP error {status}, {body}"));
                sink.status_changed(&format!("Upload failed: \"{body}\""));
                self.after_failure(errors, sink)
            }
            Outcome::Timeout => {
                sink.status_changed("Upload timeout.");
                self.after_failure(errors, sink)
            }
            Outcome::NetworkError(cause) => {
                debug!(target: "livepaste::upload", %cause, "upload attempt failed");
                sink.status_changed("Upload failed.");
                self.after_failure(errors, sink)
            }
            Outcome::Aborted => {
                self.state = LoopState::Stopped;
                LoopAction::Stop
            }
        }
    }

    pub fn backoff_elapsed(&mut self) -> LoopAction {
        if self.state != LoopState::BackoffRetry {
            return self.terminal_action();
        }
        self.state = LoopState::Sending;
        LoopAction::Send
    }

    pub fn stop(&mut self) {
        if self.state != LoopState::GivenUp {
            self.state = LoopState::Stopped;
        }
    }

    fn after_failure(
        &mut self,
        errors: &mut ErrorCounter,
        sink: &dyn NotificationSink,
    ) -> LoopAction {
        if errors.record_failure() {
            warn!(
                target: "livepaste::upload",
                consecutive = errors.consecutive(),
                "error threshold reached"
            );
            sink.status_changed("Too many errors, giving up");
            self.state = LoopState::GivenUp;
            return LoopAction::GiveUp;
        }
        match self.retry.delay_after(errors.consecutive()) {
            Some(delay) => {
                self.state = LoopState::BackoffRetry;
                LoopAction::Wait(delay)
            }
            None => LoopAction::Send,
        }
    }

    fn terminal_action(&self) -> LoopAction {
        match self.state {
            LoopState::GivenUp => LoopAction::GiveUp,
            _ => LoopAction::Stop,
        }
    }
}

/// Live counters published by a running loop for status queries.
#[derive(Debug, Default)]
pub struct LoopStats {
    successes: AtomicU64,
    consecutive_errors: AtomicU32,
}

impl LoopStats {
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    fn publish(&self, fsm: &UploadLoop, errors: &ErrorCounter) {
        self.successes.store(fsm.successes(), Ordering::Relaxed);
        self.consecutive_errors
            .store(errors.consecutive(), Ordering::Relaxed);
    }
}

/// Everything an upload attempt needs, fixed for the life of a session.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub credentials: SessionCredentials,
    pub buffer: Buffer,
    pub path: &'static str,
    pub timeout: Option<Duration>,
}

impl UploadTarget {
    pub fn request(&self) -> TransportRequest {
        self.credentials
            .authorize(TransportRequest::post(self.path))
            .body(self.buffer.body(), TEXT_PLAIN_UTF8)
            .timeout(self.timeout)
    }
}

/// Drives `fsm` until the session is cancelled or abandoned.
pub async fn run(
    transport: &dyn Transport,
    target: &UploadTarget,
    fsm: &mut UploadLoop,
    errors: &mut ErrorCounter,
    stats: &LoopStats,
    sink: &dyn NotificationSink,
    cancel: &mut CancelSignal,
) -> LoopExit {
    let mut action = fsm.begin(sink);
    loop {
        action = match action {
            LoopAction::Send => {
                trace!(
                    target: "livepaste::upload",
                    session_id = %target.credentials.id(),
                    round = fsm.successes() + 1,
                    "upload attempt"
                );
                let outcome = send_cancellable(transport, target.request(), cancel).await;
                let next = fsm.on_outcome(&outcome, errors, sink);
                stats.publish(fsm, errors);
                next
            }
            LoopAction::Wait(delay) => {
                debug!(
                    target: "livepaste::upload",
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        fsm.stop();
                        LoopAction::Stop
                    }
                    _ = tokio::time::sleep(delay) => fsm.backoff_elapsed(),
                }
            }
            LoopAction::GiveUp => return LoopExit::GivenUp,
            LoopAction::Stop => return LoopExit::Cancelled,
        };
    }
}
