use super::upload::{
    self, ErrorCounter, LoopExit, LoopStats, RetryPolicy, UploadLoop, UploadTarget,
};
use super::{Negotiator, RetireDelivery, SessionCredentials, SessionError};
use crate::buffer::Buffer;
use crate::config::ClientConfig;
use crate::notify::{EndReason, NotificationSink};
use crate::transport::{CancelHandle, CancelSignal, Outcome, Transport, cancel_pair};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unrequested,
    Requesting,
    Active,
    Cancelling,
    Retired,
    Failed,
}

impl SessionStatus {
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            SessionStatus::Requesting | SessionStatus::Active | SessionStatus::Cancelling
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub link: Url,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub id: Option<String>,
    pub link: Option<Url>,
    pub successes: u64,
    pub consecutive_errors: u32,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a session is already in progress")]
    AlreadyActive,
    #[error("no active session")]
    NotActive,
    #[error("paste is {length} bytes, the limit is {limit}")]
    BufferTooLarge { length: usize, limit: usize },
    #[error(transparent)]
    Negotiation(#[from] SessionError),
}

/// Owns the lifecycle of one live paste at a time.
///
/// `start` negotiates a session and spawns its upload loop; `cancel` and
/// `retire_on_exit` end it. Dropping the last handle while a session is
/// active retires it the same way process teardown does.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    negotiator: Negotiator,
    sink: Arc<dyn NotificationSink>,
    slot: Mutex<Slot>,
}

struct Slot {
    status: SessionStatus,
    generation: u64,
    active: Option<ActiveSession>,
}

// Fields drop in order: the loop is cancelled before the exit retirement fires.
struct ActiveSession {
    generation: u64,
    info: SessionInfo,
    stats: Arc<LoopStats>,
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
    exit: ExitRetirement,
}

/// Retires the session when dropped unless disarmed first.
struct ExitRetirement {
    negotiator: Negotiator,
    credentials: Option<SessionCredentials>,
}

impl ExitRetirement {
    fn arm(negotiator: Negotiator, credentials: SessionCredentials) -> Self {
        Self {
            negotiator,
            credentials: Some(credentials),
        }
    }

    fn disarm(&mut self) -> Option<SessionCredentials> {
        self.credentials.take()
    }
}

impl Drop for ExitRetirement {
    fn drop(&mut self) {
        let Some(credentials) = self.credentials.take() else {
            return;
        };
        match self.negotiator.retire_on_teardown(&credentials) {
            RetireDelivery::Beacon => {}
            RetireDelivery::Blocking(outcome) => debug!(
                target: "livepaste::session",
                session_id = %credentials.id(),
                outcome = outcome.label(),
                "exit retirement finished"
            ),
        }
    }
}

/// Resets a `Requesting` slot if `start` is abandoned mid-negotiation.
struct PendingStart<'a> {
    inner: &'a Inner,
    generation: u64,
    armed: bool,
}

impl PendingStart<'_> {
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.inner.slot.lock();
        if slot.status == SessionStatus::Requesting && slot.generation == self.generation {
            slot.status = SessionStatus::Unrequested;
        }
    }
}

impl SessionController {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let negotiator = Negotiator::new(
            transport.clone(),
            config.flavor.endpoints(),
            config.request_timeout,
        );
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                negotiator,
                sink,
                slot: Mutex::new(Slot {
                    status: SessionStatus::Unrequested,
                    generation: 0,
                    active: None,
                }),
            }),
        }
    }

    /// Negotiates a session for `buffer` and starts re-uploading it.
    ///
    /// Returns once the session is active; the upload loop keeps running in
    /// the background until cancelled, abandoned or retired on exit.
    pub async fn start(&self, buffer: Buffer) -> Result<SessionInfo, ControllerError> {
        let inner = &self.inner;
        let length = buffer.byte_len();
        if let Some(limit) = inner.config.max_length {
            if length > limit {
                inner
                    .sink
                    .status_changed(&format!("Paste is too long ({length} bytes, limit {limit})"));
                return Err(ControllerError::BufferTooLarge { length, limit });
            }
        }

        let generation = {
            let mut slot = inner.slot.lock();
            if slot.status.in_progress() {
                return Err(ControllerError::AlreadyActive);
            }
            slot.status = SessionStatus::Requesting;
            slot.generation += 1;
            slot.generation
        };
        let pending = PendingStart {
            inner: inner.as_ref(),
            generation,
            armed: true,
        };

        inner.sink.status_changed("Requesting upload id");
        let credentials = match inner.negotiator.request_session(length).await {
            Ok(credentials) => credentials,
            Err(err) => {
                inner.slot.lock().status = SessionStatus::Failed;
                pending.settle();
                inner.sink.status_changed("Request failed.");
                inner
                    .sink
                    .session_ended(&EndReason::NegotiationFailed(err.to_string()));
                return Err(err.into());
            }
        };

        let link = inner.config.download_link(credentials.id());
        let info = SessionInfo {
            id: credentials.id().to_string(),
            link: link.clone(),
            length,
        };
        inner.sink.link_available(&link);
        inner.sink.status_changed("Got id");
        info!(
            target: "livepaste::session",
            session_id = %info.id,
            %link,
            length,
            "session active"
        );

        let (cancel, signal) = cancel_pair();
        let stats = Arc::new(LoopStats::default());
        let target = UploadTarget {
            credentials: credentials.clone(),
            buffer,
            path: inner.negotiator.endpoints().upload,
            timeout: inner.config.upload_timeout,
        };
        let run = LoopRun {
            owner: Arc::downgrade(inner),
            transport: inner.transport.clone(),
            sink: inner.sink.clone(),
            generation,
            target,
            errors: ErrorCounter::new(inner.config.max_consecutive_errors),
            retry: inner.config.retry,
            stats: stats.clone(),
            signal,
        };

        let mut slot = inner.slot.lock();
        pending.settle();
        let task = tokio::spawn(run.drive());
        slot.status = SessionStatus::Active;
        slot.active = Some(ActiveSession {
            generation,
            info: info.clone(),
            stats,
            cancel,
            task: Some(task),
            exit: ExitRetirement::arm(inner.negotiator.clone(), credentials),
        });
        Ok(info)
    }

    /// Stops the active session and retires it.
    ///
    /// Retirement is advisory: the session ends as `Retired` whether or not
    /// the server acknowledged it.
    pub async fn cancel(&self) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut active = inner
            .take_active(None, SessionStatus::Cancelling)
            .ok_or(ControllerError::NotActive)?;
        inner.sink.status_changed("Cancelling");

        active.cancel.cancel();
        if let Some(task) = active.task.take() {
            if let Err(err) = task.await {
                warn!(target: "livepaste::session", error = %err, "upload task ended abnormally");
            }
        }

        let credentials = active.exit.disarm();
        drop(active);
        if let Some(credentials) = credentials {
            let outcome = inner.negotiator.retire(&credentials).await;
            inner.report_retirement(&outcome);
        }
        inner.finish(SessionStatus::Retired, EndReason::UserCancelled);
        Ok(())
    }

    /// Teardown path: stops the upload loop and retires the session without
    /// waiting on the async runtime. Returns whether a session was active.
    pub fn retire_on_exit(&self) -> bool {
        let inner = &self.inner;
        let Some(mut active) = inner.take_active(None, SessionStatus::Cancelling) else {
            return false;
        };
        active.cancel.cancel();
        info!(
            target: "livepaste::session",
            session_id = %active.info.id,
            "retiring session on exit"
        );
        drop(active);
        inner.finish(SessionStatus::Retired, EndReason::Exited);
        true
    }

    pub fn status(&self) -> StatusSnapshot {
        let slot = self.inner.slot.lock();
        match &slot.active {
            Some(active) => StatusSnapshot {
                status: slot.status,
                id: Some(active.info.id.clone()),
                link: Some(active.info.link.clone()),
                successes: active.stats.successes(),
                consecutive_errors: active.stats.consecutive_errors(),
            },
            None => StatusSnapshot {
                status: slot.status,
                id: None,
                link: None,
                successes: 0,
                consecutive_errors: 0,
            },
        }
    }
}

impl Inner {
    /// Takes the active session out of the slot, moving the status to `next`.
    /// With `generation` set, only that session is taken.
    fn take_active(&self, generation: Option<u64>, next: SessionStatus) -> Option<ActiveSession> {
        let mut slot = self.slot.lock();
        if slot.status != SessionStatus::Active {
            return None;
        }
        let current = slot.active.as_ref()?.generation;
        if generation.is_some_and(|wanted| wanted != current) {
            return None;
        }
        let active = slot.active.take();
        slot.status = next;
        active
    }

    async fn abandon(&self, generation: u64) {
        let Some(mut active) = self.take_active(Some(generation), SessionStatus::Cancelling) else {
            return;
        };
        warn!(
            target: "livepaste::session",
            session_id = %active.info.id,
            "session abandoned"
        );
        let credentials = active.exit.disarm();
        drop(active);
        if let Some(credentials) = credentials {
            let outcome = self.negotiator.retire(&credentials).await;
            self.report_retirement(&outcome);
        }
        self.finish(SessionStatus::Failed, EndReason::Abandoned);
    }

    fn report_retirement(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Success(_) => self.sink.status_changed("Id retired."),
            Outcome::HttpError { status, body } => self
                .sink
                .status_changed(&format!("Cancel failed with HTTP error {status}, {body}")),
            _ => self.sink.status_changed("Cancel failed."),
        }
    }

    fn finish(&self, status: SessionStatus, reason: EndReason) {
        self.slot.lock().status = status;
        self.sink.session_ended(&reason);
    }
}

/// State moved into the spawned upload task.
struct LoopRun {
    owner: Weak<Inner>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn NotificationSink>,
    generation: u64,
    target: UploadTarget,
    errors: ErrorCounter,
    retry: RetryPolicy,
    stats: Arc<LoopStats>,
    signal: CancelSignal,
}

impl LoopRun {
    async fn drive(mut self) {
        let mut fsm = UploadLoop::new(self.retry);
        let exit = upload::run(
            self.transport.as_ref(),
            &self.target,
            &mut fsm,
            &mut self.errors,
            &self.stats,
            self.sink.as_ref(),
            &mut self.signal,
        )
        .await;
        debug!(
            target: "livepaste::upload",
            session_id = %self.target.credentials.id(),
            ?exit,
            rounds = fsm.successes(),
            "upload loop finished"
        );
        if exit == LoopExit::GivenUp {
            if let Some(owner) = self.owner.upgrade() {
                owner.abandon(self.generation).await;
            }
        }
    }
}
