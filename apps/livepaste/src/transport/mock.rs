//! Scripted in-memory transport for exercising the session protocol
//! without a server.

use super::{Outcome, Transport, TransportRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A request observed by [`ScriptedTransport`], stamped with the Tokio clock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: TransportRequest,
    pub at: Instant,
}

/// Replies to requests from per-path scripts.
///
/// Each path has a queue of one-shot outcomes and an optional fallback used
/// once the queue is drained. A request with neither stays in flight until
/// the caller gives up on it, which is how tests hold an upload open.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    progress: Notify,
}

#[derive(Default)]
struct ScriptState {
    scripted: HashMap<String, VecDeque<Outcome>>,
    fallback: HashMap<String, Outcome>,
    requests: Vec<RecordedRequest>,
    blocking: Vec<TransportRequest>,
    beacons: Vec<TransportRequest>,
    beacon_supported: bool,
    flushes: Vec<usize>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        transport.state.lock().beacon_supported = true;
        Arc::new(transport)
    }

    /// Queues outcomes that are consumed one per request to `path`.
    pub fn script(&self, path: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state
            .lock()
            .scripted
            .entry(path.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Outcome for every request to `path` once its script is drained.
    pub fn always(&self, path: &str, outcome: Outcome) {
        self.state.lock().fallback.insert(path.to_string(), outcome);
    }

    pub fn set_beacon_supported(&self, supported: bool) {
        self.state.lock().beacon_supported = supported;
    }

    /// Asynchronous requests sent to `path`, in order.
    pub fn requests(&self, path: &str) -> Vec<TransportRequest> {
        self.recorded(path)
            .into_iter()
            .map(|recorded| recorded.request)
            .collect()
    }

    pub fn recorded(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|recorded| recorded.request.path == path)
            .cloned()
            .collect()
    }

    pub fn blocking_requests(&self) -> Vec<TransportRequest> {
        self.state.lock().blocking.clone()
    }

    pub fn beacons(&self) -> Vec<TransportRequest> {
        self.state.lock().beacons.clone()
    }

    /// Beacons queued at each `flush_beacons` call, in call order.
    pub fn flushes(&self) -> Vec<usize> {
        self.state.lock().flushes.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of asynchronous requests ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_for_requests(&self, path: &str, count: usize) {
        loop {
            let notified = self.progress.notified();
            if self.recorded(path).len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn next_outcome(&self, path: &str) -> Option<Outcome> {
        let mut state = self.state.lock();
        if let Some(outcome) = state
            .scripted
            .get_mut(path)
            .and_then(|queue| queue.pop_front())
        {
            return Some(outcome);
        }
        state.fallback.get(path).cloned()
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize, high_water: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        high_water.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: TransportRequest) -> Outcome {
        let _guard = InFlightGuard::enter(&self.in_flight, &self.max_in_flight);
        let path = request.path.clone();
        self.state.lock().requests.push(RecordedRequest {
            request,
            at: Instant::now(),
        });
        self.progress.notify_waiters();

        // Completion is always delivered on a later turn, like a real socket.
        tokio::task::yield_now().await;
        match self.next_outcome(&path) {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    fn execute_blocking(&self, request: TransportRequest) -> Outcome {
        let path = request.path.clone();
        self.state.lock().blocking.push(request);
        self.progress.notify_waiters();
        self.next_outcome(&path)
            .unwrap_or_else(|| Outcome::Success(String::new()))
    }

    fn beacon(&self, request: TransportRequest) -> bool {
        let mut state = self.state.lock();
        if !state.beacon_supported {
            return false;
        }
        state.beacons.push(request);
        drop(state);
        self.progress.notify_waiters();
        true
    }

    // Beacons are recorded synchronously, so none is ever left pending.
    async fn flush_beacons(&self, _grace: Duration) -> usize {
        let mut state = self.state.lock();
        let queued = state.beacons.len();
        state.flushes.push(queued);
        0
    }
}
