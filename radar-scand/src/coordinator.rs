//! Scan lifecycle: one scan at a time, probes fanned in over a channel,
//! a hard deadline, and a bounded teardown.
//!
//! ```text
//! Idle -> Starting -> Running -> {Completing, Cancelling, Failing} -> Idle
//! ```
//!
//! The coordinator is an explicitly constructed handle; clone it to share it
//! with whatever issues commands.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use shared::types::{
    CompletionReason, DiscoveredService, HostSummary, ScanComplete, ScanEvent, ScanFailure,
    ScanProgress, ScanSnapshot, ScanStarted, ScanState, ServiceNotice,
};
use crate::config::ScanConfig;
use crate::error::{ProbeError, ScanError};
use crate::hosts;
use crate::normalize::normalize;
use crate::probe::{Probe, ProbeContext, ProbeMessage, ProbeSignal};
use crate::session::{millis, ScanSession};
use crate::store::{compute_hash, Decision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Completing,
    Cancelling,
    Failing,
}

#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: ScanConfig,
    probes: Vec<Arc<dyn Probe>>,
    events: broadcast::Sender<ScanEvent>,
    state: Mutex<CoordinatorState>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    /// Fired after shutdown has let the last scan settle
    closed: CancellationToken,
}

struct CoordinatorState {
    phase: Phase,
    current: Option<Arc<ScanSession>>,
    /// Most recent finished session, kept for snapshots
    last: Option<Arc<ScanSession>>,
    driver: Option<JoinHandle<()>>,
}

enum Outcome {
    Complete(CompletionReason),
    Failed(String),
}

type ProbeExit = (usize, Result<(), ProbeError>);

impl ScanCoordinator {
    pub fn new(config: ScanConfig, probes: Vec<Arc<dyn Probe>>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                config,
                probes,
                events,
                state: Mutex::new(CoordinatorState {
                    phase: Phase::Idle,
                    current: None,
                    last: None,
                    driver: None,
                }),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn probe_names(&self) -> Vec<&'static str> {
        self.inner.probes.iter().map(|p| p.name()).collect()
    }

    /// Start a scan in the background and return its id immediately.
    /// Results arrive on the event stream.
    pub fn start(&self) -> Result<u64, ScanError> {
        // Checked under the lock so shutdown cannot miss a driver spawned here
        let mut state = self.inner.lock();
        if self.inner.shutdown.is_cancelled() {
            return Err(ScanError::ShuttingDown);
        }
        if state.phase != Phase::Idle {
            let scan_id = state.current.as_ref().map(|s| s.id()).unwrap_or_default();
            return Err(ScanError::AlreadyRunning { scan_id });
        }

        let scan_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(ScanSession::new(
            scan_id,
            self.inner.config.deadline(),
            &self.inner.probes,
        ));

        tracing::info!(scan_id, deadline_secs = self.inner.config.deadline_secs, "Starting scan");
        state.phase = Phase::Starting;
        state.current = Some(session.clone());
        state.driver = Some(tokio::spawn(run_scan(self.inner.clone(), session)));

        Ok(scan_id)
    }

    /// Request cancellation of the running scan. A no-op when nothing runs.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        match state.phase {
            Phase::Starting | Phase::Running => {
                if let Some(session) = &state.current {
                    tracing::info!(scan_id = session.id(), "Stop requested");
                    session.request_stop();
                }
                state.phase = Phase::Cancelling;
            }
            phase => tracing::debug!(?phase, "Stop requested with no running scan"),
        }
    }

    /// The running scan, or the last one if none is running
    pub fn snapshot(&self) -> Option<ScanSnapshot> {
        self.inner.latest_session().map(|s| s.snapshot())
    }

    pub fn services(&self) -> Vec<DiscoveredService> {
        self.inner
            .latest_session()
            .map(|s| s.store().snapshot())
            .unwrap_or_default()
    }

    pub fn services_digest(&self) -> String {
        compute_hash(&self.services())
    }

    pub fn hosts(&self) -> Vec<HostSummary> {
        hosts::consolidate(&self.services())
    }

    /// Resolves once `shutdown` has finished and the last terminal event is out
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Cancel any running scan, wait for it to settle, and refuse new ones.
    pub async fn shutdown(&self) {
        let driver = {
            let mut state = self.inner.lock();
            self.inner.shutdown.cancel();
            state.driver.take()
        };
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::error!("Scan task failed during shutdown: {}", e);
            }
        }

        self.inner.closed.cancel();
        tracing::info!("Scan coordinator shut down");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn latest_session(&self) -> Option<Arc<ScanSession>> {
        let state = self.lock();
        state.current.clone().or_else(|| state.last.clone())
    }

    /// Move from `from` to `to`; leaves the phase alone if something else
    /// (an explicit stop) got there first.
    fn transition(&self, from: Phase, to: Phase) {
        let mut state = self.lock();
        if state.phase == from {
            state.phase = to;
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    fn finish_session(&self, session: &Arc<ScanSession>) {
        let mut state = self.lock();
        state.phase = Phase::Idle;
        if state.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
            state.last = state.current.take();
        }
        state.driver = None;
    }

    fn emit(&self, event: ScanEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    fn probe_name(&self, index: usize) -> &'static str {
        self.probes.get(index).map(|p| p.name()).unwrap_or("unknown")
    }
}

async fn run_scan(inner: Arc<Inner>, session: Arc<ScanSession>) {
    let scan_id = session.id();
    let (tx, mut rx) = mpsc::channel(inner.config.event_capacity.max(1));
    let cancel = session.probe_token();

    let mut probes: JoinSet<ProbeExit> = JoinSet::new();
    for (index, probe) in inner.probes.iter().enumerate() {
        let ctx = ProbeContext::new(index, probe.name(), tx.clone(), cancel.clone());
        let probe = probe.clone();
        probes.spawn(async move {
            let result = AssertUnwindSafe(probe.run(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ProbeError::Other("probe panicked".to_string())));
            (index, result)
        });
    }
    // Only probes hold senders now; the channel closes when the last one exits
    drop(tx);

    inner.transition(Phase::Starting, Phase::Running);
    inner.emit(ScanEvent::ScanStarted(ScanStarted {
        scan_id,
        deadline_ms: millis(session.deadline()),
    }));
    tracing::info!(scan_id, probes = inner.probes.len(), "Scan running");

    let outcome = if inner.probes.is_empty() {
        Outcome::Failed("no discovery probes are enabled".to_string())
    } else {
        drive(&inner, &session, &mut rx, &mut probes).await
    };

    teardown(&inner, &session, rx, probes, outcome).await;
}

async fn drive(
    inner: &Inner,
    session: &ScanSession,
    rx: &mut mpsc::Receiver<ProbeMessage>,
    probes: &mut JoinSet<ProbeExit>,
) -> Outcome {
    let deadline = tokio::time::sleep(session.deadline());
    tokio::pin!(deadline);

    let period = inner.config.progress_interval();
    let mut progress = tokio::time::interval_at(Instant::now() + period, period);
    progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = session.stop_requested() => return Outcome::Complete(CompletionReason::Stopped),

            _ = inner.shutdown.cancelled() => return Outcome::Complete(CompletionReason::Shutdown),

            _ = &mut deadline => return Outcome::Complete(CompletionReason::Deadline),

            Some(message) = rx.recv() => handle_message(inner, session, message),

            Some(joined) = probes.join_next() => {
                // A probe's last messages may still be queued behind its exit
                while let Ok(message) = rx.try_recv() {
                    handle_message(inner, session, message);
                }
                handle_exit(inner, session, joined);

                if probes.is_empty() {
                    if session.any_probe_started() {
                        return Outcome::Complete(CompletionReason::ProbesFinished);
                    }
                    return Outcome::Failed(start_failure_message(session));
                }
            }

            _ = progress.tick() => {
                let elapsed = session.elapsed();
                inner.emit(ScanEvent::ScanProgress(ScanProgress {
                    progress: session.progress(),
                    elapsed_ms: millis(elapsed),
                    deadline_ms: millis(session.deadline()),
                }));
            }
        }
    }
}

async fn teardown(
    inner: &Inner,
    session: &Arc<ScanSession>,
    mut rx: mpsc::Receiver<ProbeMessage>,
    mut probes: JoinSet<ProbeExit>,
    outcome: Outcome,
) {
    let scan_id = session.id();
    inner.set_phase(match &outcome {
        Outcome::Complete(CompletionReason::Stopped | CompletionReason::Shutdown) => Phase::Cancelling,
        Outcome::Complete(_) => Phase::Completing,
        Outcome::Failed(_) => Phase::Failing,
    });

    session.cancel_probes();
    // Records still in flight after cancellation are dropped
    rx.close();

    let grace = inner.config.grace_period();
    let settled = tokio::time::timeout(grace, async {
        while let Some(joined) = probes.join_next().await {
            handle_exit(inner, session, joined);
        }
    })
    .await;

    if settled.is_err() {
        let abandoned = session.abandon_probes();
        tracing::warn!(
            scan_id,
            "Force-abandoning probes that ignored cancellation for {:?}: {}",
            grace,
            abandoned.join(", ")
        );
        probes.abort_all();
    }
    drop(rx);

    let services = session.store().len();
    let event = match outcome {
        Outcome::Complete(reason) => {
            let state = match reason {
                CompletionReason::Deadline | CompletionReason::ProbesFinished => ScanState::Completed,
                CompletionReason::Stopped | CompletionReason::Shutdown => ScanState::Cancelled,
            };
            session.finish(state, None);
            tracing::info!(scan_id, ?reason, services, "Scan complete");
            ScanEvent::ScanComplete(ScanComplete { scan_id, reason, services })
        }
        Outcome::Failed(error) => {
            tracing::error!(scan_id, "Scan failed: {}", error);
            session.finish(ScanState::Errored, Some(error.clone()));
            ScanEvent::ScanError(ScanFailure { scan_id, error })
        }
    };

    inner.finish_session(session);
    inner.emit(event);
}

fn handle_message(inner: &Inner, session: &ScanSession, message: ProbeMessage) {
    let ProbeMessage { probe, signal } = message;
    let name = inner.probe_name(probe);

    match signal {
        ProbeSignal::Listening => {
            tracing::info!(probe = name, "Probe listening");
            session.probe_listening(probe);
        }
        ProbeSignal::Warning(message) => session.probe_warning(probe, message),
        ProbeSignal::Record(record) => {
            session.probe_record(probe);

            let service = match normalize(record) {
                Ok(service) => service,
                Err(e) => {
                    tracing::debug!(probe = name, "Dropping record: {}", e);
                    return;
                }
            };

            let key = service.key();
            let notice = ServiceNotice {
                service: service.clone(),
                progress: session.progress(),
            };
            match session.store().offer(service) {
                Decision::New => {
                    tracing::debug!(probe = name, "Discovered {}", key);
                    inner.emit(ScanEvent::ServiceDiscovered(notice));
                }
                Decision::Changed => {
                    tracing::debug!(probe = name, "Updated {}", key);
                    inner.emit(ScanEvent::ServiceUpdated(notice));
                }
                Decision::Unchanged => {}
            }
        }
    }
}

fn handle_exit(inner: &Inner, session: &ScanSession, joined: Result<ProbeExit, JoinError>) {
    match joined {
        Ok((index, Ok(()))) => {
            session.probe_finished(index, None);
            tracing::debug!(probe = inner.probe_name(index), "Probe stopped");
        }
        Ok((index, Err(e))) => {
            let name = inner.probe_name(index);
            if session.probe_finished(index, Some(e.to_string())) {
                tracing::warn!(probe = name, "Probe failed, scan continues: {}", e);
            } else {
                tracing::warn!(probe = name, "Probe could not start: {}", e);
            }
        }
        Err(e) => tracing::error!("Probe task failed: {}", e),
    }
}

fn start_failure_message(session: &ScanSession) -> String {
    let causes: Vec<String> = session
        .snapshot()
        .probes
        .into_iter()
        .map(|p| match p.error {
            Some(error) => format!("{}: {}", p.name, error),
            None => format!("{}: exited without listening", p.name),
        })
        .collect();

    format!("no discovery protocol could be started ({})", causes.join("; "))
}
