use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::{ProbeState, ProbeStatus, ScanSnapshot, ScanState};
use crate::probe::Probe;
use crate::store::DedupStore;

/// Warnings kept per session; older ones are dropped first
const MAX_WARNINGS: usize = 64;

/// State of one discovery run. Lives exactly as long as the scan; the last
/// one is kept read-only for snapshots once it ends.
#[derive(Debug)]
pub struct ScanSession {
    id: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    deadline: Duration,
    /// Fired by an explicit stop
    stop: CancellationToken,
    /// Fired when probes must release their sockets
    probes_cancel: CancellationToken,
    store: DedupStore,
    inner: Mutex<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    state: ScanState,
    probes: Vec<ProbeStatus>,
    /// Per probe: reached listening at some point. Terminal states sort
    /// above `Listening`, so the state alone cannot answer this.
    listened: Vec<bool>,
    warnings: Vec<String>,
    error: Option<String>,
    finished: Option<Instant>,
}

impl ScanSession {
    pub fn new(id: u64, deadline: Duration, probes: &[std::sync::Arc<dyn Probe>]) -> Self {
        let listened = vec![false; probes.len()];
        let probes = probes
            .iter()
            .map(|probe| ProbeStatus {
                name: probe.name().to_string(),
                method: probe.method(),
                state: ProbeState::Idle,
                records: 0,
                error: None,
            })
            .collect();

        Self {
            id,
            started_at: Utc::now(),
            started: Instant::now(),
            deadline,
            stop: CancellationToken::new(),
            probes_cancel: CancellationToken::new(),
            store: DedupStore::new(),
            inner: Mutex::new(SessionInner {
                state: ScanState::Running,
                probes,
                listened,
                warnings: Vec::new(),
                error: None,
                finished: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub async fn stop_requested(&self) {
        self.stop.cancelled().await
    }

    pub(crate) fn probe_token(&self) -> CancellationToken {
        self.probes_cancel.clone()
    }

    /// Time since start, frozen once the session has finished
    pub fn elapsed(&self) -> Duration {
        let end = self.lock().finished.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.started)
    }

    /// Elapsed fraction of the deadline, 0-100
    pub fn progress(&self) -> u8 {
        progress(self.elapsed(), self.deadline)
    }

    fn advance_probe(inner: &mut SessionInner, index: usize, next: ProbeState) -> bool {
        let Some(probe) = inner.probes.get_mut(index) else {
            return false;
        };
        probe.state = probe.state.advance(next);
        if let Some(listened) = inner.listened.get_mut(index) {
            *listened = true;
        }
        true
    }

    pub(crate) fn probe_listening(&self, index: usize) {
        Self::advance_probe(&mut self.lock(), index, ProbeState::Listening);
    }

    pub(crate) fn probe_record(&self, index: usize) {
        let mut inner = self.lock();
        if Self::advance_probe(&mut inner, index, ProbeState::Emitting) {
            inner.probes[index].records += 1;
        }
    }

    pub(crate) fn probe_warning(&self, index: usize, message: String) {
        let mut inner = self.lock();
        let name = inner.probes.get(index).map(|p| p.name.clone()).unwrap_or_default();
        if inner.warnings.len() >= MAX_WARNINGS {
            inner.warnings.remove(0);
        }
        inner.warnings.push(format!("{}: {}", name, message));
    }

    /// Record a probe's exit. Returns true if it had started listening first.
    pub(crate) fn probe_finished(&self, index: usize, error: Option<String>) -> bool {
        let mut inner = self.lock();
        let started = inner.listened.get(index).copied().unwrap_or(false);
        let Some(probe) = inner.probes.get_mut(index) else {
            return false;
        };
        probe.state = probe.state.advance(ProbeState::Stopped);
        if error.is_some() {
            probe.error = error;
        }
        started
    }

    pub fn any_probe_started(&self) -> bool {
        self.lock().listened.iter().any(|listened| *listened)
    }

    /// Signal every probe to stop and mark the listening ones as draining.
    /// A probe still starting up stays `Idle` until it exits.
    pub(crate) fn cancel_probes(&self) {
        self.probes_cancel.cancel();
        let mut inner = self.lock();
        for probe in inner.probes.iter_mut() {
            if !matches!(probe.state, ProbeState::Idle | ProbeState::Stopped) {
                probe.state = probe.state.advance(ProbeState::Draining);
            }
        }
    }

    /// Probes that never acknowledged cancellation
    pub(crate) fn abandon_probes(&self) -> Vec<String> {
        let mut inner = self.lock();
        let mut abandoned = Vec::new();
        for probe in inner.probes.iter_mut() {
            if probe.state != ProbeState::Stopped {
                probe.state = ProbeState::Stopped;
                probe.error.get_or_insert_with(|| "abandoned after grace period".to_string());
                abandoned.push(probe.name.clone());
            }
        }
        abandoned
    }

    pub(crate) fn finish(&self, state: ScanState, error: Option<String>) {
        let mut inner = self.lock();
        inner.state = state;
        inner.error = error;
        inner.finished.get_or_insert_with(Instant::now);
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        let elapsed = self.elapsed();
        let inner = self.lock();
        ScanSnapshot {
            scan_id: self.id,
            state: inner.state,
            started_at: self.started_at,
            elapsed_ms: millis(elapsed),
            deadline_ms: millis(self.deadline),
            progress: progress(elapsed, self.deadline),
            services: self.store.len(),
            probes: inner.probes.clone(),
            warnings: inner.warnings.clone(),
            error: inner.error.clone(),
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn progress(elapsed: Duration, deadline: Duration) -> u8 {
    let deadline = deadline.as_millis().max(1);
    (elapsed.as_millis() * 100 / deadline).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use async_trait::async_trait;
    use shared::types::DiscoveryMethod;
    use crate::error::ProbeError;
    use crate::probe::ProbeContext;

    struct Idle(&'static str);

    #[async_trait]
    impl Probe for Idle {
        fn name(&self) -> &'static str {
            self.0
        }

        fn method(&self) -> DiscoveryMethod {
            DiscoveryMethod::Mdns
        }

        async fn run(&self, _ctx: ProbeContext) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn session() -> ScanSession {
        let probes: Vec<Arc<dyn Probe>> = vec![Arc::new(Idle("a")), Arc::new(Idle("b"))];
        ScanSession::new(7, Duration::from_secs(60), &probes)
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(progress(Duration::ZERO, Duration::from_secs(60)), 0);
        assert_eq!(progress(Duration::from_secs(30), Duration::from_secs(60)), 50);
        assert_eq!(progress(Duration::from_secs(90), Duration::from_secs(60)), 100);
        assert_eq!(progress(Duration::from_secs(1), Duration::ZERO), 100);
    }

    #[test]
    fn test_probe_lifecycle() {
        let session = session();
        assert!(!session.any_probe_started());

        session.probe_listening(0);
        session.probe_record(0);
        session.probe_record(0);
        assert!(session.any_probe_started());

        // "b" fails before listening
        assert!(!session.probe_finished(1, Some("bind refused".to_string())));

        session.cancel_probes();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.probes[0].state, ProbeState::Draining);
        assert_eq!(snapshot.probes[0].records, 2);
        assert_eq!(snapshot.probes[1].state, ProbeState::Stopped);
        assert_eq!(snapshot.probes[1].error.as_deref(), Some("bind refused"));

        assert!(session.probe_finished(0, None));
        assert!(session.abandon_probes().is_empty());
    }

    #[test]
    fn test_failed_probes_never_count_as_started() {
        let session = session();
        session.cancel_probes();
        assert_eq!(session.snapshot().probes[0].state, ProbeState::Idle);

        assert!(!session.probe_finished(0, Some("bind refused".to_string())));
        assert!(!session.probe_finished(1, Some("bind refused".to_string())));
        assert!(!session.any_probe_started());

        let snapshot = session.snapshot();
        assert!(snapshot.probes.iter().all(|p| p.state == ProbeState::Stopped));
    }

    #[test]
    fn test_record_without_listening_counts_as_started() {
        let session = session();
        session.probe_record(1);
        assert!(session.any_probe_started());
        assert!(session.probe_finished(1, None));
        assert_eq!(session.snapshot().probes[1].records, 1);
    }

    #[test]
    fn test_abandon_marks_stragglers() {
        let session = session();
        session.probe_listening(0);
        session.probe_finished(1, None);
        session.cancel_probes();

        assert_eq!(session.abandon_probes(), vec!["a".to_string()]);
        assert_eq!(session.snapshot().probes[0].state, ProbeState::Stopped);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let session = session();
        session.probe_warning(0, "socket hiccup".to_string());
        session.finish(ScanState::Cancelled, None);

        let first = session.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(session.elapsed(), first);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, ScanState::Cancelled);
        assert_eq!(snapshot.warnings, vec!["a: socket hiccup".to_string()]);
    }
}
