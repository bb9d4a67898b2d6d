//! Exactly-once job guard.
//!
//! For every job key the guard keeps two markers under `<root>/<key>`:
//! an ephemeral `processing` node, held by at most one worker at a time, and
//! a persistent `complete` node, created once when the job finished. Mutual
//! exclusion rests entirely on the service's atomic create; a worker that
//! dies while holding `processing` loses it together with its session, which
//! makes the job eligible again without any lease renewal.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use benchq_core::JobKey;

use crate::client::{Coordination, CreateOutcome, DeleteOutcome};
use crate::{GuardErrorKind, GuardResult, path};

/// Name of the ephemeral lock marker
pub const PROCESSING_MARKER: &str = "processing";

/// Name of the persistent completion marker
pub const COMPLETE_MARKER: &str = "complete";

/// Result of [`JobGuard::start`]
#[derive(Debug)]
pub enum StartOutcome {
    /// This worker holds the lock and must call `end` or `abort`
    Granted(JobLease),
    /// The job finished earlier; nothing to do
    AlreadyComplete,
    /// Another worker holds the lock
    LockHeldByOther,
}

impl StartOutcome {
    /// Returns true if the lock was granted
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Proof that this guard holds the `processing` marker of a job.
///
/// Only [`JobGuard::start`] creates leases, and they cannot be cloned.
#[derive(Debug, PartialEq, Eq)]
pub struct JobLease {
    key: JobKey,
    guard: Uuid,
}

impl JobLease {
    /// The job this lease is for
    #[must_use]
    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

/// Observed state of one job node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// `complete` exists
    Completed,
    /// `processing` exists and `complete` does not
    InFlight,
    /// Neither marker exists
    Idle,
}

/// One entry of [`JobGuard::inventory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEntry {
    /// Node name, i.e. the job key
    pub key: String,
    /// Observed status
    pub status: JobStatus,
}

/// Job guard over a coordination session
pub struct JobGuard {
    coord: Arc<dyn Coordination>,
    root: String,
    id: Uuid,
    held: Mutex<HashSet<JobKey>>,
    // Locks this session created but never handed out as a lease.
    orphans: Mutex<HashSet<JobKey>>,
}

impl std::fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobGuard")
            .field("root", &self.root)
            .field("id", &self.id)
            .field("held", &self.held.lock().len())
            .field("orphans", &self.orphans.lock().len())
            .finish_non_exhaustive()
    }
}

impl JobGuard {
    /// Creates a guard rooted at `root`, ensuring the root exists
    ///
    /// # Errors
    ///
    /// Returns an error if the root path is invalid or cannot be created.
    pub async fn connect(coord: Arc<dyn Coordination>, root: impl Into<String>) -> GuardResult<Self> {
        let root = root.into();
        path::validate(&root)?;
        coord.ensure_path(&root).await?;
        let guard = Self {
            coord,
            root,
            id: Uuid::new_v4(),
            held: Mutex::new(HashSet::new()),
            orphans: Mutex::new(HashSet::new()),
        };
        debug!(root = %guard.root, guard = %guard.id, "job guard ready");
        Ok(guard)
    }

    /// Namespace root of the job nodes
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Path of the node for `key`
    #[must_use]
    pub fn node_path(&self, key: &JobKey) -> String {
        path::join(&self.root, key.as_str())
    }

    fn marker(&self, key: &JobKey, marker: &str) -> String {
        path::join(&self.node_path(key), marker)
    }

    /// Returns true iff the job's `complete` marker exists
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination service cannot answer.
    pub async fn processed(&self, key: &JobKey) -> GuardResult<bool> {
        Ok(self.coord.exists(&self.marker(key, COMPLETE_MARKER)).await?)
    }

    /// Tries to take the lock for `key`
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination service cannot answer; no lease
    /// is issued in that case. A lock created before the failure is deleted
    /// right away, or by the next `start` of this guard if that fails too.
    pub async fn start(&self, key: &JobKey) -> GuardResult<StartOutcome> {
        self.release_orphans().await?;
        self.coord.ensure_path(&self.node_path(key)).await?;

        if self.processed(key).await? {
            return Ok(StartOutcome::AlreadyComplete);
        }
        let processing = self.marker(key, PROCESSING_MARKER);
        if self.coord.exists(&processing).await? {
            return Ok(StartOutcome::LockHeldByOther);
        }

        match self.coord.create_ephemeral(&processing).await? {
            CreateOutcome::AlreadyExists => {
                debug!(key = %key, "lost lock race");
                Ok(StartOutcome::LockHeldByOther)
            }
            CreateOutcome::Created => {
                // A finisher creates `complete` before dropping `processing`, so
                // a lock won after our first check may guard a finished job.
                let finished = match self.processed(key).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        self.orphan(key, &processing).await;
                        return Err(e);
                    }
                };
                if finished {
                    self.orphan(key, &processing).await;
                    debug!(key = %key, "job completed while acquiring lock");
                    return Ok(StartOutcome::AlreadyComplete);
                }
                self.held.lock().insert(key.clone());
                info!(key = %key, "job lock acquired");
                Ok(StartOutcome::Granted(JobLease {
                    key: key.clone(),
                    guard: self.id,
                }))
            }
        }
    }

    // Best-effort delete of a lock that no lease will ever cover.
    async fn orphan(&self, key: &JobKey, processing: &str) {
        if let Err(e) = self.coord.delete(processing).await {
            warn!(key = %key, error = %e, "unleased lock left behind; retrying on next start");
            self.orphans.lock().insert(key.clone());
        }
    }

    async fn release_orphans(&self) -> GuardResult {
        let pending: Vec<JobKey> = self.orphans.lock().iter().cloned().collect();
        for key in pending {
            self.coord.delete(&self.marker(&key, PROCESSING_MARKER)).await?;
            self.orphans.lock().remove(&key);
            debug!(key = %key, "unleased lock released");
        }
        Ok(())
    }

    /// Number of locks created without a lease and not yet released
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    fn check_held(&self, lease: &JobLease) -> GuardResult {
        if lease.guard != self.id || !self.held.lock().contains(&lease.key) {
            return Err(GuardErrorKind::LeaseNotHeld {
                key: lease.key.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Records completion of a leased job and releases its lock
    ///
    /// `complete` is created before `processing` is deleted. If the delete
    /// fails, the job stays correctly marked and the lock goes away with the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotHeld` for a lease this guard does not hold, or a
    /// coordination error if `complete` could not be recorded; the lease is
    /// still held in that case.
    pub async fn end(&self, lease: &JobLease) -> GuardResult {
        self.check_held(lease)?;
        let key = &lease.key;

        if self.coord.create_persistent(&self.marker(key, COMPLETE_MARKER)).await?
            == CreateOutcome::AlreadyExists
        {
            warn!(key = %key, "completion marker already present");
        }
        self.held.lock().remove(key);

        match self.coord.delete(&self.marker(key, PROCESSING_MARKER)).await {
            Ok(DeleteOutcome::Deleted) => {}
            Ok(DeleteOutcome::NotFound) => warn!(key = %key, "lock marker vanished before release"),
            Err(e) => warn!(key = %key, error = %e, "lock release deferred to session end"),
        }
        info!(key = %key, "job marked complete");
        Ok(())
    }

    /// Releases the lock of a leased job without marking it complete
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotHeld` for a lease this guard does not hold, or a
    /// coordination error if the marker could not be deleted; the lease is
    /// still held in that case.
    pub async fn abort(&self, lease: &JobLease) -> GuardResult {
        self.check_held(lease)?;
        let key = &lease.key;

        if self.coord.delete(&self.marker(key, PROCESSING_MARKER)).await? == DeleteOutcome::NotFound {
            warn!(key = %key, "lock marker already gone on abort");
        }
        self.held.lock().remove(key);
        info!(key = %key, "job lock released without completion");
        Ok(())
    }

    /// Lists every job node under the root with its status
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination service cannot answer.
    pub async fn inventory(&self) -> GuardResult<Vec<JobEntry>> {
        let mut entries = Vec::new();
        for name in self.coord.children(&self.root).await? {
            let markers = self.coord.children(&path::join(&self.root, &name)).await?;
            let has = |marker: &str| markers.iter().any(|m| m == marker);
            let status = if has(COMPLETE_MARKER) {
                JobStatus::Completed
            } else if has(PROCESSING_MARKER) {
                JobStatus::InFlight
            } else {
                JobStatus::Idle
            };
            entries.push(JobEntry { key: name, status });
        }
        Ok(entries)
    }

    /// Number of leases currently held
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Ends the coordination session
    ///
    /// Any lock still held is released by the service; outstanding leases
    /// become invalid.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to close the session.
    pub async fn close(&self) -> GuardResult {
        let abandoned: Vec<JobKey> = self.held.lock().drain().collect();
        for key in &abandoned {
            warn!(key = %key, "closing guard while holding lock");
        }
        self.orphans.lock().clear();
        self.coord.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoordError, CoordResult, GuardErrorKind, MemoryEnsemble, MemorySession};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const ROOT: &str = "/benchq/jobs";

    fn key(name: &str) -> JobKey {
        JobKey::from_dataset(name).unwrap()
    }

    async fn guard(ensemble: &MemoryEnsemble) -> JobGuard {
        JobGuard::connect(Arc::new(ensemble.connect()), ROOT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_end_marks_complete() {
        let ensemble = MemoryEnsemble::new();
        let g = guard(&ensemble).await;
        let k = key("jobA");

        assert!(!g.processed(&k).await.unwrap());
        let StartOutcome::Granted(lease) = g.start(&k).await.unwrap() else {
            panic!("expected lock");
        };
        assert!(ensemble.contains("/benchq/jobs/jobA/processing"));

        g.end(&lease).await.unwrap();
        assert!(g.processed(&k).await.unwrap());
        assert!(ensemble.contains("/benchq/jobs/jobA/complete"));
        assert!(!ensemble.contains("/benchq/jobs/jobA/processing"));
        assert_eq!(g.held_count(), 0);
    }

    #[tokio::test]
    async fn test_start_refused_while_held() {
        let ensemble = MemoryEnsemble::new();
        let a = guard(&ensemble).await;
        let b = guard(&ensemble).await;
        let k = key("jobA");

        assert!(a.start(&k).await.unwrap().is_granted());
        assert!(matches!(
            b.start(&k).await.unwrap(),
            StartOutcome::LockHeldByOther
        ));
        // the holder itself cannot re-enter either
        assert!(matches!(
            a.start(&k).await.unwrap(),
            StartOutcome::LockHeldByOther
        ));
    }

    #[tokio::test]
    async fn test_complete_without_processing() {
        let ensemble = MemoryEnsemble::new();
        let g = guard(&ensemble).await;
        let k = key("jobC");

        let setup = ensemble.connect();
        setup.ensure_path("/benchq/jobs/jobC/complete").await.unwrap();

        assert!(g.processed(&k).await.unwrap());
        assert!(matches!(
            g.start(&k).await.unwrap(),
            StartOutcome::AlreadyComplete
        ));
    }

    #[tokio::test]
    async fn test_abort_allows_retry() {
        let ensemble = MemoryEnsemble::new();
        let a = guard(&ensemble).await;
        let b = guard(&ensemble).await;
        let k = key("jobD");

        let StartOutcome::Granted(lease) = a.start(&k).await.unwrap() else {
            panic!("expected lock");
        };
        a.abort(&lease).await.unwrap();
        assert!(!a.processed(&k).await.unwrap());
        assert!(!ensemble.contains("/benchq/jobs/jobD/complete"));

        assert!(b.start(&k).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_session_expiry_frees_lock() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        let crashed_id = session.id();
        let crashed = JobGuard::connect(Arc::new(session), ROOT).await.unwrap();
        let survivor = guard(&ensemble).await;
        let k = key("jobB");

        assert!(crashed.start(&k).await.unwrap().is_granted());
        assert!(!survivor.start(&k).await.unwrap().is_granted());

        ensemble.expire(crashed_id);
        assert!(survivor.start(&k).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_close_releases_lock() {
        let ensemble = MemoryEnsemble::new();
        let a = guard(&ensemble).await;
        let b = guard(&ensemble).await;
        let k = key("jobE");

        let StartOutcome::Granted(lease) = a.start(&k).await.unwrap() else {
            panic!("expected lock");
        };
        a.close().await.unwrap();

        assert!(b.start(&k).await.unwrap().is_granted());
        let err = a.end(&lease).await.unwrap_err();
        assert!(matches!(err.kind(), GuardErrorKind::LeaseNotHeld { .. }));
    }

    #[tokio::test]
    async fn test_end_twice_fails_loudly() {
        let ensemble = MemoryEnsemble::new();
        let g = guard(&ensemble).await;
        let k = key("jobF");

        let StartOutcome::Granted(lease) = g.start(&k).await.unwrap() else {
            panic!("expected lock");
        };
        g.end(&lease).await.unwrap();

        let err = g.end(&lease).await.unwrap_err();
        assert!(matches!(err.kind(), GuardErrorKind::LeaseNotHeld { .. }));
        let err = g.abort(&lease).await.unwrap_err();
        assert!(matches!(err.kind(), GuardErrorKind::LeaseNotHeld { .. }));
    }

    #[tokio::test]
    async fn test_foreign_lease_rejected() {
        let ensemble = MemoryEnsemble::new();
        let a = guard(&ensemble).await;
        let b = guard(&ensemble).await;
        let k = key("jobG");

        let StartOutcome::Granted(lease) = a.start(&k).await.unwrap() else {
            panic!("expected lock");
        };
        let err = b.abort(&lease).await.unwrap_err();
        assert!(matches!(err.kind(), GuardErrorKind::LeaseNotHeld { .. }));
        assert!(ensemble.contains("/benchq/jobs/jobG/processing"));
    }

    #[tokio::test]
    async fn test_unavailable_grants_nothing() {
        let ensemble = MemoryEnsemble::new();
        let g = guard(&ensemble).await;
        let k = key("jobH");

        ensemble.set_available(false);
        let err = g.start(&k).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(g.held_count(), 0);

        ensemble.set_available(true);
        assert!(g.start(&k).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_end_keeps_lease_when_completion_fails() {
        let ensemble = MemoryEnsemble::new();
        let g = guard(&ensemble).await;
        let k = key("jobI");

        let StartOutcome::Granted(lease) = g.start(&k).await.unwrap() else {
            panic!("expected lock");
        };
        ensemble.set_available(false);
        assert!(g.end(&lease).await.unwrap_err().is_transient());
        assert_eq!(g.held_count(), 1);

        ensemble.set_available(true);
        g.end(&lease).await.unwrap();
        assert!(g.processed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_start_single_winner() {
        let ensemble = MemoryEnsemble::new();
        let mut guards = Vec::new();
        for _ in 0..8 {
            guards.push(Arc::new(guard(&ensemble).await));
        }

        let handles: Vec<_> = guards
            .iter()
            .map(|g| {
                let g = Arc::clone(g);
                tokio::spawn(async move { g.start(&key("jobA")).await.unwrap().is_granted() })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    /// Session that lets another worker finish the job between our checks
    /// and our lock attempt.
    struct FinishesDuringAcquire {
        inner: MemorySession,
        finisher: MemorySession,
    }

    #[async_trait]
    impl Coordination for FinishesDuringAcquire {
        async fn ensure_path(&self, p: &str) -> CoordResult {
            self.inner.ensure_path(p).await
        }
        async fn exists(&self, p: &str) -> CoordResult<bool> {
            self.inner.exists(p).await
        }
        async fn create_ephemeral(&self, p: &str) -> CoordResult<CreateOutcome> {
            let node = path::parent(p).unwrap();
            self.finisher
                .create_persistent(&path::join(node, COMPLETE_MARKER))
                .await?;
            self.inner.create_ephemeral(p).await
        }
        async fn create_persistent(&self, p: &str) -> CoordResult<CreateOutcome> {
            self.inner.create_persistent(p).await
        }
        async fn delete(&self, p: &str) -> CoordResult<DeleteOutcome> {
            self.inner.delete(p).await
        }
        async fn children(&self, p: &str) -> CoordResult<Vec<String>> {
            self.inner.children(p).await
        }
        async fn close(&self) -> CoordResult {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_start_rechecks_completion_after_lock() {
        let ensemble = MemoryEnsemble::new();
        let coord = FinishesDuringAcquire {
            inner: ensemble.connect(),
            finisher: ensemble.connect(),
        };
        let g = JobGuard::connect(Arc::new(coord), ROOT).await.unwrap();

        assert!(matches!(
            g.start(&key("jobJ")).await.unwrap(),
            StartOutcome::AlreadyComplete
        ));
        assert!(!ensemble.contains("/benchq/jobs/jobJ/processing"));
        assert_eq!(g.held_count(), 0);
    }

    /// Session that loses the connection for one `exists` call and for
    /// the next `failing_deletes` deletes
    struct FlakyRecheck {
        inner: MemorySession,
        exists_calls: Mutex<usize>,
        fail_exists_on: usize,
        failing_deletes: Mutex<usize>,
    }

    impl FlakyRecheck {
        // `exists` calls in `start`: complete, processing, complete again.
        fn new(ensemble: &MemoryEnsemble, failing_deletes: usize) -> Self {
            Self {
                inner: ensemble.connect(),
                exists_calls: Mutex::new(0),
                fail_exists_on: 3,
                failing_deletes: Mutex::new(failing_deletes),
            }
        }
    }

    #[async_trait]
    impl Coordination for FlakyRecheck {
        async fn ensure_path(&self, p: &str) -> CoordResult {
            self.inner.ensure_path(p).await
        }
        async fn exists(&self, p: &str) -> CoordResult<bool> {
            let call = {
                let mut calls = self.exists_calls.lock();
                *calls += 1;
                *calls
            };
            if call == self.fail_exists_on {
                return Err(CoordError::unavailable("connection loss"));
            }
            self.inner.exists(p).await
        }
        async fn create_ephemeral(&self, p: &str) -> CoordResult<CreateOutcome> {
            self.inner.create_ephemeral(p).await
        }
        async fn create_persistent(&self, p: &str) -> CoordResult<CreateOutcome> {
            self.inner.create_persistent(p).await
        }
        async fn delete(&self, p: &str) -> CoordResult<DeleteOutcome> {
            {
                let mut failing = self.failing_deletes.lock();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(CoordError::unavailable("connection loss"));
                }
            }
            self.inner.delete(p).await
        }
        async fn children(&self, p: &str) -> CoordResult<Vec<String>> {
            self.inner.children(p).await
        }
        async fn close(&self) -> CoordResult {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_recheck_releases_lock() {
        let ensemble = MemoryEnsemble::new();
        let g = JobGuard::connect(Arc::new(FlakyRecheck::new(&ensemble, 0)), ROOT)
            .await
            .unwrap();
        let k = key("jobK");

        assert!(g.start(&k).await.unwrap_err().is_transient());
        assert_eq!(g.held_count(), 0);
        assert_eq!(g.orphan_count(), 0);
        assert!(!ensemble.contains("/benchq/jobs/jobK/processing"));

        let other = guard(&ensemble).await;
        assert!(other.start(&k).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_unreleased_lock_cleared_by_next_start() {
        let ensemble = MemoryEnsemble::new();
        let g = JobGuard::connect(Arc::new(FlakyRecheck::new(&ensemble, 1)), ROOT)
            .await
            .unwrap();
        let other = guard(&ensemble).await;
        let k = key("jobL");

        assert!(g.start(&k).await.unwrap_err().is_transient());
        assert_eq!(g.orphan_count(), 1);
        assert!(ensemble.contains("/benchq/jobs/jobL/processing"));

        assert!(g.start(&k).await.unwrap().is_granted());
        assert_eq!(g.orphan_count(), 0);
        assert_eq!(g.held_count(), 1);
        assert!(matches!(
            other.start(&k).await.unwrap(),
            StartOutcome::LockHeldByOther
        ));
    }

    #[tokio::test]
    async fn test_inventory() {
        let ensemble = MemoryEnsemble::new();
        let g = guard(&ensemble).await;

        let StartOutcome::Granted(done) = g.start(&key("a")).await.unwrap() else {
            panic!("expected lock");
        };
        g.end(&done).await.unwrap();
        let StartOutcome::Granted(_running) = g.start(&key("b")).await.unwrap() else {
            panic!("expected lock");
        };
        let StartOutcome::Granted(failed) = g.start(&key("c")).await.unwrap() else {
            panic!("expected lock");
        };
        g.abort(&failed).await.unwrap();

        let entries = g.inventory().await.unwrap();
        assert_eq!(
            entries,
            vec![
                JobEntry { key: "a".into(), status: JobStatus::Completed },
                JobEntry { key: "b".into(), status: JobStatus::InFlight },
                JobEntry { key: "c".into(), status: JobStatus::Idle },
            ]
        );
    }
}
