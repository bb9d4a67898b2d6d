//! In-process coordination ensemble.
//!
//! A strongly consistent node tree shared by any number of sessions, with the
//! same ephemeral-node semantics as the real service. Sessions can be expired
//! and the whole ensemble made unavailable to reproduce crashes and network
//! partitions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::client::{Coordination, CreateOutcome, DeleteOutcome};
use crate::{CoordError, CoordErrorKind, CoordResult, path};

/// Identifier of a session within a [`MemoryEnsemble`]
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Live,
    Expired,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    ephemeral_owner: Option<SessionId>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, SessionState>,
    available: bool,
}

impl Tree {
    fn has_children(&self, path: &str) -> bool {
        let prefix = path::join(path, "");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn release(&mut self, session: SessionId) -> usize {
        let before = self.nodes.len();
        self.nodes
            .retain(|_, node| node.ephemeral_owner != Some(session));
        before - self.nodes.len()
    }
}

/// Shared in-memory coordination service
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryEnsemble {
    /// Creates an empty ensemble containing only the root node
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree {
                nodes: BTreeMap::new(),
                sessions: HashMap::new(),
                available: true,
            })),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens a new session
    #[must_use]
    pub fn connect(&self) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.tree.lock().sessions.insert(id, SessionState::Live);
        debug!(session = id, "memory session opened");
        MemorySession {
            ensemble: self.clone(),
            id,
        }
    }

    /// Expires a session as the service would after a crash or a partition
    /// longer than the session timeout
    ///
    /// Returns the number of ephemeral nodes released.
    pub fn expire(&self, session: SessionId) -> usize {
        let mut tree = self.tree.lock();
        match tree.sessions.get_mut(&session) {
            Some(state) if *state == SessionState::Live => *state = SessionState::Expired,
            _ => return 0,
        }
        let released = tree.release(session);
        debug!(session, released, "memory session expired");
        released
    }

    /// Makes every call fail with `Unavailable` while `false`
    pub fn set_available(&self, available: bool) {
        self.tree.lock().available = available;
    }

    /// Returns true if a node exists, bypassing sessions and availability
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        path == "/" || self.tree.lock().nodes.contains_key(path)
    }

    /// Returns the session owning an ephemeral node
    #[must_use]
    pub fn ephemeral_owner(&self, path: &str) -> Option<SessionId> {
        self.tree
            .lock()
            .nodes
            .get(path)
            .and_then(|node| node.ephemeral_owner)
    }

    /// Number of nodes in the tree, root excluded
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.tree.lock().nodes.len()
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// A session against a [`MemoryEnsemble`]
///
/// Dropping a live session expires it, mirroring process exit.
#[derive(Debug)]
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    id: SessionId,
}

impl MemorySession {
    /// Identifier of this session
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn with_tree<T>(&self, op: impl FnOnce(&mut Tree) -> CoordResult<T>) -> CoordResult<T> {
        let mut tree = self.ensemble.tree.lock();
        if !tree.available {
            return Err(CoordError::unavailable("connection loss"));
        }
        match tree.sessions.get(&self.id) {
            Some(SessionState::Live) => {}
            Some(SessionState::Closed) => return Err(CoordErrorKind::Closed.into()),
            _ => return Err(CoordErrorKind::SessionExpired.into()),
        }
        op(&mut tree)
    }

    fn create(&self, target: &str, owner: Option<SessionId>) -> CoordResult<CreateOutcome> {
        path::validate(target)?;
        if target == "/" {
            return Ok(CreateOutcome::AlreadyExists);
        }
        self.with_tree(|tree| {
            if tree.nodes.contains_key(target) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            match path::parent(target) {
                Some("/") | None => {}
                Some(parent) => match tree.nodes.get(parent) {
                    None => {
                        return Err(CoordErrorKind::NoParent {
                            path: target.to_string(),
                        }
                        .into());
                    }
                    Some(node) if node.ephemeral_owner.is_some() => {
                        return Err(CoordError::backend(format!(
                            "ephemeral node '{parent}' cannot have children"
                        )));
                    }
                    Some(_) => {}
                },
            }
            tree.nodes.insert(
                target.to_string(),
                Node {
                    ephemeral_owner: owner,
                },
            );
            Ok(CreateOutcome::Created)
        })
    }
}

#[async_trait]
impl Coordination for MemorySession {
    async fn ensure_path(&self, target: &str) -> CoordResult {
        path::validate(target)?;
        for prefix in path::prefixes(target) {
            self.create(prefix, None)?;
        }
        Ok(())
    }

    async fn exists(&self, target: &str) -> CoordResult<bool> {
        path::validate(target)?;
        self.with_tree(|tree| Ok(target == "/" || tree.nodes.contains_key(target)))
    }

    async fn create_ephemeral(&self, target: &str) -> CoordResult<CreateOutcome> {
        self.create(target, Some(self.id))
    }

    async fn create_persistent(&self, target: &str) -> CoordResult<CreateOutcome> {
        self.create(target, None)
    }

    async fn delete(&self, target: &str) -> CoordResult<DeleteOutcome> {
        path::validate(target)?;
        self.with_tree(|tree| {
            if !tree.nodes.contains_key(target) {
                return Ok(DeleteOutcome::NotFound);
            }
            if tree.has_children(target) {
                return Err(CoordError::backend(format!("node '{target}' is not empty")));
            }
            tree.nodes.remove(target);
            Ok(DeleteOutcome::Deleted)
        })
    }

    async fn children(&self, target: &str) -> CoordResult<Vec<String>> {
        path::validate(target)?;
        self.with_tree(|tree| {
            let prefix = path::join(target, "");
            Ok(tree
                .nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| &k[prefix.len()..])
                .filter(|rest| !rest.contains('/'))
                .map(ToString::to_string)
                .collect())
        })
    }

    async fn close(&self) -> CoordResult {
        let mut tree = self.ensemble.tree.lock();
        let state = tree.sessions.get_mut(&self.id);
        if let Some(state) = state.filter(|s| **s == SessionState::Live) {
            *state = SessionState::Closed;
            let released = tree.release(self.id);
            debug!(session = self.id, released, "memory session closed");
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.ensemble.expire(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        session.ensure_path("/benchq/jobs/k1").await.unwrap();
        session.ensure_path("/benchq/jobs/k1").await.unwrap();

        assert!(session.exists("/benchq").await.unwrap());
        assert!(session.exists("/benchq/jobs/k1").await.unwrap());
        assert_eq!(ensemble.node_count(), 3);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        let err = session.create_persistent("/missing/child").await.unwrap_err();
        assert!(matches!(err.kind(), CoordErrorKind::NoParent { .. }));
    }

    #[tokio::test]
    async fn test_create_reports_existing() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();
        a.ensure_path("/jobs").await.unwrap();

        assert_eq!(
            a.create_ephemeral("/jobs/lock").await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            b.create_ephemeral("/jobs/lock").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(ensemble.ephemeral_owner("/jobs/lock"), Some(a.id()));
    }

    #[tokio::test]
    async fn test_ephemeral_released_on_expiry_only() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        a.ensure_path("/jobs").await.unwrap();
        a.create_ephemeral("/jobs/lock").await.unwrap();
        a.create_persistent("/jobs/done").await.unwrap();

        assert_eq!(ensemble.expire(a.id()), 1);
        assert!(!ensemble.contains("/jobs/lock"));
        assert!(ensemble.contains("/jobs/done"));

        let err = a.exists("/jobs").await.unwrap_err();
        assert!(matches!(err.kind(), CoordErrorKind::SessionExpired));
    }

    #[tokio::test]
    async fn test_drop_releases_ephemeral_nodes() {
        let ensemble = MemoryEnsemble::new();
        {
            let a = ensemble.connect();
            a.ensure_path("/jobs").await.unwrap();
            a.create_ephemeral("/jobs/lock").await.unwrap();
        }
        assert!(!ensemble.contains("/jobs/lock"));
        assert!(ensemble.contains("/jobs"));
    }

    #[tokio::test]
    async fn test_close_releases_and_rejects_further_calls() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        a.ensure_path("/jobs").await.unwrap();
        a.create_ephemeral("/jobs/lock").await.unwrap();

        a.close().await.unwrap();
        assert!(!ensemble.contains("/jobs/lock"));

        let err = a.exists("/jobs").await.unwrap_err();
        assert!(matches!(err.kind(), CoordErrorKind::Closed));
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        ensemble.set_available(false);

        let err = a.exists("/").await.unwrap_err();
        assert!(err.is_transient());

        ensemble.set_available(true);
        assert!(a.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_children() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        a.ensure_path("/jobs/k1").await.unwrap();
        a.ensure_path("/jobs/k2").await.unwrap();
        a.create_persistent("/jobs/k1/complete").await.unwrap();

        assert_eq!(a.children("/jobs").await.unwrap(), vec!["k1", "k2"]);
        assert_eq!(a.children("/jobs/k1").await.unwrap(), vec!["complete"]);
        assert!(a.children("/nothing").await.unwrap().is_empty());

        assert!(a.delete("/jobs/k1").await.is_err());
        assert_eq!(
            a.delete("/jobs/k1/complete").await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            a.delete("/jobs/k1/complete").await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        a.create_ephemeral("/lock").await.unwrap();
        assert!(a.create_persistent("/lock/child").await.is_err());
    }
}
