//! Coordination client trait.

use async_trait::async_trait;

use crate::CoordResult;

/// Result of a node creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This call created the node
    Created,
    /// The node was already there
    AlreadyExists,
}

impl CreateOutcome {
    /// Returns true if this call created the node
    #[must_use]
    pub fn is_created(self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Result of a node deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// This call deleted the node
    Deleted,
    /// There was no node to delete
    NotFound,
}

/// Facade over a hierarchical, strongly consistent namespace.
///
/// One value of an implementing type is one session. Ephemeral nodes created
/// through it are removed by the service when the session ends, whether by
/// [`Coordination::close`], process exit or expiry.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Creates `path` and any missing ancestors as persistent nodes
    async fn ensure_path(&self, path: &str) -> CoordResult;

    /// Returns true if a node exists at `path`
    async fn exists(&self, path: &str) -> CoordResult<bool>;

    /// Atomically creates an ephemeral node owned by this session
    async fn create_ephemeral(&self, path: &str) -> CoordResult<CreateOutcome>;

    /// Atomically creates a persistent node
    async fn create_persistent(&self, path: &str) -> CoordResult<CreateOutcome>;

    /// Deletes the node at `path`
    async fn delete(&self, path: &str) -> CoordResult<DeleteOutcome>;

    /// Lists the names of the direct children of `path`; empty if it does
    /// not exist
    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    /// Ends the session, releasing its ephemeral nodes
    async fn close(&self) -> CoordResult;
}
