//! ZooKeeper coordination backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use zookeeper_client as zk;

use crate::client::{Coordination, CreateOutcome, DeleteOutcome};
use crate::{CoordError, CoordErrorKind, CoordResult, path};

/// Coordination session backed by a ZooKeeper ensemble
pub struct ZkCoordination {
    client: Mutex<Option<zk::Client>>,
    hosts: String,
}

impl std::fmt::Debug for ZkCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkCoordination")
            .field("hosts", &self.hosts)
            .field("open", &self.client.lock().is_some())
            .finish()
    }
}

impl ZkCoordination {
    /// Connects to `hosts` and establishes a session
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if no server could be reached.
    pub async fn connect(hosts: &str, session_timeout: Duration) -> CoordResult<Self> {
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(hosts)
            .await
            .map_err(|e| CoordError::unavailable(format!("{hosts}: {e}")))?;
        info!(hosts, ?session_timeout, "zookeeper session established");
        Ok(Self {
            client: Mutex::new(Some(client)),
            hosts: hosts.to_string(),
        })
    }

    fn client(&self) -> CoordResult<zk::Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| CoordErrorKind::Closed.into())
    }

    async fn create(&self, target: &str, mode: zk::CreateMode) -> CoordResult<CreateOutcome> {
        path::validate(target)?;
        let options = mode.with_acls(zk::Acls::anyone_all());
        match self.client()?.create(target, &[], &options).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(zk::Error::NodeExists) => Ok(CreateOutcome::AlreadyExists),
            Err(zk::Error::NoNode) => Err(CoordErrorKind::NoParent {
                path: target.to_string(),
            }
            .into()),
            Err(e) => Err(map_error(e)),
        }
    }
}

fn map_error(e: zk::Error) -> CoordError {
    match e {
        zk::Error::ConnectionLoss => CoordError::unavailable("connection loss"),
        zk::Error::SessionExpired => CoordErrorKind::SessionExpired.into(),
        other => CoordError::backend(other.to_string()),
    }
}

#[async_trait]
impl Coordination for ZkCoordination {
    async fn ensure_path(&self, target: &str) -> CoordResult {
        path::validate(target)?;
        for prefix in path::prefixes(target) {
            self.create(prefix, zk::CreateMode::Persistent).await?;
        }
        Ok(())
    }

    async fn exists(&self, target: &str) -> CoordResult<bool> {
        path::validate(target)?;
        let stat = self.client()?.check_stat(target).await.map_err(map_error)?;
        Ok(stat.is_some())
    }

    async fn create_ephemeral(&self, target: &str) -> CoordResult<CreateOutcome> {
        self.create(target, zk::CreateMode::Ephemeral).await
    }

    async fn create_persistent(&self, target: &str) -> CoordResult<CreateOutcome> {
        self.create(target, zk::CreateMode::Persistent).await
    }

    async fn delete(&self, target: &str) -> CoordResult<DeleteOutcome> {
        path::validate(target)?;
        match self.client()?.delete(target, None).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(zk::Error::NoNode) => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn children(&self, target: &str) -> CoordResult<Vec<String>> {
        path::validate(target)?;
        match self.client()?.list_children(target).await {
            Ok(mut names) => {
                names.sort();
                Ok(names)
            }
            Err(zk::Error::NoNode) => Ok(Vec::new()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn close(&self) -> CoordResult {
        // Dropping the last handle ends the session and its ephemeral nodes.
        if self.client.lock().take().is_some() {
            debug!(hosts = %self.hosts, "zookeeper session closed");
        }
        Ok(())
    }
}
