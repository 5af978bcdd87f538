//! The topology connection trait.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use oxherd_errors::{OxherdError, OxherdResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

/// Version of a topology node, incremented on every write.
pub type NodeVersion = u64;

/// Metadata about a node, as returned by `exists`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStat {
    pub version: NodeVersion,
    pub num_children: usize,
    pub ephemeral: bool,
}

/// How a node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
    /// The store appends a monotonic zero-padded suffix to the name; the
    /// full path actually created is returned.
    Sequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::Sequential | CreateMode::EphemeralSequential)
    }
}

/// A level-style watch on one node. The receiver's value is an epoch that
/// bumps on every create/set/delete of the node (and, for directories, on
/// child create/delete).
pub struct NodeWatch {
    rx: watch::Receiver<u64>,
}

impl NodeWatch {
    pub fn new(rx: watch::Receiver<u64>) -> Self {
        NodeWatch { rx }
    }

    /// Wait for the next change after the last observed one.
    pub async fn changed(&mut self) -> OxherdResult<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| OxherdError::Internal("topology watch closed".into()))
    }
}

/// A connection to the topology service, scoped to a session. Ephemeral
/// nodes created through a connection vanish when its session ends.
#[async_trait]
pub trait TopoConn: Send + Sync {
    /// Read a node's payload and version.
    async fn get(&self, path: &str) -> OxherdResult<(Vec<u8>, NodeVersion)>;

    /// Overwrite a node. With `expected` set, the write only succeeds if the
    /// stored version still matches (`VersionMismatch` otherwise); `None`
    /// writes unconditionally.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<NodeVersion>,
    ) -> OxherdResult<NodeVersion>;

    /// Create a node, returning the path actually created (which differs
    /// from `path` for sequential modes). Fails with `NodeExists` if the
    /// node is already there, `NodeNotFound` if the parent is missing.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> OxherdResult<String>;

    /// Delete a node. With `expected` set, behaves like a CAS. Fails with
    /// `NotEmpty` when the node still has children.
    async fn delete(&self, path: &str, expected: Option<NodeVersion>) -> OxherdResult<()>;

    /// Names of the node's direct children, sorted.
    async fn children(&self, path: &str) -> OxherdResult<Vec<String>>;

    /// Paths of all descendants, relative to `path`, sorted.
    async fn children_recursive(&self, path: &str) -> OxherdResult<Vec<String>>;

    /// Node metadata, or `None` if the node does not exist.
    async fn exists(&self, path: &str) -> OxherdResult<Option<NodeStat>>;

    /// Watch a path for changes. Watching a nonexistent path is allowed;
    /// the watch fires when the node appears.
    async fn watch(&self, path: &str) -> OxherdResult<NodeWatch>;
}

/// Typed JSON helpers layered over [`TopoConn`].
#[async_trait]
pub trait TopoConnExt: TopoConn {
    async fn get_json<T>(&self, path: &str) -> OxherdResult<(T, NodeVersion)>
    where
        T: DeserializeOwned + Send,
    {
        let (data, version) = self.get(path).await?;
        let value = serde_json::from_slice(&data)?;
        Ok((value, version))
    }

    async fn set_json<T>(
        &self,
        path: &str,
        value: &T,
        expected: Option<NodeVersion>,
    ) -> OxherdResult<NodeVersion>
    where
        T: Serialize + Sync,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.set(path, data, expected).await
    }

    async fn create_json<T>(
        &self,
        path: &str,
        value: &T,
        mode: CreateMode,
    ) -> OxherdResult<String>
    where
        T: Serialize + Sync,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.create(path, data, mode).await
    }
}

impl<C: TopoConn + ?Sized> TopoConnExt for C {}

/// Block until `path` exists, up to `timeout`, then read it.
pub async fn wait_for_node(
    conn: &dyn TopoConn,
    path: &str,
    timeout: Duration,
) -> OxherdResult<(Vec<u8>, NodeVersion)> {
    let deadline = Instant::now() + timeout;
    let mut watch = conn.watch(path).await?;
    loop {
        if conn.exists(path).await?.is_some() {
            return conn.get(path).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(OxherdError::Timeout {
                during: format!("waiting for node {path}"),
            });
        }
        match tokio::time::timeout(remaining, watch.changed()).await {
            Ok(changed) => changed?,
            Err(_) => {
                return Err(OxherdError::Timeout {
                    during: format!("waiting for node {path}"),
                })
            }
        }
    }
}
