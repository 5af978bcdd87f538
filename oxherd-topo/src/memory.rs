//! In-process topology store with sessions, ephemerals, and watches.
//!
//! Nodes live in a flat ordered map keyed by absolute path. One mutex
//! guards the whole store; every operation is a short critical section and
//! never holds the lock across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use oxherd_errors::{OxherdError, OxherdResult};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::conn::{CreateMode, NodeStat, NodeVersion, NodeWatch, TopoConn};

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    version: NodeVersion,
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct Store {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, watch::Sender<u64>>,
    seq_counters: HashMap<String, u64>,
    next_session: u64,
}

impl Store {
    fn notify(&mut self, path: &str) {
        if let Some(tx) = self.watches.get(path) {
            tx.send_modify(|epoch| *epoch += 1);
        }
    }

    fn notify_with_parent(&mut self, path: &str) {
        self.notify(path);
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_owned();
            self.notify(&parent);
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(p, _)| p.starts_with(&prefix))
            .unwrap_or(false)
    }
}

/// The shared in-memory topology store. Cheap to clone; all clones see the
/// same namespace.
#[derive(Clone, Default)]
pub struct MemoryTopo {
    store: Arc<Mutex<Store>>,
}

struct SessionHandle {
    id: u64,
    store: Weak<Mutex<Store>>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut store = store.lock();
        let expired: Vec<String> = store
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in expired {
            debug!(%path, session = self.id, "expiring ephemeral node");
            store.nodes.remove(&path);
            store.notify_with_parent(&path);
        }
    }
}

/// A session-scoped connection to a [`MemoryTopo`]. Ephemeral nodes created
/// through this connection are removed when the last clone is dropped.
#[derive(Clone)]
pub struct MemoryConn {
    store: Arc<Mutex<Store>>,
    session: Arc<SessionHandle>,
}

impl MemoryTopo {
    pub fn new() -> Self {
        MemoryTopo::default()
    }

    /// Open a new session.
    pub fn connect(&self) -> MemoryConn {
        let id = {
            let mut store = self.store.lock();
            store.next_session += 1;
            store.next_session
        };
        MemoryConn {
            store: Arc::clone(&self.store),
            session: Arc::new(SessionHandle {
                id,
                store: Arc::downgrade(&self.store),
            }),
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn check_path(path: &str) -> OxherdResult<()> {
    if !path.starts_with('/') || path.len() > 1 && path.ends_with('/') {
        return Err(OxherdError::Internal(format!("malformed path {path:?}")));
    }
    Ok(())
}

impl MemoryConn {
    /// The session id, used in lock payloads to identify the holder.
    pub fn session_id(&self) -> u64 {
        self.session.id
    }
}

#[async_trait]
impl TopoConn for MemoryConn {
    async fn get(&self, path: &str) -> OxherdResult<(Vec<u8>, NodeVersion)> {
        check_path(path)?;
        let store = self.store.lock();
        match store.nodes.get(path) {
            Some(node) => Ok((node.data.clone(), node.version)),
            None => Err(OxherdError::NodeNotFound(path.to_owned())),
        }
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<NodeVersion>,
    ) -> OxherdResult<NodeVersion> {
        check_path(path)?;
        let mut store = self.store.lock();
        let node = store
            .nodes
            .get_mut(path)
            .ok_or_else(|| OxherdError::NodeNotFound(path.to_owned()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(OxherdError::VersionMismatch {
                    path: path.to_owned(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data;
        node.version += 1;
        let version = node.version;
        store.notify(path);
        Ok(version)
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> OxherdResult<String> {
        check_path(path)?;
        let mut store = self.store.lock();

        if let Some(parent) = parent_of(path) {
            if !store.nodes.contains_key(parent) {
                return Err(OxherdError::NodeNotFound(parent.to_owned()));
            }
        }

        let actual_path = if mode.is_sequential() {
            let counter = store.seq_counters.entry(path.to_owned()).or_insert(0);
            let suffix = *counter;
            *counter += 1;
            format!("{path}{suffix:010}")
        } else {
            path.to_owned()
        };

        if store.nodes.contains_key(&actual_path) {
            return Err(OxherdError::NodeExists(actual_path));
        }

        store.nodes.insert(
            actual_path.clone(),
            Node {
                data,
                version: 0,
                ephemeral_owner: mode.is_ephemeral().then_some(self.session.id),
            },
        );
        store.notify_with_parent(&actual_path);
        Ok(actual_path)
    }

    async fn delete(&self, path: &str, expected: Option<NodeVersion>) -> OxherdResult<()> {
        check_path(path)?;
        let mut store = self.store.lock();
        let node = store
            .nodes
            .get(path)
            .ok_or_else(|| OxherdError::NodeNotFound(path.to_owned()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(OxherdError::VersionMismatch {
                    path: path.to_owned(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if store.has_children(path) {
            return Err(OxherdError::NotEmpty(path.to_owned()));
        }
        store.nodes.remove(path);
        store.notify_with_parent(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> OxherdResult<Vec<String>> {
        check_path(path)?;
        let store = self.store.lock();
        // The root always exists, like in any hierarchical store.
        if path != "/" && !store.nodes.contains_key(path) {
            return Err(OxherdError::NodeNotFound(path.to_owned()));
        }
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        let mut names = Vec::new();
        for (candidate, _) in store.nodes.range(prefix.clone()..) {
            if !candidate.starts_with(&prefix) {
                break;
            }
            let rest = &candidate[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                names.push(rest.to_owned());
            }
        }
        Ok(names)
    }

    async fn children_recursive(&self, path: &str) -> OxherdResult<Vec<String>> {
        check_path(path)?;
        let store = self.store.lock();
        if path != "/" && !store.nodes.contains_key(path) {
            return Err(OxherdError::NodeNotFound(path.to_owned()));
        }
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        let mut paths = Vec::new();
        for (candidate, _) in store.nodes.range(prefix.clone()..) {
            if !candidate.starts_with(&prefix) {
                break;
            }
            paths.push(candidate[prefix.len()..].to_owned());
        }
        Ok(paths)
    }

    async fn exists(&self, path: &str) -> OxherdResult<Option<NodeStat>> {
        check_path(path)?;
        let store = self.store.lock();
        let Some(node) = store.nodes.get(path) else {
            return Ok(None);
        };
        let prefix = format!("{path}/");
        let num_children = store
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .count();
        Ok(Some(NodeStat {
            version: node.version,
            num_children,
            ephemeral: node.ephemeral_owner.is_some(),
        }))
    }

    async fn watch(&self, path: &str) -> OxherdResult<NodeWatch> {
        check_path(path)?;
        let mut store = self.store.lock();
        let tx = store
            .watches
            .entry(path.to_owned())
            .or_insert_with(|| watch::channel(0).0);
        Ok(NodeWatch::new(tx.subscribe()))
    }
}

/// Create `path` and any missing ancestors, ignoring nodes that already
/// exist. Created nodes are persistent and empty.
pub async fn ensure_path(conn: &dyn TopoConn, path: &str) -> OxherdResult<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match conn.create(&current, Vec::new(), CreateMode::Persistent).await {
            Ok(_) => {}
            Err(OxherdError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conn::wait_for_node;

    #[tokio::test]
    async fn create_get_set_delete() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        ensure_path(&conn, "/a").await.unwrap();
        conn.create("/a/b", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (data, version) = conn.get("/a/b").await.unwrap();
        assert_eq!(data, b"v0");
        assert_eq!(version, 0);

        let v1 = conn.set("/a/b", b"v1".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v1, 1);

        // Stale CAS loses.
        assert_eq!(
            conn.set("/a/b", b"v2".to_vec(), Some(0)).await,
            Err(OxherdError::VersionMismatch {
                path: "/a/b".into(),
                expected: 0,
                actual: 1,
            })
        );

        // Deleting a node with children is refused.
        assert!(matches!(
            conn.delete("/a", None).await,
            Err(OxherdError::NotEmpty(_))
        ));
        conn.delete("/a/b", None).await.unwrap();
        conn.delete("/a", None).await.unwrap();
        assert!(matches!(
            conn.get("/a/b").await,
            Err(OxherdError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        assert!(matches!(
            conn.create("/a/b", Vec::new(), CreateMode::Persistent).await,
            Err(OxherdError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn sequential_nodes_get_monotonic_suffixes() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        ensure_path(&conn, "/q").await.unwrap();
        let p0 = conn
            .create("/q/item-", b"0".to_vec(), CreateMode::Sequential)
            .await
            .unwrap();
        let p1 = conn
            .create("/q/item-", b"1".to_vec(), CreateMode::Sequential)
            .await
            .unwrap();
        assert_eq!(p0, "/q/item-0000000000");
        assert_eq!(p1, "/q/item-0000000001");
        assert_eq!(conn.children("/q").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ephemerals_vanish_with_their_session() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        ensure_path(&conn, "/locks").await.unwrap();

        let other = topo.connect();
        other
            .create("/locks/holder", b"me".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert!(conn.exists("/locks/holder").await.unwrap().is_some());

        drop(other);
        assert!(conn.exists("/locks/holder").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_fires_on_create() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        ensure_path(&conn, "/w").await.unwrap();

        let writer = topo.connect();
        let waiter = tokio::spawn(async move {
            wait_for_node(&conn, "/w/flag", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer
            .create("/w/flag", b"up".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let (data, _) = waiter.await.unwrap().unwrap();
        assert_eq!(data, b"up");
    }

    #[tokio::test]
    async fn wait_for_node_times_out() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        let err = wait_for_node(&conn, "/never", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OxherdError::Timeout { .. }));
    }

    #[tokio::test]
    async fn recursive_listing() {
        let topo = MemoryTopo::new();
        let conn = topo.connect();
        ensure_path(&conn, "/k/s/a").await.unwrap();
        ensure_path(&conn, "/k/s/b/c").await.unwrap();
        assert_eq!(
            conn.children_recursive("/k").await.unwrap(),
            vec!["s", "s/a", "s/b", "s/b/c"]
        );
        assert_eq!(conn.children("/k/s").await.unwrap(), vec!["a", "b"]);
    }
}
