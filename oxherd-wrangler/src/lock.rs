//! Advisory shard locks.
//!
//! The lock is an ephemeral node under the shard's action path. Ephemerality
//! is the crash-safety story: a holder whose session dies releases the lock
//! automatically. Contenders poll with exponential backoff until the node
//! vanishes or their deadline passes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::paths;
use oxherd_topo::{CreateMode, TopoConn, TopoConnExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Name of the lock node under the shard's action path.
pub const SHARD_LOCK_NODE: &str = "lock";

/// Payload stored in the lock node so operators can see who holds it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockPayload {
    pub purpose: String,
    pub holder: String,
    pub started_at_unix: u64,
}

/// Record written to the shard's actionlog when the lock is released.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockOutcome {
    purpose: String,
    holder: String,
    status: String,
}

/// A held shard lock. Dropping it without [`ShardLock::release`] still
/// frees the node once the owning session ends, but skips the actionlog
/// record.
pub struct ShardLock {
    conn: Arc<dyn TopoConn>,
    keyspace: String,
    shard: String,
    path: String,
    payload: LockPayload,
}

/// Acquire the shard lock, retrying with backoff until `deadline` elapses.
pub async fn obtain_shard_lock(
    conn: Arc<dyn TopoConn>,
    keyspace: &str,
    shard: &str,
    purpose: &str,
    deadline: Duration,
) -> OxherdResult<ShardLock> {
    let path = format!(
        "{}/{SHARD_LOCK_NODE}",
        paths::shard_action_path(keyspace, shard)
    );
    let payload = LockPayload {
        purpose: purpose.to_owned(),
        holder: format!("pid-{}", std::process::id()),
        started_at_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };

    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(deadline),
        ..Default::default()
    };

    loop {
        match conn
            .create_json(&path, &payload, CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {
                info!(%path, purpose, "obtained shard lock");
                return Ok(ShardLock {
                    conn,
                    keyspace: keyspace.to_owned(),
                    shard: shard.to_owned(),
                    path,
                    payload,
                });
            }
            Err(OxherdError::NodeExists(_)) => match backoff.next_backoff() {
                Some(wait) => {
                    warn!(%path, purpose, ?wait, "shard lock held, retrying");
                    tokio::time::sleep(wait).await;
                }
                None => {
                    return Err(OxherdError::Timeout {
                        during: format!("obtaining shard lock {path} for {purpose}"),
                    });
                }
            },
            Err(e) => return Err(e),
        }
    }
}

impl ShardLock {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record the operation's outcome on the shard's actionlog, then free
    /// the lock node.
    pub async fn release(self, outcome: &OxherdResult<()>) -> OxherdResult<()> {
        let record = LockOutcome {
            purpose: self.payload.purpose.clone(),
            holder: self.payload.holder.clone(),
            status: match outcome {
                Ok(()) => "done".to_owned(),
                Err(e) => format!("failed: {e}"),
            },
        };
        let log_prefix = format!(
            "{}/{}",
            paths::shard_actionlog_path(&self.keyspace, &self.shard),
            paths::ACTION_NODE_PREFIX
        );
        self.conn
            .create_json(&log_prefix, &record, CreateMode::Sequential)
            .await?;
        self.conn.delete(&self.path, None).await
    }
}

#[cfg(test)]
mod tests {
    use oxherd_topo::{ensure_path, MemoryTopo};

    use super::*;

    async fn setup(topo: &MemoryTopo) {
        let conn = topo.connect();
        ensure_path(&conn, &paths::shard_action_path("ks", "0"))
            .await
            .unwrap();
        ensure_path(&conn, &paths::shard_actionlog_path("ks", "0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let topo = MemoryTopo::new();
        setup(&topo).await;
        let holder: Arc<dyn TopoConn> = Arc::new(topo.connect());
        let contender: Arc<dyn TopoConn> = Arc::new(topo.connect());

        let lock = obtain_shard_lock(holder, "ks", "0", "Reparent", Duration::from_secs(5))
            .await
            .unwrap();

        // A contender with a short deadline times out while we hold it.
        let denied = obtain_shard_lock(
            Arc::clone(&contender),
            "ks",
            "0",
            "Check",
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(denied, Err(OxherdError::Timeout { .. })));

        lock.release(&Ok(())).await.unwrap();
        let lock2 = obtain_shard_lock(contender, "ks", "0", "Check", Duration::from_secs(5))
            .await
            .unwrap();
        lock2.release(&Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn crashed_holder_frees_the_lock() {
        let topo = MemoryTopo::new();
        setup(&topo).await;

        let holder_conn = topo.connect();
        let holder: Arc<dyn TopoConn> = Arc::new(holder_conn);
        let _lock = obtain_shard_lock(holder, "ks", "0", "Reparent", Duration::from_secs(5))
            .await
            .unwrap();
        // Simulate a crash: the holding session goes away without release.
        drop(_lock);
        // The lock struct holds the conn; dropping it ends the session and
        // expires the ephemeral, so a new session can lock immediately.
        let next: Arc<dyn TopoConn> = Arc::new(topo.connect());
        let lock = obtain_shard_lock(next, "ks", "0", "Check", Duration::from_secs(5))
            .await
            .unwrap();
        lock.release(&Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn release_writes_outcome_to_actionlog() {
        let topo = MemoryTopo::new();
        setup(&topo).await;
        let conn: Arc<dyn TopoConn> = Arc::new(topo.connect());
        let reader = topo.connect();

        let lock = obtain_shard_lock(Arc::clone(&conn), "ks", "0", "Reparent", Duration::from_secs(5))
            .await
            .unwrap();
        lock.release(&Err(OxherdError::Aborted("nope".into())))
            .await
            .unwrap();

        let logs = reader
            .children(&paths::shard_actionlog_path("ks", "0"))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        let (data, _) = reader
            .get(&format!(
                "{}/{}",
                paths::shard_actionlog_path("ks", "0"),
                logs[0]
            ))
            .await
            .unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.contains("failed: aborted: nope"));
    }
}
