//! The coordinator object and the single-tablet operations it drives.

use std::sync::Arc;
use std::time::Duration;

use oxherd_agent::actionnode::ActionReply;
use oxherd_agent::hook::{Hook, HOOK_DOES_NOT_EXIST, HOOK_SUCCESS};
use oxherd_agent::records::{self, read_tablet, TabletInfo};
use oxherd_agent::ActionInitiator;
use oxherd_common::TabletType;
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::TopoConn;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::shards;

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives fleet-wide operations against the topology service and the
/// per-tablet agents. A wrangler carries a deadline: every wait it issues
/// consumes from the same budget.
pub struct Wrangler {
    conn: Arc<dyn TopoConn>,
    initiator: ActionInitiator,
    deadline: Instant,
}

impl Wrangler {
    pub fn new(conn: Arc<dyn TopoConn>, action_timeout: Duration) -> Self {
        Wrangler {
            initiator: ActionInitiator::new(Arc::clone(&conn)),
            conn,
            deadline: Instant::now() + action_timeout,
        }
    }

    pub fn conn(&self) -> &Arc<dyn TopoConn> {
        &self.conn
    }

    pub fn initiator(&self) -> &ActionInitiator {
        &self.initiator
    }

    /// Time remaining before this wrangler's deadline.
    pub fn action_timeout(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run a hook on a tablet through its agent, treating a missing hook
    /// as success.
    pub async fn execute_optional_hook(
        &self,
        info: &TabletInfo,
        hook: Hook,
    ) -> OxherdResult<()> {
        let name = hook.name.clone();
        let action_path = self
            .initiator
            .execute_hook(&info.alias(), hook)
            .await?;
        let reply = self
            .initiator
            .wait_for_completion_reply(&action_path, self.action_timeout())
            .await?;
        match reply {
            ActionReply::Hook(result) => match result.exit_status {
                HOOK_SUCCESS | HOOK_DOES_NOT_EXIST => Ok(()),
                status => Err(OxherdError::HookFailed(format!(
                    "{name} exited with {status}: {}{}",
                    result.stdout, result.stderr
                ))),
            },
            other => Err(OxherdError::Internal(format!(
                "unexpected reply to ExecuteHook: {other:?}"
            ))),
        }
    }

    /// Change the type of a tablet and recompute the derived graphs.
    ///
    /// With `force`, the record is changed directly in topology (no agent
    /// involved) and the server-check hooks are skipped.
    pub async fn change_type(
        &self,
        tablet_path: &str,
        db_type: TabletType,
        force: bool,
    ) -> OxherdResult<()> {
        // Load first: the change may unassign the tablet.
        let info = read_tablet(self.conn.as_ref(), tablet_path).await?;
        let rebuild_required = info.tablet.is_serving_type();
        let keyspace = info.tablet.keyspace.clone();
        let shard = info.tablet.shard.clone();

        if force {
            records::change_type(self.conn.as_ref(), tablet_path, db_type).await?;
        } else {
            if info.tablet.tablet_type == TabletType::Idle {
                self.execute_optional_hook(&info, Hook::new_simple("idle_server_check"))
                    .await?;
            }
            if db_type != TabletType::Scrap {
                self.execute_optional_hook(&info, Hook::new_simple("live_server_check"))
                    .await?;
            }

            let action_path = self.initiator.change_type(&info.alias(), db_type).await?;
            // No choice: wait for completion before rebuilding.
            self.initiator
                .wait_for_completion(&action_path, self.action_timeout())
                .await?;
        }

        if rebuild_required {
            shards::rebuild_shard(self.conn.as_ref(), &keyspace, &shard).await?;
            shards::rebuild_keyspace(self.conn.as_ref(), &keyspace).await?;
        }
        Ok(())
    }

    /// Scrap a tablet. With `force`, topology is changed directly instead
    /// of remote-executing the action.
    pub async fn scrap(
        &self,
        tablet_path: &str,
        force: bool,
        skip_rebuild: bool,
    ) -> OxherdResult<()> {
        let info = read_tablet(self.conn.as_ref(), tablet_path).await?;
        let rebuild_required = info.tablet.is_serving_type();
        let keyspace = info.tablet.keyspace.clone();
        let shard = info.tablet.shard.clone();

        if force {
            records::scrap(self.conn.as_ref(), tablet_path, true).await?;
        } else {
            let action_path = self.initiator.scrap(&info.alias()).await?;
            self.initiator
                .wait_for_completion(&action_path, self.action_timeout())
                .await?;
        }

        if !rebuild_required {
            info!("rebuild not required");
            return Ok(());
        }
        if skip_rebuild {
            warn!("rebuild required, but skipping it");
            return Ok(());
        }
        shards::rebuild_shard(self.conn.as_ref(), &keyspace, &shard).await?;
        shards::rebuild_keyspace(self.conn.as_ref(), &keyspace).await?;
        Ok(())
    }
}
