//! Internally triggered reparents: the wrangler picks the new master.
//!
//! The shard lock is held for the whole transition. Order matters: the old
//! master is demoted before anyone computes restart data, the master-elect
//! is promoted before any slave is restarted, and per-slave restart
//! failures are recorded without aborting; stragglers stay behind to be
//! scrapped.

use std::collections::HashMap;
use std::sync::Arc;

use oxherd_agent::actionnode::{ActionReply, RestartSlaveArgs, RestartSlaveData};
use oxherd_agent::records::{read_tablet, TabletInfo};
use oxherd_common::{TabletAlias, TabletType};
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_topo::paths;
use oxherd_util::{AllErrorRecorder, ErrorRecorder};
use replication_position::ReplicationPosition;
use tracing::{info, warn};

use crate::lock::obtain_shard_lock;
use crate::shards;
use crate::wrangler::Wrangler;

impl Wrangler {
    /// Reparent a shard to `master_elect_path`.
    ///
    /// The current master is demoted if it is still around; a shard whose
    /// recorded master is gone or already scrapped is reparented from the
    /// master-elect's own position instead.
    pub async fn reparent_shard(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect_path: &str,
    ) -> OxherdResult<()> {
        let lock = obtain_shard_lock(
            Arc::clone(self.conn()),
            keyspace,
            shard,
            "ReparentShard",
            self.action_timeout(),
        )
        .await?;

        let result = self
            .reparent_shard_locked(keyspace, shard, master_elect_path)
            .await;
        let release = lock.release(&result).await;
        result.and(release)
    }

    async fn reparent_shard_locked(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect_path: &str,
    ) -> OxherdResult<()> {
        let conn = self.conn().as_ref();
        let (shard_info, _) = shards::read_shard(conn, keyspace, shard).await?;
        let tablet_map = shards::tablet_map_for_shard(conn, keyspace, shard).await?;

        let master_elect = read_tablet(conn, master_elect_path).await?;
        let elect_alias = master_elect.alias();
        if !tablet_map.contains_key(&elect_alias) {
            return Err(OxherdError::Aborted(format!(
                "master-elect {elect_alias} not in replication graph of {keyspace}/{shard}"
            )));
        }
        if shard_info.shard.master_alias.as_ref() == Some(&elect_alias) {
            return Err(OxherdError::Aborted(format!(
                "master-elect {elect_alias} is already the shard master"
            )));
        }
        if master_elect.tablet.tablet_type != TabletType::Replica {
            return Err(OxherdError::Aborted(format!(
                "master-elect {elect_alias} is a {}, expected replica",
                master_elect.tablet.tablet_type
            )));
        }

        let old_master = match &shard_info.shard.master_alias {
            Some(alias) => tablet_map.get(alias).cloned(),
            None => None,
        };
        let old_master_live = old_master
            .as_ref()
            .map(|m| m.tablet.tablet_type == TabletType::Master)
            .unwrap_or(false);

        // Step 1: demote, or fall back to the elect's own position when the
        // old master is gone.
        let position = if let (true, Some(master)) = (old_master_live, &old_master) {
            info!(master = %master.alias(), "demoting old master");
            let action_path = self.initiator().demote_master(&master.alias()).await?;
            match self
                .initiator()
                .wait_for_completion_reply(&action_path, self.action_timeout())
                .await?
            {
                ActionReply::Position(p) => p,
                other => {
                    return Err(OxherdError::Internal(format!(
                        "unexpected DemoteMaster reply: {other:?}"
                    )))
                }
            }
        } else {
            warn!("old master gone, using master-elect's slave position");
            let action_path = self.initiator().slave_position(&elect_alias).await?;
            match self
                .initiator()
                .wait_for_completion_reply(&action_path, self.action_timeout())
                .await?
            {
                ActionReply::Position(p) => p,
                other => {
                    return Err(OxherdError::Internal(format!(
                        "unexpected SlavePosition reply: {other:?}"
                    )))
                }
            }
        };

        // Step 2: every slave computes how it would reattach.
        let slaves: Vec<TabletInfo> = tablet_map
            .values()
            .filter(|t| t.tablet.parent.is_some())
            .cloned()
            .collect();
        let bundles = self.gather_restart_data(&slaves, &position).await;

        // Step 3: the master-elect's bundle is canonical.
        if !bundles.contains_key(&elect_alias) {
            return Err(OxherdError::Aborted(format!(
                "master-elect {elect_alias} did not produce restart data; cannot promote"
            )));
        }

        // Step 4: promote. The agent writes the canonical restart data into
        // the shard's scratch path; its pre-existence aborts a re-run.
        let shard_action_path = paths::shard_action_path(keyspace, shard);
        info!(master_elect = %elect_alias, "promoting");
        let action_path = self
            .initiator()
            .promote_slave(&elect_alias, &shard_action_path)
            .await?;
        self.initiator()
            .wait_for_completion(&action_path, self.action_timeout())
            .await?;

        // Step 5: restart everyone else, one task per slave. Individual
        // failures leave stragglers; they are reported, not fatal. The old
        // master goes last: its graph node can only be removed once its
        // slaves have moved out from under it.
        let recorder = Arc::new(AllErrorRecorder::new());
        let restart_targets: Vec<TabletAlias> = slaves
            .iter()
            .map(|t| t.alias())
            .filter(|a| a != &elect_alias)
            .collect();
        let args = RestartSlaveArgs {
            shard_action_path: shard_action_path.clone(),
            restart_slave_data: None,
        };
        let mut tasks = Vec::new();
        for alias in restart_targets {
            let initiator = self.initiator().clone();
            let recorder = Arc::clone(&recorder);
            let args = args.clone();
            let timeout = self.action_timeout();
            tasks.push(tokio::spawn(async move {
                let outcome = match initiator.restart_slave(&alias, args).await {
                    Ok(path) => initiator.wait_for_completion(&path, timeout).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    warn!(slave = %alias, %e, "slave failed to restart, left as straggler");
                    recorder.record_error(e);
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        if let (true, Some(master)) = (old_master_live, &old_master) {
            let alias = master.alias();
            let outcome = match self.initiator().restart_slave(&alias, args.clone()).await {
                Ok(path) => {
                    self.initiator()
                        .wait_for_completion(&path, self.action_timeout())
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(old_master = %alias, %e, "old master failed to reattach");
                recorder.record_error(e);
            }
        }

        // Step 6: rebuild the shard record, then retire the promotion
        // scratch data so a future reparent can run.
        shards::rebuild_shard(conn, keyspace, shard).await?;
        let scratch_path = format!(
            "{shard_action_path}/{}",
            oxherd_agent::actionnode::RESTART_SLAVE_DATA_NODE
        );
        match conn.delete(&scratch_path, None).await {
            Ok(()) | Err(OxherdError::NodeNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match recorder.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fan `ReparentPosition` out to all slaves, one task each, and collect
    /// their restart bundles. Failures are logged; the caller decides
    /// whether the missing entries matter.
    async fn gather_restart_data(
        &self,
        slaves: &[TabletInfo],
        position: &ReplicationPosition,
    ) -> HashMap<TabletAlias, RestartSlaveData> {
        let mut tasks = Vec::new();
        for info in slaves {
            let alias = info.alias();
            let initiator = self.initiator().clone();
            let position = position.clone();
            let timeout = self.action_timeout();
            tasks.push(tokio::spawn(async move {
                let path = match initiator.reparent_position(&alias, &position).await {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(slave = %alias, %e, "could not queue ReparentPosition");
                        return None;
                    }
                };
                match initiator.wait_for_completion_reply(&path, timeout).await {
                    Ok(ActionReply::RestartSlaveData(data)) => Some((alias, data)),
                    Ok(other) => {
                        warn!(slave = %alias, ?other, "unexpected ReparentPosition reply");
                        None
                    }
                    Err(e) => {
                        warn!(slave = %alias, %e, "ReparentPosition failed");
                        None
                    }
                }
            }));
        }

        let mut bundles = HashMap::new();
        for task in tasks {
            if let Ok(Some((alias, data))) = task.await {
                bundles.insert(alias, data);
            }
        }
        bundles
    }
}
