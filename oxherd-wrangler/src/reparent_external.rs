//! Externally triggered reparents: some other system already promoted a
//! new master, and we reconcile topology with that fact.
//!
//! There is no rollback here. Once `SlaveWasPromoted` confirms the new
//! master, per-tablet reattach failures are accumulated and reported; the
//! external actor has already made the change authoritative.

use std::collections::HashMap;
use std::sync::Arc;

use oxherd_agent::actionnode::SlaveWasRestartedArgs;
use oxherd_agent::records::{read_tablet, TabletInfo};
use oxherd_common::TabletAlias;
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_util::{AllErrorRecorder, ErrorRecorder};
use tracing::info;

use crate::lock::obtain_shard_lock;
use crate::shards;
use crate::wrangler::Wrangler;

impl Wrangler {
    pub async fn shard_externally_reparented(
        &self,
        keyspace: &str,
        shard: &str,
        master_elect_path: &str,
        scrap_stragglers: bool,
    ) -> OxherdResult<()> {
        let conn = self.conn().as_ref();
        let (shard_info, _) = shards::read_shard(conn, keyspace, shard).await?;
        let tablet_map = shards::tablet_map_for_shard(conn, keyspace, shard).await?;
        let (mut slave_map, old_master) = shards::slave_tablet_map(&tablet_map)?;

        let master_elect = read_tablet(conn, master_elect_path).await?;
        let elect_alias = master_elect.alias();
        if shard_info.shard.master_alias.as_ref() == Some(&elect_alias) {
            return Err(OxherdError::Aborted(format!(
                "master-elect tablet {elect_alias} is already master"
            )));
        }
        if !tablet_map.contains_key(&elect_alias) {
            return Err(OxherdError::Aborted(format!(
                "master-elect tablet {elect_alias} not found in replication graph {keyspace}/{shard}"
            )));
        }

        let lock = obtain_shard_lock(
            Arc::clone(self.conn()),
            keyspace,
            shard,
            "ShardExternallyReparented",
            self.action_timeout(),
        )
        .await?;

        info!(master_elect = %elect_alias, "starting externally triggered reparent");
        slave_map.remove(&elect_alias);
        let result = self
            .reparent_shard_external(keyspace, shard, &slave_map, old_master, &master_elect, scrap_stragglers)
            .await;
        if result.is_ok() {
            info!("externally triggered reparent finished");
        }
        let release = lock.release(&result).await;
        result.and(release)
    }

    async fn reparent_shard_external(
        &self,
        keyspace: &str,
        shard: &str,
        slave_map: &HashMap<TabletAlias, TabletInfo>,
        old_master: Option<TabletInfo>,
        master_elect: &TabletInfo,
        scrap_stragglers: bool,
    ) -> OxherdResult<()> {
        // Fix the new master in the replication graph first. If this fails
        // the master-elect is probably dead, which is as bad as it gets.
        let action_path = self
            .initiator()
            .slave_was_promoted(&master_elect.alias())
            .await?;
        self.initiator()
            .wait_for_completion(&action_path, self.action_timeout())
            .await
            .map_err(|e| {
                OxherdError::Aborted(format!(
                    "SlaveWasPromoted failed on {}: {e}",
                    master_elect.alias()
                ))
            })?;

        // Then fix all the slaves in parallel, and the old master once
        // they are done.
        self.restart_slaves_external(slave_map, old_master, master_elect, scrap_stragglers)
            .await?;

        // And recompute the shard record.
        info!("rebuilding shard serving data");
        shards::rebuild_shard(self.conn().as_ref(), keyspace, shard).await?;
        Ok(())
    }

    async fn restart_slaves_external(
        &self,
        slave_map: &HashMap<TabletAlias, TabletInfo>,
        old_master: Option<TabletInfo>,
        master_elect: &TabletInfo,
        scrap_stragglers: bool,
    ) -> OxherdResult<()> {
        let recorder = Arc::new(AllErrorRecorder::new());
        let args = SlaveWasRestartedArgs {
            parent: master_elect.alias(),
            expected_master_addr: master_elect.tablet.mysql_addr.clone(),
            expected_master_ip_addr: master_elect.tablet.mysql_ip_addr.clone(),
            scrap_stragglers,
        };

        // One task per slave; each queues its action and waits for the
        // terminal record on its own.
        let mut tasks = Vec::new();
        for info in slave_map.values() {
            let alias = info.alias();
            let initiator = self.initiator().clone();
            let recorder = Arc::clone(&recorder);
            let args = args.clone();
            let timeout = self.action_timeout();
            tasks.push(tokio::spawn(async move {
                info!(slave = %alias, "slave was restarted");
                let outcome = match initiator.slave_was_restarted(&alias, args).await {
                    Ok(path) => initiator.wait_for_completion(&path, timeout).await,
                    Err(e) => Err(e),
                };
                recorder.record(outcome);
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        // Then the old master, whose graph node can only be removed once
        // its slaves have moved out from under it.
        if let Some(master) = &old_master {
            let alias = master.alias();
            info!(old_master = %alias, "slave was restarted");
            let outcome = match self
                .initiator()
                .slave_was_restarted(&alias, args.clone())
                .await
            {
                Ok(path) => {
                    self.initiator()
                        .wait_for_completion(&path, self.action_timeout())
                        .await
                }
                Err(e) => Err(e),
            };
            recorder.record(outcome);
        }

        match recorder.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
