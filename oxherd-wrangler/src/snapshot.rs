//! Snapshot and restore flows.
//!
//! Snapshotting detaches a tablet into the backup role, runs the dump
//! through its agent, and puts it back. Restoring points a fresh tablet at
//! a source's manifest; the agent does the copy and files the tablet into
//! the source's shard as a spare.

use oxherd_agent::actionnode::{
    ActionReply, PartialSnapshotArgs, RestoreArgs, SnapshotArgs, SnapshotReply,
    SnapshotSourceEndArgs,
};
use oxherd_agent::records::read_tablet;
use oxherd_common::{KeyRange, TabletType};
use oxherd_errors::{OxherdError, OxherdResult};
use tracing::info;

use crate::wrangler::Wrangler;

impl Wrangler {
    /// Take a full snapshot of `tablet_path`. The tablet is moved to the
    /// backup role for the duration and returned to its old role after.
    pub async fn snapshot(
        &self,
        tablet_path: &str,
        concurrency: usize,
    ) -> OxherdResult<SnapshotReply> {
        self.run_snapshot(tablet_path, |wrangler, alias| {
            let initiator = wrangler.initiator().clone();
            let alias = alias.clone();
            async move {
                initiator
                    .snapshot(&alias, SnapshotArgs { concurrency })
                    .await
            }
        })
        .await
    }

    /// Take a key-range-restricted snapshot of `tablet_path`.
    pub async fn partial_snapshot(
        &self,
        tablet_path: &str,
        key_name: &str,
        key_range: KeyRange,
        concurrency: usize,
    ) -> OxherdResult<SnapshotReply> {
        let key_name = key_name.to_owned();
        self.run_snapshot(tablet_path, move |wrangler, alias| {
            let initiator = wrangler.initiator().clone();
            let alias = alias.clone();
            let args = PartialSnapshotArgs {
                key_name: key_name.clone(),
                key_range: key_range.clone(),
                concurrency,
            };
            async move { initiator.partial_snapshot(&alias, args).await }
        })
        .await
    }

    async fn run_snapshot<F, Fut>(
        &self,
        tablet_path: &str,
        start_action: F,
    ) -> OxherdResult<SnapshotReply>
    where
        F: FnOnce(&Wrangler, &oxherd_common::TabletAlias) -> Fut,
        Fut: std::future::Future<Output = OxherdResult<String>>,
    {
        let info = read_tablet(self.conn().as_ref(), tablet_path).await?;
        let original_type = info.tablet.tablet_type;
        if !matches!(
            original_type,
            TabletType::Replica | TabletType::Rdonly | TabletType::Spare | TabletType::Batch
        ) {
            return Err(OxherdError::Aborted(format!(
                "cannot snapshot from a {original_type} tablet: {tablet_path}"
            )));
        }

        self.change_type(tablet_path, TabletType::Backup, false)
            .await?;
        info!(%tablet_path, "tablet detached for snapshot");

        let alias = info.alias();
        let result = match start_action(self, &alias).await {
            Ok(action_path) => {
                self.initiator()
                    .wait_for_completion_reply(&action_path, self.action_timeout())
                    .await
            }
            Err(e) => Err(e),
        };

        // Put the tablet back whatever the snapshot did.
        self.change_type(tablet_path, original_type, false).await?;

        match result? {
            ActionReply::Snapshot(reply) => Ok(reply),
            other => Err(OxherdError::Internal(format!(
                "unexpected snapshot reply: {other:?}"
            ))),
        }
    }

    /// Tell a snapshot source to resume normal service.
    pub async fn snapshot_source_end(
        &self,
        tablet_path: &str,
        slave_start_required: bool,
        read_only: bool,
    ) -> OxherdResult<()> {
        let info = read_tablet(self.conn().as_ref(), tablet_path).await?;
        let action_path = self
            .initiator()
            .snapshot_source_end(
                &info.alias(),
                SnapshotSourceEndArgs {
                    slave_start_required,
                    read_only,
                },
            )
            .await?;
        self.initiator()
            .wait_for_completion(&action_path, self.action_timeout())
            .await
    }

    /// Restore a snapshot onto `dst_tablet_path`. The destination must be
    /// idle or already in the restore role; the agent files it into the
    /// source's shard as a spare.
    pub async fn restore(
        &self,
        src_tablet_path: &str,
        src_file_path: &str,
        dst_tablet_path: &str,
        parent_path: &str,
        partial: bool,
    ) -> OxherdResult<()> {
        let dst = read_tablet(self.conn().as_ref(), dst_tablet_path).await?;
        match dst.tablet.tablet_type {
            TabletType::Idle => {
                self.change_type(dst_tablet_path, TabletType::Restore, false)
                    .await?;
            }
            TabletType::Restore => {}
            other => {
                return Err(OxherdError::Aborted(format!(
                    "restore destination must be idle or restore, not {other}: {dst_tablet_path}"
                )));
            }
        }

        let args = RestoreArgs {
            src_tablet_path: src_tablet_path.to_owned(),
            src_file_path: src_file_path.to_owned(),
            parent_path: parent_path.to_owned(),
        };
        let dst_alias = dst.alias();
        let action_path = if partial {
            self.initiator().partial_restore(&dst_alias, args).await?
        } else {
            self.initiator().restore(&dst_alias, args).await?
        };
        self.initiator()
            .wait_for_completion(&action_path, self.action_timeout())
            .await
    }
}
