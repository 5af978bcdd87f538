//! A small in-process cluster: in-memory topology plus one running agent
//! (with a scripted MySQL) per tablet.

use std::sync::Arc;

use oxherd_agent::mysql::MysqlDriver;
use oxherd_agent::testing::{FakeManifestFetcher, FakeMysqlDriver};
use oxherd_agent::{records, Agent, ManifestFetcher};
use oxherd_common::{KeyRange, Shard, Tablet, TabletAlias, TabletState, TabletType};
use oxherd_topo::{MemoryTopo, TopoConn};
use oxherd_wrangler::shards::create_shard;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const KEYSPACE: &str = "test_keyspace";
pub const SHARD: &str = "0";

pub struct TabletHandle {
    pub tablet: Tablet,
    pub path: String,
    pub mysql: Arc<FakeMysqlDriver>,
    shutdown: watch::Sender<bool>,
    runner: JoinHandle<()>,
}

impl TabletHandle {
    pub fn alias(&self) -> TabletAlias {
        self.tablet.alias()
    }
}

pub struct Cluster {
    pub topo: MemoryTopo,
    pub conn: Arc<dyn TopoConn>,
    pub fetcher: Arc<FakeManifestFetcher>,
    pub tablets: Vec<TabletHandle>,
}

impl Cluster {
    pub async fn new() -> Self {
        let topo = MemoryTopo::new();
        let conn: Arc<dyn TopoConn> = Arc::new(topo.connect());
        create_shard(
            conn.as_ref(),
            KEYSPACE,
            SHARD,
            Shard {
                key_range: KeyRange::all(),
                ..Default::default()
            },
        )
        .await
        .expect("create shard");
        Cluster {
            topo,
            conn,
            fetcher: Arc::new(FakeManifestFetcher::new()),
            tablets: Vec::new(),
        }
    }

    /// Create a tablet record and start its agent.
    pub async fn add_tablet(
        &mut self,
        uid: u32,
        tablet_type: TabletType,
        parent: Option<&Tablet>,
    ) -> usize {
        let assigned = tablet_type != TabletType::Idle;
        let tablet = Tablet {
            cell: "nyc".into(),
            uid,
            parent: parent.map(Tablet::alias),
            addr: format!("host{uid}:8080"),
            mysql_addr: format!("host{uid}:3306"),
            mysql_ip_addr: format!("10.0.0.{uid}:3306"),
            keyspace: if assigned { KEYSPACE.into() } else { String::new() },
            shard: if assigned { SHARD.into() } else { String::new() },
            tablet_type,
            state: if tablet_type == TabletType::Master {
                TabletState::ReadWrite
            } else {
                TabletState::ReadOnly
            },
            key_range: if assigned {
                KeyRange::all()
            } else {
                KeyRange::default()
            },
        };
        let path = records::create_tablet(self.conn.as_ref(), &tablet)
            .await
            .expect("create tablet");

        let mysql = Arc::new(FakeMysqlDriver::new());
        mysql.set_is_master(tablet_type == TabletType::Master);
        if let Some(parent) = parent {
            mysql.set_master_addr(parent.mysql_addr.clone());
        }

        let agent_conn: Arc<dyn TopoConn> = Arc::new(self.topo.connect());
        let agent = Agent::new(
            agent_conn,
            Arc::clone(&mysql) as Arc<dyn MysqlDriver>,
            Arc::clone(&self.fetcher) as Arc<dyn ManifestFetcher>,
            std::env::temp_dir(),
            tablet.alias(),
        );
        agent.register().await.expect("register agent");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(async move {
            agent.run(shutdown_rx).await.expect("agent loop");
        });

        self.tablets.push(TabletHandle {
            tablet,
            path,
            mysql,
            shutdown,
            runner,
        });
        self.tablets.len() - 1
    }

    pub fn tablet(&self, index: usize) -> &TabletHandle {
        &self.tablets[index]
    }

    pub async fn shutdown(self) {
        for handle in &self.tablets {
            let _ = handle.shutdown.send(true);
        }
        for handle in self.tablets {
            let _ = handle.runner.await;
        }
    }
}
