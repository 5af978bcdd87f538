//! The subscriber-facing streaming service.
//!
//! Each subscriber gets its own reader -> decoder -> parser pipeline. The
//! server keeps a registry of live sessions for the throttle ticker, which
//! periodically compares aggregate DML throughput to the configured ceiling
//! and assigns proportional sleep time to the over-budget subscribers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oxherd_common::KeyRange;
use oxherd_errors::{OxherdError, OxherdResult};
use oxherd_util::Lifecycle;
use parking_lot::Mutex;
use replication_position::decode_position;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::decoder::TextDecoder;
use crate::events::BinlogRecord;
use crate::parser::{send_stream_error, ApplyMonitor, BinlogParser, ParserConfig};
use crate::reader::BinlogReader;

/// A subscription request, as received over RPC.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StreamRequest {
    /// Opaque encoded start coordinate.
    pub start_position: String,
    /// Hex bounds of the subscriber's key range.
    pub keyspace_start: String,
    pub keyspace_end: String,
}

pub struct BinlogServerConfig {
    pub binlog_prefix: PathBuf,
    /// Required to serve subscriptions whose start position names a relay
    /// log.
    pub relay_log_prefix: Option<PathBuf>,
    /// Database whose statements are streamed; empty matches everything.
    pub dbname: String,
    /// Total DML/sec budget across subscribers; 0 disables throttling.
    pub throttle_rate: f64,
    pub throttle_tick: Duration,
    pub decoder: TextDecoder,
    /// Reader tuning, mostly for tests.
    pub log_wait_timeout: Duration,
    pub max_wait_timeout: Duration,
}

impl Default for BinlogServerConfig {
    fn default() -> Self {
        BinlogServerConfig {
            binlog_prefix: PathBuf::new(),
            relay_log_prefix: None,
            dbname: String::new(),
            throttle_rate: 0.0,
            throttle_tick: Duration::from_secs(60),
            decoder: TextDecoder::Passthrough,
            log_wait_timeout: Duration::from_secs(5),
            max_wait_timeout: Duration::from_secs(3600),
        }
    }
}

struct Subscriber {
    keyrange_tag: String,
    dml_count: Arc<AtomicU64>,
    last_dml_count: AtomicU64,
    sleep_ms: Arc<AtomicU64>,
}

/// Serves keyspace-filtered binlog streams to subscribers.
pub struct BinlogServer {
    config: BinlogServerConfig,
    lifecycle: Lifecycle,
    clients: Arc<Mutex<Vec<Arc<Subscriber>>>>,
    apply_monitor: Option<Arc<dyn ApplyMonitor>>,
}

impl BinlogServer {
    pub fn new(config: BinlogServerConfig, lifecycle: Lifecycle) -> Self {
        BinlogServer {
            config,
            lifecycle,
            clients: Arc::new(Mutex::new(Vec::new())),
            apply_monitor: None,
        }
    }

    /// Needed for relay-log subscriptions: how to observe local apply
    /// progress.
    pub fn with_apply_monitor(mut self, monitor: Arc<dyn ApplyMonitor>) -> Self {
        self.apply_monitor = Some(monitor);
        self
    }

    fn validate_request(request: &StreamRequest) -> OxherdResult<()> {
        if request.start_position.is_empty() {
            return Err(OxherdError::Aborted(
                "invalid request: empty start position".into(),
            ));
        }
        if request.keyspace_start.is_empty() && request.keyspace_end.is_empty() {
            return Err(OxherdError::Aborted(
                "invalid request: no keyspace range".into(),
            ));
        }
        Ok(())
    }

    /// Serve one subscription until the input ends, the subscriber goes
    /// away, or parsing fails. A parse failure is delivered to the
    /// subscriber as a terminal error record before this returns.
    pub async fn serve_binlog(
        &self,
        request: StreamRequest,
        sender: mpsc::Sender<BinlogRecord>,
    ) -> OxherdResult<()> {
        let Some(_work) = self.lifecycle.start_work() else {
            return Err(OxherdError::Aborted("server is shutting down".into()));
        };
        Self::validate_request(&request)?;

        let start = decode_position(&request.start_position)?;
        let key_range = KeyRange::from_hex(&request.keyspace_start, &request.keyspace_end)?;
        info!(
            start = %start,
            range = %key_range,
            "starting binlog stream"
        );

        let using_relay_logs = start.uses_relay_logs();
        let (prefix, filename, offset) = if using_relay_logs {
            let prefix = self.config.relay_log_prefix.clone().ok_or_else(|| {
                OxherdError::Aborted("relay-log streaming is not configured".into())
            })?;
            let relay = start.relay_filename.clone().unwrap_or_default();
            let leaf = relay.rsplit('/').next().unwrap_or(&relay).to_owned();
            (prefix, leaf, start.relay_offset)
        } else {
            (
                self.config.binlog_prefix.clone(),
                start.master_filename.clone(),
                start.master_offset,
            )
        };

        let mut parser = BinlogParser::new(ParserConfig {
            dbname: self.config.dbname.clone(),
            key_range: key_range.clone(),
            start_position: start,
            using_relay_logs,
        });
        if using_relay_logs {
            let monitor = self.apply_monitor.clone().ok_or_else(|| {
                OxherdError::Aborted("relay-log streaming needs an apply monitor".into())
            })?;
            parser = parser.with_apply_monitor(monitor);
        }

        let (dml_count, _txn_count, sleep_ms) = parser.throttle_handles();
        let subscriber = Arc::new(Subscriber {
            keyrange_tag: key_range.tag(),
            dml_count,
            last_dml_count: AtomicU64::new(0),
            sleep_ms,
        });
        self.clients.lock().push(Arc::clone(&subscriber));

        // reader -> (decoder) -> parser, over an in-process pipe.
        let (mut pipe_writer, pipe_reader) = tokio::io::duplex(64 * 1024);
        let mut reader = BinlogReader::new(prefix);
        reader.log_wait_timeout = self.config.log_wait_timeout;
        reader.max_wait_timeout = self.config.max_wait_timeout;
        let (start_tx, start_rx) = tokio::sync::oneshot::channel();
        let reader_task = tokio::spawn(async move {
            match reader.start(&mut pipe_writer, &filename, offset).await {
                Ok(session) => {
                    // Sideband: how many replayed preamble bytes precede
                    // the live stream.
                    let _ = start_tx.send(Ok(session.replayed_prefix));
                    if let Err(e) = reader.serve(session, &mut pipe_writer).await {
                        warn!(%e, "binlog reader stopped");
                    }
                }
                Err(e) => {
                    let _ = start_tx.send(Err(e));
                }
            }
        });
        match start_rx.await {
            Ok(Ok(replayed_prefix)) => info!(replayed_prefix, "binlog reader started"),
            Ok(Err(e)) => {
                self.clients
                    .lock()
                    .retain(|c| !Arc::ptr_eq(c, &subscriber));
                return Err(e);
            }
            Err(_) => {
                self.clients
                    .lock()
                    .retain(|c| !Arc::ptr_eq(c, &subscriber));
                return Err(OxherdError::Internal("binlog reader vanished".into()));
            }
        }

        let result = match self.config.decoder.attach(pipe_reader) {
            Ok(decoded) => {
                parser
                    .parse_binlog_stream(BufReader::new(decoded), &sender)
                    .await
            }
            Err(e) => Err(e),
        };

        reader_task.abort();
        let mut clients = self.clients.lock();
        clients.retain(|c| !Arc::ptr_eq(c, &subscriber));
        drop(clients);

        if let Err(e) = &result {
            warn!(%e, "stream terminated with error");
            send_stream_error(&sender, e, parser.current_position()).await;
        }
        result
    }

    /// Spawn the fair-share throttle ticker. Runs until shutdown begins.
    pub fn start_throttle_ticker(&self) -> JoinHandle<()> {
        let clients = Arc::clone(&self.clients);
        let rate = self.config.throttle_rate;
        let tick = self.config.throttle_tick;
        let mut shutdown = self.lifecycle.shutdown_signal();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => return,
                }
                throttle_once(&clients, rate, tick);
            }
        })
    }
}

/// One throttle pass: compute per-subscriber DML rates over the last tick
/// and hand each over-budget subscriber a proportional sleep.
fn throttle_once(clients: &Mutex<Vec<Arc<Subscriber>>>, rate: f64, tick: Duration) {
    let clients = clients.lock();
    if clients.is_empty() {
        return;
    }
    // Throttling off: clear any leftover sleep assignments.
    if rate <= 0.0 {
        for client in clients.iter() {
            client.sleep_ms.store(0, Ordering::Relaxed);
        }
        return;
    }

    let tick_secs = tick.as_secs_f64().max(f64::EPSILON);
    let mut qps = Vec::with_capacity(clients.len());
    let mut total_qps = 0.0;
    for client in clients.iter() {
        let current = client.dml_count.load(Ordering::Relaxed);
        let last = client.last_dml_count.swap(current, Ordering::Relaxed);
        let client_qps = (current.saturating_sub(last)) as f64 / tick_secs;
        total_qps += client_qps;
        qps.push(client_qps);
    }

    if total_qps <= rate {
        for client in clients.iter() {
            client.sleep_ms.store(0, Ordering::Relaxed);
        }
        return;
    }

    let max_per_client = rate / clients.len() as f64;
    for (client, client_qps) in clients.iter().zip(qps) {
        if client_qps > max_per_client {
            let sleep_secs = tick_secs * ((client_qps - max_per_client) / client_qps);
            let sleep_ms = (sleep_secs * 1000.0) as u64;
            info!(
                keyrange = %client.keyrange_tag,
                client_qps,
                max_per_client,
                sleep_ms,
                "throttling subscriber"
            );
            client.sleep_ms.store(sleep_ms, Ordering::Relaxed);
        } else {
            client.sleep_ms.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(tag: &str) -> Arc<Subscriber> {
        Arc::new(Subscriber {
            keyrange_tag: tag.into(),
            dml_count: Arc::new(AtomicU64::new(0)),
            last_dml_count: AtomicU64::new(0),
            sleep_ms: Arc::new(AtomicU64::new(0)),
        })
    }

    #[test]
    fn over_budget_subscribers_get_proportional_sleep() {
        let clients = Mutex::new(vec![subscriber("80"), subscriber("MAX_KEY")]);
        let tick = Duration::from_secs(10);

        // 100 qps and 10 qps against a total budget of 40 (20 each).
        clients.lock()[0].dml_count.store(1000, Ordering::Relaxed);
        clients.lock()[1].dml_count.store(100, Ordering::Relaxed);
        throttle_once(&clients, 40.0, tick);

        let hot = clients.lock()[0].sleep_ms.load(Ordering::Relaxed);
        let cold = clients.lock()[1].sleep_ms.load(Ordering::Relaxed);
        // 10s * (100-20)/100 = 8s for the hot one; the cold one is within
        // its share.
        assert_eq!(hot, 8000);
        assert_eq!(cold, 0);
    }

    #[test]
    fn under_budget_total_clears_sleeps() {
        let clients = Mutex::new(vec![subscriber("80")]);
        let tick = Duration::from_secs(10);
        clients.lock()[0].dml_count.store(100, Ordering::Relaxed);
        clients.lock()[0].sleep_ms.store(500, Ordering::Relaxed);
        throttle_once(&clients, 40.0, tick);
        assert_eq!(clients.lock()[0].sleep_ms.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn requests_missing_fields_are_rejected() {
        assert!(BinlogServer::validate_request(&StreamRequest::default()).is_err());
        assert!(BinlogServer::validate_request(&StreamRequest {
            start_position: "abc".into(),
            ..Default::default()
        })
        .is_err());
        BinlogServer::validate_request(&StreamRequest {
            start_position: "abc".into(),
            keyspace_start: "80".into(),
            keyspace_end: String::new(),
        })
        .unwrap();
    }
}
