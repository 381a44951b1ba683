//! Periodic materialization of per-second bucket data to a log writer.
//!
//! Two long-lived threads: an aggregation tick that snapshots every
//! resource node (plus the inbound node) for the seconds that completed
//! since the previous tick, and a flush loop that drains a bounded channel
//! and hands batches to the writer. When the writer falls behind, batches
//! are dropped in favor of fresh data on the next tick.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Once;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::TrySendError;
use std::thread;
use std::time::Duration;

use crate::chain::panic_message;
use crate::clock;
use crate::config;
use crate::metric_item::MetricItem;
use crate::node;

/// Batches keyed by second-aligned timestamp; iteration order is ascending,
/// which is exactly the order the writer must see.
pub type MetricTimeMap = BTreeMap<u64, Vec<MetricItem>>;

/// Sink for aggregated metric batches. Items handed to one call share the
/// timestamp; successive calls within a batch carry ascending timestamps.
pub trait MetricLogWriter: Send + 'static {
    fn write(&mut self, timestamp: u64, items: &[MetricItem]) -> std::io::Result<()>;
}

const LOG_FLUSH_QUEUE_SIZE: usize = 60;

/// Collects finished seconds from the node registry, each at most once.
#[derive(Debug)]
pub(crate) struct Aggregator {
    last_fetch_millis: i64,
}

impl Aggregator {
    pub(crate) fn new() -> Self {
        Self {
            last_fetch_millis: -1,
        }
    }

    /// Snapshot every active item with a start in
    /// `[last_fetch, current second)`, then advance the fetch watermark so
    /// no second is ever published twice.
    pub(crate) fn aggregate(&mut self, now: u64) -> MetricTimeMap {
        let cur_sec_start = (now - now % 1000) as i64;
        if cur_sec_start <= self.last_fetch_millis {
            return BTreeMap::new();
        }
        let last_fetch = self.last_fetch_millis;

        let mut nodes = node::resource_node_list();
        if let Some(inbound) = node::inbound_node() {
            nodes.push(inbound);
        }

        let mut map: MetricTimeMap = BTreeMap::new();
        for n in nodes {
            let items = n.metrics_on_condition(|ts| {
                ts as i64 >= last_fetch && (ts as i64) < cur_sec_start
            });
            for item in items {
                if item.is_active() {
                    map.entry(item.timestamp).or_default().push(item);
                }
            }
        }

        self.last_fetch_millis = cur_sec_start;
        map
    }
}

static INIT: Once = Once::new();

/// Start the aggregation and flush tasks, once per process.
///
/// A zero flush interval disables the whole pipeline. Repeated calls are
/// no-ops, matching the process-wide node registry the tasks walk.
pub fn init_task(writer: Box<dyn MetricLogWriter>) {
    INIT.call_once(move || {
        let flush_interval_sec = config::global().metric_log_flush_interval_sec;
        if flush_interval_sec == 0 {
            return;
        }

        let (tx, rx) = mpsc::sync_channel::<MetricTimeMap>(LOG_FLUSH_QUEUE_SIZE);

        let spawned = thread::Builder::new()
            .name("flowgate-metric-flush".into())
            .spawn(move || run_with_recover("metric flush", || write_task_loop(rx, writer)));
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn metric flush thread");
            return;
        }

        let spawned = thread::Builder::new()
            .name("flowgate-metric-agg".into())
            .spawn(move || {
                run_with_recover("metric aggregation", || {
                    let mut aggregator = Aggregator::new();
                    loop {
                        thread::sleep(Duration::from_secs(flush_interval_sec as u64));
                        let batch = aggregator.aggregate(clock::now_millis());
                        if batch.is_empty() {
                            continue;
                        }
                        match tx.try_send(batch) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                tracing::warn!("metric log writer is behind, dropping batch");
                            }
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                });
            });
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn metric aggregation thread");
        }
    });
}

fn write_task_loop(rx: Receiver<MetricTimeMap>, mut writer: Box<dyn MetricLogWriter>) {
    for batch in rx.iter() {
        for (timestamp, items) in &batch {
            if let Err(err) = writer.write(*timestamp, items) {
                tracing::error!(%err, timestamp, "failed to write metric batch");
            }
        }
    }
}

fn run_with_recover(task_name: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            task = task_name,
            panic = %panic_message(payload),
            "background task panicked"
        );
    }
}
