//! Post-response bookkeeping
//!
//! The pipeline hands each finished exchange to a single worker over a
//! channel. The worker owns the access log, feeds the stats store and, when
//! configured to, saves the counters after every request. On shutdown the
//! worker drains whatever is still queued before the final save.

use crate::access_log::{AccessLogEntry, AccessLogger};
use crate::stats::{StatsStore, Visit};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// When the counters are written to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// After every request
    EveryRequest,
    /// On a timer; a crash loses at most one interval of updates
    Interval(Duration),
}

impl SavePolicy {
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::EveryRequest
        } else {
            Self::Interval(Duration::from_secs(secs))
        }
    }
}

/// A finished exchange
#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub entry: AccessLogEntry,
    /// `ref` query parameter, empty when absent
    pub ref_param: String,
}

impl TrafficRecord {
    fn visit(&self) -> Visit {
        Visit {
            path: self.entry.path.clone(),
            referrer: self.entry.referrer.clone(),
            ref_param: self.ref_param.clone(),
            bytes: self.entry.bytes,
        }
    }
}

enum TrafficEvent {
    Record(Box<TrafficRecord>),
    Shutdown,
}

/// Cheap handle used by request tasks to report finished exchanges
#[derive(Clone)]
pub struct TrafficHandle {
    tx: mpsc::UnboundedSender<TrafficEvent>,
}

impl TrafficHandle {
    /// Queue a record. Never blocks.
    pub fn record(&self, record: TrafficRecord) {
        if self.tx.send(TrafficEvent::Record(Box::new(record))).is_err() {
            warn!("Traffic worker has stopped; dropping record");
        }
    }
}

/// The worker task and the means to stop it
pub struct TrafficWorker {
    tx: mpsc::UnboundedSender<TrafficEvent>,
    worker: JoinHandle<()>,
    saver: Option<JoinHandle<()>>,
}

impl TrafficWorker {
    /// Start the worker. `access_log` of `None` disables the access log.
    pub fn spawn(
        stats: Arc<StatsStore>,
        access_log: Option<AccessLogger>,
        policy: SavePolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_stats = stats.clone();
        let worker = tokio::task::spawn_blocking(move || {
            run_worker(rx, worker_stats, access_log, policy);
        });

        let saver = match policy {
            SavePolicy::EveryRequest => None,
            SavePolicy::Interval(period) => Some(tokio::spawn(periodic_save(stats, period))),
        };

        Self { tx, worker, saver }
    }

    pub fn handle(&self) -> TrafficHandle {
        TrafficHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting records, process everything already queued, save.
    pub async fn shutdown(self) {
        if let Some(saver) = self.saver {
            saver.abort();
        }
        let _ = self.tx.send(TrafficEvent::Shutdown);
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Traffic worker failed: {}", e);
        }
    }
}

fn run_worker(
    mut rx: mpsc::UnboundedReceiver<TrafficEvent>,
    stats: Arc<StatsStore>,
    mut access_log: Option<AccessLogger>,
    policy: SavePolicy,
) {
    let mut process = |record: &TrafficRecord| {
        if let Some(log) = access_log.as_mut() {
            if let Err(e) = log.write(&record.entry) {
                warn!("Failed to write access log {}: {}", log.path().display(), e);
            }
        }
        stats.record_request(&record.visit());
        if policy == SavePolicy::EveryRequest {
            if let Err(e) = stats.save() {
                // counters stay correct in memory; the next save retries
                error!("Failed to save stats: {}", e);
            }
        }
    };

    while let Some(event) = rx.blocking_recv() {
        match event {
            TrafficEvent::Record(record) => process(&record),
            TrafficEvent::Shutdown => {
                rx.close();
                let mut drained = 0usize;
                while let Some(event) = rx.blocking_recv() {
                    if let TrafficEvent::Record(record) = event {
                        process(&record);
                        drained += 1;
                    }
                }
                debug!("Drained {} queued traffic records", drained);
                break;
            }
        }
    }

    match stats.save() {
        Ok(()) => info!("Saved stats to {}", stats.path().display()),
        Err(e) => error!("Failed to save stats on shutdown: {}", e),
    }
}

async fn periodic_save(stats: Arc<StatsStore>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = stats.clone();
        match tokio::task::spawn_blocking(move || stats.save()).await {
            Ok(Ok(())) => debug!("Periodic stats save complete"),
            Ok(Err(e)) => error!("Failed to save stats: {}", e),
            Err(e) => error!("Stats save task failed: {}", e),
        }
    }
}
