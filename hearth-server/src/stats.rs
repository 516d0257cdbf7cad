//! Persistent traffic statistics

use hearth_common::{CountEntry, StatsReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Characters of a referrer shown in listings
pub const DISPLAY_WIDTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt stats file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode stats: {0}")]
    Encode(serde_json::Error),
}

/// On-disk layout of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(rename = "Paths", default, deserialize_with = "nullable_map")]
    pub paths: HashMap<String, u64>,

    #[serde(rename = "Referers", default, deserialize_with = "nullable_map")]
    pub referrers: HashMap<String, u64>,

    #[serde(rename = "Bytes", default)]
    pub bytes: u64,

    #[serde(rename = "Requests", default)]
    pub requests: u64,
}

fn nullable_map<'de, D>(deserializer: D) -> Result<HashMap<String, u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<HashMap<String, u64>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// One completed request, as far as the counters are concerned
#[derive(Debug, Clone, Default)]
pub struct Visit {
    pub path: String,
    /// `Referer` header, empty when absent
    pub referrer: String,
    /// `ref` query parameter, empty when absent
    pub ref_param: String,
    pub bytes: u64,
}

/// Decides which paths stay out of the per-path and per-referrer tables
pub struct ExclusionPolicy(Box<dyn Fn(&str) -> bool + Send + Sync>);

impl ExclusionPolicy {
    pub fn none() -> Self {
        Self(Box::new(|_| false))
    }

    /// Exclude paths containing any of `needles`
    pub fn substrings(needles: Vec<String>) -> Self {
        Self::custom(move |path| {
            needles.iter().any(|n| !n.is_empty() && path.contains(n.as_str()))
        })
    }

    pub fn custom(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Box::new(predicate))
    }

    pub fn excludes(&self, path: &str) -> bool {
        (self.0)(path)
    }
}

impl fmt::Debug for ExclusionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExclusionPolicy(..)")
    }
}

#[derive(Debug, Default)]
struct Counters {
    persisted: StatsSnapshot,
    session_bytes: u64,
    session_requests: u64,
}

/// A path and its visit count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCount {
    pub name: String,
    pub count: u64,
}

/// A referrer and its visit count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefererCount {
    pub name: String,
    pub count: u64,
}

impl RefererCount {
    /// The referrer cut to [`DISPLAY_WIDTH`] characters
    pub fn trimmed(&self) -> String {
        self.name.chars().take(DISPLAY_WIDTH).collect()
    }
}

impl From<PathCount> for CountEntry {
    fn from(p: PathCount) -> Self {
        CountEntry {
            name: p.name,
            count: p.count,
        }
    }
}

impl From<RefererCount> for CountEntry {
    fn from(r: RefererCount) -> Self {
        CountEntry {
            name: r.trimmed(),
            count: r.count,
        }
    }
}

/// Process-wide traffic counters backed by a JSON file.
///
/// Every counter update and every save snapshot happens under `counters`.
/// `save_lock` additionally serializes file writes so that an older snapshot
/// can never replace a newer one on disk.
#[derive(Debug)]
pub struct StatsStore {
    path: PathBuf,
    exclusion: ExclusionPolicy,
    counters: Mutex<Counters>,
    save_lock: Mutex<()>,
    started: Instant,
}

impl StatsStore {
    /// Load the counters at `path`, creating an empty file when missing.
    ///
    /// Undecodable content is an error; callers treat it as fatal rather
    /// than starting over from zero.
    pub fn open(path: impl Into<PathBuf>, exclusion: ExclusionPolicy) -> Result<Self, StatsError> {
        let path = path.into();
        let store = Self {
            exclusion,
            counters: Mutex::new(Counters::default()),
            save_lock: Mutex::new(()),
            started: Instant::now(),
            path,
        };

        match std::fs::read(&store.path) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => {
                debug!("Stats file {} is empty", store.path.display());
            }
            Ok(raw) => {
                let snapshot: StatsSnapshot =
                    serde_json::from_slice(&raw).map_err(|source| StatsError::Corrupt {
                        path: store.path.clone(),
                        source,
                    })?;
                info!(
                    "Loaded stats from {}: {} requests, {} paths",
                    store.path.display(),
                    snapshot.requests,
                    snapshot.paths.len()
                );
                store.lock().persisted = snapshot;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating stats file {}", store.path.display());
                store.save()?;
            }
            Err(source) => {
                return Err(StatsError::Io {
                    path: store.path,
                    source,
                })
            }
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked mid-update
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one completed request.
    pub fn record_request(&self, visit: &Visit) {
        let counted = !self.exclusion.excludes(&visit.path);
        let mut counters = self.lock();
        let persisted = &mut counters.persisted;

        if counted {
            *persisted.paths.entry(visit.path.clone()).or_insert(0) += 1;
            if !visit.referrer.is_empty() {
                *persisted.referrers.entry(visit.referrer.clone()).or_insert(0) += 1;
            }
            if !visit.ref_param.is_empty() {
                *persisted.referrers.entry(visit.ref_param.clone()).or_insert(0) += 1;
            }
        }
        persisted.bytes = persisted.bytes.saturating_add(visit.bytes);
        persisted.requests = persisted.requests.saturating_add(1);

        counters.session_bytes = counters.session_bytes.saturating_add(visit.bytes);
        counters.session_requests = counters.session_requests.saturating_add(1);
    }

    /// Write the counters to disk.
    ///
    /// The file is written next to the target and renamed over it, so a
    /// reader sees either the previous or the new contents in full.
    pub fn save(&self) -> Result<(), StatsError> {
        let _saving = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());

        let encoded = {
            let counters = self.lock();
            serde_json::to_vec_pretty(&counters.persisted)
        }
        .map_err(StatsError::Encode)?;

        let io_err = |source: std::io::Error| StatsError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = temp_path(&self.path);
        {
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&encoded).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Copy of the persisted counters
    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().persisted.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Bytes and requests served since this store was opened
    pub fn session_totals(&self) -> (u64, u64) {
        let counters = self.lock();
        (counters.session_bytes, counters.session_requests)
    }

    /// Paths, most visited first. Order among equal counts is unspecified.
    pub fn sorted_paths(&self) -> Vec<PathCount> {
        ranked(&self.lock().persisted.paths)
            .map(|(name, count)| PathCount { name, count })
            .collect()
    }

    /// Referrers, most frequent first. Order among equal counts is unspecified.
    pub fn sorted_referrers(&self) -> Vec<RefererCount> {
        ranked(&self.lock().persisted.referrers)
            .map(|(name, count)| RefererCount { name, count })
            .collect()
    }

    /// Totals plus the top `limit` paths and referrers, most counted first.
    ///
    /// Everything is read under one lock, so the tables always add up with
    /// the totals beside them. Order among equal counts is unspecified.
    pub fn report(&self, limit: usize) -> StatsReport {
        let uptime = self.uptime().as_secs_f64();
        let counters = self.lock();
        let persisted = &counters.persisted;

        StatsReport {
            total_requests: persisted.requests,
            total_bytes: persisted.bytes,
            session_requests: counters.session_requests,
            session_bytes: counters.session_bytes,
            requests_per_second: if uptime > 0.0 {
                counters.session_requests as f64 / uptime
            } else {
                0.0
            },
            paths: ranked(&persisted.paths)
                .take(limit)
                .map(|(name, count)| PathCount { name, count }.into())
                .collect(),
            referrers: ranked(&persisted.referrers)
                .take(limit)
                .map(|(name, count)| RefererCount { name, count }.into())
                .collect(),
        }
    }
}

/// Entries of `counts`, highest first
fn ranked(counts: &HashMap<String, u64>) -> impl Iterator<Item = (String, u64)> {
    let mut list: Vec<(String, u64)> = counts
        .iter()
        .map(|(name, &count)| (name.clone(), count))
        .collect();
    list.sort_by(|a, b| b.1.cmp(&a.1));
    list.into_iter()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hearth-stats-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("stats.dat")
    }

    fn visit(path: &str, referrer: &str, bytes: u64) -> Visit {
        Visit {
            path: path.into(),
            referrer: referrer.into(),
            ref_param: String::new(),
            bytes,
        }
    }

    #[test]
    fn test_open_creates_missing_file() {
        let path = scratch("create");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert!(path.is_file());
        assert_eq!(store.snapshot(), StatsSnapshot::default());

        // and the created file loads again
        let reopened = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert_eq!(reopened.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_empty_file_loads_as_empty() {
        let path = scratch("empty");
        std::fs::write(&path, b"").unwrap();
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert_eq!(store.snapshot().requests, 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = scratch("corrupt");
        std::fs::write(&path, b"{\"Paths\": [").unwrap();
        let err = StatsStore::open(&path, ExclusionPolicy::none()).unwrap_err();
        assert!(matches!(err, StatsError::Corrupt { .. }));
    }

    #[test]
    fn test_reads_null_maps() {
        let path = scratch("null");
        std::fs::write(
            &path,
            br#"{"Paths": null, "Referers": null, "Bytes": 10, "Requests": 2}"#,
        )
        .unwrap();
        let snapshot = StatsStore::open(&path, ExclusionPolicy::none())
            .unwrap()
            .snapshot();
        assert!(snapshot.paths.is_empty());
        assert_eq!(snapshot.bytes, 10);
        assert_eq!(snapshot.requests, 2);
    }

    #[test]
    fn test_save_then_open_restores_counters() {
        let path = scratch("roundtrip");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        store.record_request(&visit("/", "https://news.example/", 512));
        store.record_request(&visit("/blog", "", 2048));
        store.record_request(&visit("/", "", 512));
        store.save().unwrap();
        let before = store.snapshot();

        let reopened = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert_eq!(reopened.snapshot(), before);
        assert_eq!(before.paths["/"], 2);
        assert_eq!(before.referrers["https://news.example/"], 1);
        assert_eq!(before.bytes, 3072);
        assert_eq!(before.requests, 3);
    }

    #[test]
    fn test_file_uses_documented_keys() {
        let path = scratch("keys");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        store.record_request(&visit("/", "", 1));
        store.save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["Paths"]["/"], 1);
        assert!(raw["Referers"].is_object());
        assert_eq!(raw["Bytes"], 1);
        assert_eq!(raw["Requests"], 1);
    }

    #[test]
    fn test_excluded_paths_still_count_toward_totals() {
        let path = scratch("exclude");
        let store = StatsStore::open(
            &path,
            ExclusionPolicy::substrings(vec!["/api/".into(), "identicon".into()]),
        )
        .unwrap();
        store.record_request(&visit("/api/ping", "https://a.example/", 100));
        store.record_request(&visit("/identicon/abc", "", 50));
        store.record_request(&visit("/bio", "", 10));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.paths.len(), 1);
        assert_eq!(snapshot.paths["/bio"], 1);
        assert!(snapshot.referrers.is_empty());
        assert_eq!(snapshot.bytes, 160);
        assert_eq!(snapshot.requests, 3);
    }

    #[test]
    fn test_custom_exclusion_predicate() {
        let path = scratch("custom");
        let store = StatsStore::open(
            &path,
            ExclusionPolicy::custom(|p| p.starts_with("/debug")),
        )
        .unwrap();
        store.record_request(&visit("/debug/vars", "", 1));
        store.record_request(&visit("/about/debug", "", 1));
        assert_eq!(store.report(usize::MAX).paths.len(), 1);
    }

    #[test]
    fn test_ref_query_param_counts_as_referrer() {
        let path = scratch("refparam");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        store.record_request(&Visit {
            path: "/".into(),
            referrer: String::new(),
            ref_param: "newsletter".into(),
            bytes: 0,
        });
        assert_eq!(store.snapshot().referrers["newsletter"], 1);
    }

    #[test]
    fn test_report_ranks_paths_descending() {
        let path = scratch("sorted");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        for (p, n) in [("/a", 5), ("/b", 9), ("/c", 9)] {
            for _ in 0..n {
                store.record_request(&visit(p, "", 0));
            }
        }

        let sorted = store.report(usize::MAX).paths;
        assert_eq!(sorted.len(), 3);
        let mut top: Vec<_> = sorted[..2].iter().map(|p| p.name.as_str()).collect();
        top.sort();
        assert_eq!(top, vec!["/b", "/c"]);
        assert_eq!(sorted[2], CountEntry { name: "/a".into(), count: 5 });

        let limited = store.report(1);
        assert_eq!(limited.paths.len(), 1);
        assert_eq!(limited.paths[0].count, 9);
        assert_eq!(limited.total_requests, 23);
    }

    #[test]
    fn test_sorted_paths_descending() {
        let path = scratch("sorted");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        for (p, n) in [("/a", 5), ("/b", 9), ("/c", 9)] {
            for _ in 0..n {
                store.record_request(&visit(p, "", 0));
            }
        }

        let sorted = store.sorted_paths();
        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[2], PathCount { name: "/a".into(), count: 5 });
        assert_eq!(store.sorted_referrers(), Vec::new());
    }

    #[test]
    fn test_trimmed_referrer_keeps_full_name() {
        let path = scratch("trim-sorted");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        let long = format!("https://example.com/{}", "é".repeat(100));
        store.record_request(&visit("/", &long, 0));

        let referrers = store.sorted_referrers();
        assert_eq!(referrers[0].trimmed().chars().count(), DISPLAY_WIDTH);
        assert_eq!(referrers[0].name, long);
    }

    #[test]
    fn test_long_referrer_is_trimmed_for_display_only() {
        let path = scratch("trim");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        let long = format!("https://example.com/{}", "é".repeat(100));
        store.record_request(&visit("/", &long, 0));
        store.record_request(&visit("/", &long, 0));

        let referrers = store.report(usize::MAX).referrers;
        assert_eq!(referrers[0].name.chars().count(), DISPLAY_WIDTH);
        assert!(long.starts_with(&referrers[0].name));
        assert_eq!(referrers[0].count, 2);
        assert_eq!(store.snapshot().referrers[&long], 2);
    }

    #[test]
    fn test_session_totals_track_this_process() {
        let path = scratch("session");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        store.record_request(&visit("/", "", 7));
        store.save().unwrap();

        let reopened = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert_eq!(reopened.session_totals(), (0, 0));
        let report = reopened.report(usize::MAX);
        assert_eq!((report.session_bytes, report.session_requests), (0, 0));
        assert_eq!(report.requests_per_second, 0.0);
        reopened.record_request(&visit("/", "", 3));
        let report = reopened.report(usize::MAX);
        assert_eq!((report.session_bytes, report.session_requests), (3, 1));
        assert_eq!((report.total_bytes, report.total_requests), (10, 2));
    }

    #[test]
    fn test_report_tables_agree_with_totals() {
        let path = scratch("report");
        let store = Arc::new(StatsStore::open(&path, ExclusionPolicy::none()).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let path = format!("/writer/{}", n);
                    for _ in 0..500 {
                        store.record_request(&visit(&path, "https://a.example/", 2));
                    }
                })
            })
            .collect();

        while writers.iter().any(|w| !w.is_finished()) {
            let report = store.report(usize::MAX);
            let listed: u64 = report.paths.iter().map(|p| p.count).sum();
            let referred: u64 = report.referrers.iter().map(|r| r.count).sum();
            assert_eq!(listed, report.total_requests);
            assert_eq!(referred, report.total_requests);
            assert_eq!(report.total_bytes, report.total_requests * 2);
            assert_eq!(report.session_requests, report.total_requests);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(store.report(usize::MAX).total_requests, 2000);
    }

    #[test]
    fn test_failed_save_keeps_counters_for_retry() {
        let path = scratch("retry").with_file_name("sub").join("stats.dat");
        let store = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        store.record_request(&visit("/", "", 4));

        // a file where the directory should be
        let blocker = path.parent().unwrap().to_path_buf();
        std::fs::remove_dir_all(&blocker).unwrap();
        std::fs::write(&blocker, b"not a directory").unwrap();

        assert!(matches!(store.save(), Err(StatsError::Io { .. })));
        assert_eq!(store.snapshot().requests, 1);
        store.record_request(&visit("/", "", 4));

        std::fs::remove_file(&blocker).unwrap();
        store.save().unwrap();
        let reopened = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert_eq!(reopened.snapshot().requests, 2);
        assert_eq!(reopened.snapshot().bytes, 8);
        assert_eq!(reopened.snapshot().paths["/"], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_lose_nothing() {
        let path = scratch("concurrent");
        let store = Arc::new(StatsStore::open(&path, ExclusionPolicy::none()).unwrap());

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let path = format!("/worker/{}", worker);
                for i in 0..250 {
                    store.record_request(&visit(&path, "", 1));
                    if i % 50 == 0 {
                        store.save().unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.requests, 2000);
        assert_eq!(snapshot.bytes, 2000);
        for worker in 0..8 {
            assert_eq!(snapshot.paths[&format!("/worker/{}", worker)], 250);
        }

        store.save().unwrap();
        let reopened = StatsStore::open(&path, ExclusionPolicy::none()).unwrap();
        assert_eq!(reopened.snapshot(), snapshot);
    }
}
