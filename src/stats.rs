use crate::upstream::Upstream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Horizon for the sliding "recent" window.
pub const RECENT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Lifetime counters for one upstream URL. Shared by config reloads; hot-path
/// updates are single-word atomics, multi-field reads go through the snapshot
/// path.
pub struct UpstreamCounters {
    pub url: String,
    tag: Mutex<Option<String>>,
    total_requests: AtomicU64,
    success_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_latency_ms: AtomicU64,
    current_connections: AtomicI64,
    last_request: Mutex<DateTime<Utc>>,
}

impl UpstreamCounters {
    fn new(url: &str, tag: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            tag: Mutex::new(tag.map(|t| t.to_string())),
            total_requests: AtomicU64::new(0),
            success_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            current_connections: AtomicI64::new(0),
            last_request: Mutex::new(Utc::now()),
        }
    }

    pub fn begin_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release_connection(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency is accumulated exactly once per successful tunnel.
    pub fn record_success(&self, latency_ms: u64) {
        self.success_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        *self.last_request.lock().unwrap() = Utc::now();
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn success_requests(&self) -> u64 {
        self.success_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn current_connections(&self) -> i64 {
        self.current_connections.load(Ordering::Relaxed)
    }

    fn set_tag(&self, tag: Option<&str>) {
        *self.tag.lock().unwrap() = tag.map(|t| t.to_string());
    }

    fn tag(&self) -> Option<String> {
        self.tag.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
struct RecentRequest {
    timestamp: DateTime<Utc>,
    upstream: String,
    latency_ms: u64,
    success: bool,
}

/// Which view `window_stats` computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsWindow {
    /// Since startup, from the live per-upstream counters.
    Lifetime,
    /// Last 15 minutes, recomputed from the recent-request buffer.
    Recent,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatView {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub index: usize,
    pub total_reqs: u64,
    pub success_reqs: u64,
    pub failed_reqs: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub current_cons: i64,
    pub last_request: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagGroupStats {
    pub tag: String,
    pub total_reqs: u64,
    pub success_reqs: u64,
    pub failed_reqs: u64,
    pub avg_latency_ms: f64,
    pub upstream_count: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeWindowStats {
    pub window: String,
    pub total_reqs: u64,
    pub success_reqs: u64,
    pub failed_reqs: u64,
    pub avg_latency_ms: f64,
    pub max_concurrency: u64,
    pub upstream_metrics: Vec<UpstreamStatView>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tag_groups: HashMap<String, TagGroupStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsDocument {
    pub start_time: DateTime<Utc>,
    pub uptime: String,
    pub total: TimeWindowStats,
    pub recent_15m: TimeWindowStats,
    pub current_concurrency: i64,
}

/// Global and per-upstream request accounting plus the recent-request buffer.
pub struct ProxyStats {
    start_time: DateTime<Utc>,
    started: Instant,
    total_requests: AtomicU64,
    success_requests: AtomicU64,
    failed_requests: AtomicU64,
    current_requests: AtomicI64,
    max_concurrency: AtomicI64,
    upstreams: RwLock<HashMap<String, Arc<UpstreamCounters>>>,
    recent: Mutex<Vec<RecentRequest>>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            success_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            current_requests: AtomicI64::new(0),
            max_concurrency: AtomicI64::new(0),
            upstreams: RwLock::new(HashMap::new()),
            recent: Mutex::new(Vec::new()),
        }
    }

    /// Ensures a counter cell exists for a registered upstream and refreshes
    /// its tag. Counters persist across reloads keyed by URL.
    pub fn register_upstream(&self, url: &str, tag: Option<&str>) {
        let mut upstreams = self.upstreams.write().unwrap();
        match upstreams.get(url) {
            Some(counters) => counters.set_tag(tag),
            None => {
                upstreams.insert(url.to_string(), Arc::new(UpstreamCounters::new(url, tag)));
            }
        }
    }

    pub fn upstream_counters(&self, url: &str) -> Arc<UpstreamCounters> {
        if let Some(counters) = self.upstreams.read().unwrap().get(url) {
            return Arc::clone(counters);
        }
        let mut upstreams = self.upstreams.write().unwrap();
        Arc::clone(
            upstreams
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(UpstreamCounters::new(url, None))),
        )
    }

    /// Accounting at request entry: raise the concurrency gauge, push the
    /// observed maximum with a CAS loop, bump the lifetime total.
    pub fn begin_request(&self) {
        let current = self.current_requests.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let max = self.max_concurrency.load(Ordering::SeqCst);
            if current <= max
                || self
                    .max_concurrency
                    .compare_exchange(max, current, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                break;
            }
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.current_requests.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.success_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Appends a completed-request record and prunes entries beyond the
    /// 15-minute horizon.
    pub fn record_recent(&self, upstream: &str, latency_ms: u64, success: bool) {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(RECENT_WINDOW.as_secs() as i64);
        let mut recent = self.recent.lock().unwrap();
        recent.push(RecentRequest {
            timestamp: now,
            upstream: upstream.to_string(),
            latency_ms,
            success,
        });
        recent.retain(|r| r.timestamp > cutoff);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn success_requests(&self) -> u64 {
        self.success_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn current_concurrency(&self) -> i64 {
        self.current_requests.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> i64 {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Builds one window view over the given registry snapshot. The lifetime
    /// view copies live counters; the recent view is recomputed from the
    /// request buffer, where per-upstream attribution goes to the first
    /// registry entry with a matching URL.
    pub fn window_stats(
        &self,
        window: StatsWindow,
        registry: &[Arc<Upstream>],
        healthy: &HashMap<String, bool>,
    ) -> TimeWindowStats {
        let label = match window {
            StatsWindow::Lifetime => format_duration(self.uptime()),
            StatsWindow::Recent => format_duration(RECENT_WINDOW),
        };

        struct Accum {
            url: String,
            index: usize,
            total: u64,
            success: u64,
            failed: u64,
            latency_ms: u64,
        }

        let mut accums: Vec<Accum> = registry
            .iter()
            .map(|u| Accum {
                url: u.url.clone(),
                index: u.index,
                total: 0,
                success: 0,
                failed: 0,
                latency_ms: 0,
            })
            .collect();

        // Duplicate URLs attribute recent records to their first entry.
        let mut first_index: HashMap<&str, usize> = HashMap::new();
        for (pos, upstream) in registry.iter().enumerate() {
            first_index.entry(upstream.url.as_str()).or_insert(pos);
        }

        let mut tag_groups: HashMap<String, TagGroupStats> = HashMap::new();
        let mut tag_latency: HashMap<String, u64> = HashMap::new();
        for upstream in registry {
            if let Some(tag) = upstream.tag.as_deref().filter(|t| !t.is_empty()) {
                tag_groups.entry(tag.to_string()).or_insert_with(|| TagGroupStats {
                    tag: tag.to_string(),
                    total_reqs: 0,
                    success_reqs: 0,
                    failed_reqs: 0,
                    avg_latency_ms: 0.0,
                    upstream_count: 0,
                    healthy_count: 0,
                    unhealthy_count: 0,
                });
                tag_latency.entry(tag.to_string()).or_insert(0);
            }
        }

        let mut total_reqs = 0u64;
        let mut success_reqs = 0u64;
        let mut failed_reqs = 0u64;
        let mut total_latency = 0u64;

        match window {
            StatsWindow::Lifetime => {
                let counters = self.upstreams.read().unwrap();
                for (pos, upstream) in registry.iter().enumerate() {
                    if let Some(cell) = counters.get(&upstream.url) {
                        let accum = &mut accums[pos];
                        accum.total = cell.total_requests();
                        accum.success = cell.success_requests();
                        accum.failed = cell.failed_requests();
                        accum.latency_ms = cell.total_latency_ms.load(Ordering::Relaxed);

                        total_reqs += accum.total;
                        success_reqs += accum.success;
                        failed_reqs += accum.failed;
                        total_latency += accum.latency_ms;

                        if let Some(tag) = upstream.tag.as_deref().filter(|t| !t.is_empty()) {
                            if let Some(group) = tag_groups.get_mut(tag) {
                                group.total_reqs += accum.total;
                                group.success_reqs += accum.success;
                                group.failed_reqs += accum.failed;
                                *tag_latency.get_mut(tag).unwrap() += accum.latency_ms;
                            }
                        }
                    }
                }
            }
            StatsWindow::Recent => {
                let cutoff =
                    Utc::now() - chrono::Duration::seconds(RECENT_WINDOW.as_secs() as i64);
                let records: Vec<RecentRequest> = self
                    .recent
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|r| r.timestamp > cutoff)
                    .cloned()
                    .collect();

                for record in &records {
                    total_reqs += 1;
                    if record.success {
                        success_reqs += 1;
                        total_latency += record.latency_ms;
                    } else {
                        failed_reqs += 1;
                    }

                    let pos = match first_index.get(record.upstream.as_str()) {
                        Some(pos) => *pos,
                        None => continue, // upstream removed since the record
                    };

                    let accum = &mut accums[pos];
                    accum.total += 1;
                    if record.success {
                        accum.success += 1;
                        accum.latency_ms += record.latency_ms;
                    } else {
                        accum.failed += 1;
                    }

                    if let Some(tag) = registry[pos].tag.as_deref().filter(|t| !t.is_empty()) {
                        if let Some(group) = tag_groups.get_mut(tag) {
                            group.total_reqs += 1;
                            if record.success {
                                group.success_reqs += 1;
                                *tag_latency.get_mut(tag).unwrap() += record.latency_ms;
                            } else {
                                group.failed_reqs += 1;
                            }
                        }
                    }
                }
            }
        }

        let avg_latency_ms = if success_reqs > 0 {
            total_latency as f64 / success_reqs as f64
        } else {
            0.0
        };

        // The recent window does not track its own maximum.
        let max_concurrency = match window {
            StatsWindow::Lifetime => self.max_concurrency().max(0) as u64,
            StatsWindow::Recent => 0,
        };

        let counters = self.upstreams.read().unwrap();
        let upstream_metrics = accums
            .into_iter()
            .map(|accum| {
                let cell = counters.get(&accum.url);
                UpstreamStatView {
                    url: accum.url.clone(),
                    tag: cell.and_then(|c| c.tag()),
                    index: accum.index,
                    total_reqs: accum.total,
                    success_reqs: accum.success,
                    failed_reqs: accum.failed,
                    total_latency_ms: accum.latency_ms,
                    avg_latency_ms: if accum.success > 0 {
                        accum.latency_ms as f64 / accum.success as f64
                    } else {
                        0.0
                    },
                    current_cons: cell.map(|c| c.current_connections()).unwrap_or(0),
                    last_request: cell
                        .map(|c| *c.last_request.lock().unwrap())
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect();

        for (tag, group) in tag_groups.iter_mut() {
            if group.success_reqs > 0 {
                group.avg_latency_ms =
                    *tag_latency.get(tag).unwrap_or(&0) as f64 / group.success_reqs as f64;
            }
            for upstream in registry {
                if upstream.tag.as_deref() == Some(tag.as_str()) {
                    group.upstream_count += 1;
                    // Missing health entries count as healthy.
                    if healthy.get(&upstream.url).copied().unwrap_or(true) {
                        group.healthy_count += 1;
                    } else {
                        group.unhealthy_count += 1;
                    }
                }
            }
        }

        TimeWindowStats {
            window: label,
            total_reqs,
            success_reqs,
            failed_reqs,
            avg_latency_ms,
            max_concurrency,
            upstream_metrics,
            tag_groups,
        }
    }

    /// The full stats endpoint document.
    pub fn document(
        &self,
        registry: &[Arc<Upstream>],
        healthy: &HashMap<String, bool>,
    ) -> StatsDocument {
        StatsDocument {
            start_time: self.start_time,
            uptime: format_duration(self.uptime()),
            total: self.window_stats(StatsWindow::Lifetime, registry, healthy),
            recent_15m: self.window_stats(StatsWindow::Recent, registry, healthy),
            current_concurrency: self.current_concurrency(),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
