use crate::upstream::tag_suffix;
use chrono::{DateTime, Utc};
use log::warn;
use std::collections::HashMap;
use std::sync::RwLock;

pub const DEFAULT_FAILURE_THRESHOLD: u64 = 3;
pub const DEFAULT_RECOVERY_THRESHOLD: u64 = 1;

#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub tag: Option<String>,
    pub failure_count: u64,
    pub success_count: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub failure_threshold: u64,
    /// Recovery is modeled as a single success clearing the failure count,
    /// so this stays at its default unless tuned for tests.
    pub recovery_threshold: u64,
}

impl HealthEntry {
    fn new(tag: Option<String>) -> Self {
        Self {
            tag,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_success: None,
            healthy: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_threshold: DEFAULT_RECOVERY_THRESHOLD,
        }
    }
}

/// Passive per-upstream health, keyed by URL. Entries are created lazily and
/// survive config reloads so an upstream keeps its history as long as its
/// URL is unchanged.
pub struct HealthTracker {
    entries: RwLock<HashMap<String, HealthEntry>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Ensures an entry exists for a registered upstream and refreshes its
    /// tag, which may have changed in the config.
    pub fn register(&self, url: &str, tag: Option<&str>) {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(url.to_string())
            .and_modify(|entry| entry.tag = tag.map(|t| t.to_string()))
            .or_insert_with(|| HealthEntry::new(tag.map(|t| t.to_string())));
    }

    pub fn record_failure(&self, url: &str) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(url.to_string())
            .or_insert_with(|| HealthEntry::new(None));

        entry.failure_count += 1;
        entry.last_failure = Some(Utc::now());

        if entry.healthy && entry.failure_count >= entry.failure_threshold {
            entry.healthy = false;
            warn!(
                "Upstream {}{} marked as unhealthy after {} failures",
                url,
                tag_suffix(&entry.tag),
                entry.failure_count
            );
        }
    }

    pub fn record_success(&self, url: &str) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(url.to_string())
            .or_insert_with(|| HealthEntry::new(None));

        entry.success_count += 1;
        entry.last_success = Some(Utc::now());

        if !entry.healthy {
            // Reset so a single follow-up failure does not re-trip the
            // threshold immediately.
            entry.failure_count = 0;
            entry.healthy = true;
            log::info!(
                "Upstream {}{} recovered and marked as healthy",
                url,
                tag_suffix(&entry.tag)
            );
        }
    }

    /// Unknown URLs are assumed healthy.
    pub fn is_healthy(&self, url: &str) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(url)
            .map(|entry| entry.healthy)
            .unwrap_or(true)
    }

    pub fn failure_count(&self, url: &str) -> u64 {
        self.entries
            .read()
            .unwrap()
            .get(url)
            .map(|entry| entry.failure_count)
            .unwrap_or(0)
    }

    pub fn set_failure_threshold(&self, url: &str, threshold: u64) {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(url.to_string())
            .or_insert_with(|| HealthEntry::new(None))
            .failure_threshold = threshold;
    }

    pub fn set_recovery_threshold(&self, url: &str, threshold: u64) {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(url.to_string())
            .or_insert_with(|| HealthEntry::new(None))
            .recovery_threshold = threshold;
    }

    /// Healthy flag per known URL, for tag-group roll-ups.
    pub fn healthy_map(&self) -> HashMap<String, bool> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(url, entry)| (url.clone(), entry.healthy))
            .collect()
    }

    pub fn entry(&self, url: &str) -> Option<HealthEntry> {
        self.entries.read().unwrap().get(url).cloned()
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
