use crate::health::HealthTracker;
use crate::upstream::Upstream;
use std::sync::{Arc, Mutex};

/// Health-aware weighted round-robin over the registry snapshot.
///
/// A single cursor is shared by all request handlers; each selection advances
/// it by one modulo the healthy set's weight sum and picks the entry whose
/// weight band covers it, so over any window of `sum(weights)` selections
/// each candidate is returned exactly `weight` times.
pub struct WeightedBalancer {
    cursor: Mutex<usize>,
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(0),
        }
    }

    /// Config reloads start the rotation over.
    pub fn reset(&self) {
        *self.cursor.lock().unwrap() = 0;
    }

    pub fn select(
        &self,
        upstreams: &[Arc<Upstream>],
        health: &HealthTracker,
    ) -> Option<Arc<Upstream>> {
        if upstreams.is_empty() {
            return None;
        }

        let healthy: Vec<&Arc<Upstream>> = upstreams
            .iter()
            .filter(|u| u.weight > 0 && health.is_healthy(&u.url))
            .collect();

        if healthy.is_empty() {
            return self.least_failed(upstreams, health);
        }

        if healthy.len() == 1 {
            return Some(Arc::clone(healthy[0]));
        }

        let total_weight: usize = healthy.iter().map(|u| u.weight as usize).sum();

        let target = {
            let mut cursor = self.cursor.lock().unwrap();
            *cursor = (*cursor + 1) % total_weight;
            *cursor
        };

        let mut band_end = 0usize;
        for upstream in &healthy {
            band_end += upstream.weight as usize;
            if target < band_end {
                return Some(Arc::clone(upstream));
            }
        }

        Some(Arc::clone(healthy[0]))
    }

    /// Fallback when every selectable upstream is unhealthy: the enabled
    /// upstream with the fewest recorded failures, ties broken by registry
    /// order.
    fn least_failed(
        &self,
        upstreams: &[Arc<Upstream>],
        health: &HealthTracker,
    ) -> Option<Arc<Upstream>> {
        upstreams
            .iter()
            .min_by_key(|u| health.failure_count(&u.url))
            .cloned()
    }
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::DEFAULT_FAILURE_THRESHOLD;
    use std::collections::HashMap;

    fn upstream(url: &str, weight: u32, index: usize) -> Arc<Upstream> {
        Arc::new(Upstream {
            url: url.to_string(),
            weight,
            tag: None,
            index,
            endpoint: None,
        })
    }

    fn count_selections(
        balancer: &WeightedBalancer,
        upstreams: &[Arc<Upstream>],
        health: &HealthTracker,
        rounds: usize,
    ) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            let selected = balancer.select(upstreams, health).expect("selection");
            *counts.entry(selected.url.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        let balancer = WeightedBalancer::new();
        assert!(balancer.select(&[], &HealthTracker::new()).is_none());
    }

    #[test]
    fn test_exact_distribution_over_weight_cycles() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 1, 0),
            upstream("http://b:1", 2, 1),
            upstream("http://c:1", 3, 2),
        ];

        // 600 selections = 100 full cycles of W=6: exact counts.
        let counts = count_selections(&balancer, &upstreams, &health, 600);
        assert_eq!(counts["http://a:1"], 100);
        assert_eq!(counts["http://b:1"], 200);
        assert_eq!(counts["http://c:1"], 300);
    }

    #[test]
    fn test_single_upstream_always_selected() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![upstream("http://a:1", 5, 0)];
        for _ in 0..10 {
            assert_eq!(
                balancer.select(&upstreams, &health).unwrap().url,
                "http://a:1"
            );
        }
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 0, 0),
            upstream("http://b:1", 1, 1),
        ];
        for _ in 0..50 {
            assert_eq!(
                balancer.select(&upstreams, &health).unwrap().url,
                "http://b:1"
            );
        }
    }

    #[test]
    fn test_unhealthy_excluded_from_rotation() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://x:1", 2, 0),
            upstream("http://y:1", 2, 1),
            upstream("http://z:1", 1, 2),
        ];

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            health.record_failure("http://x:1");
        }

        let counts = count_selections(&balancer, &upstreams, &health, 100);
        assert_eq!(counts.get("http://x:1"), None);
        // Y:Z should track 2:1 over the remaining pool.
        let y = counts["http://y:1"] as f64;
        let z = counts["http://z:1"] as f64;
        assert!((y / z - 2.0).abs() < 0.3, "y={} z={}", y, z);
    }

    #[test]
    fn test_failover_to_sole_healthy_upstream() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 3, 0),
            upstream("http://b:1", 1, 1),
        ];

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            health.record_failure("http://a:1");
        }

        let counts = count_selections(&balancer, &upstreams, &health, 40);
        assert_eq!(counts["http://b:1"], 40);
    }

    #[test]
    fn test_recovery_rejoins_rotation() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 1, 0),
            upstream("http://b:1", 1, 1),
        ];

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            health.record_failure("http://a:1");
        }
        health.record_success("http://a:1");

        let counts = count_selections(&balancer, &upstreams, &health, 100);
        assert_eq!(counts["http://a:1"], 50);
        assert_eq!(counts["http://b:1"], 50);
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_least_failed() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 1, 0),
            upstream("http://b:1", 1, 1),
        ];

        health.set_failure_threshold("http://a:1", 4);
        for _ in 0..4 {
            health.record_failure("http://a:1");
        }
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            health.record_failure("http://b:1");
        }

        // a has 4 failures, b has 3: fallback picks b.
        for _ in 0..10 {
            assert_eq!(
                balancer.select(&upstreams, &health).unwrap().url,
                "http://b:1"
            );
        }
    }

    #[test]
    fn test_fallback_ties_break_by_registry_order() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 1, 0),
            upstream("http://b:1", 1, 1),
        ];

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            health.record_failure("http://a:1");
            health.record_failure("http://b:1");
        }

        assert_eq!(
            balancer.select(&upstreams, &health).unwrap().url,
            "http://a:1"
        );
    }

    #[test]
    fn test_zero_weight_wins_fallback_when_unfailed() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 0, 0),
            upstream("http://b:1", 2, 1),
        ];

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            health.record_failure("http://b:1");
        }

        // No healthy selectable upstream remains; the zero-weight entry has
        // the lowest failure count.
        assert_eq!(
            balancer.select(&upstreams, &health).unwrap().url,
            "http://a:1"
        );
    }

    #[test]
    fn test_reset_restarts_rotation() {
        let balancer = WeightedBalancer::new();
        let health = HealthTracker::new();
        let upstreams = vec![
            upstream("http://a:1", 1, 0),
            upstream("http://b:1", 1, 1),
        ];

        let first = balancer.select(&upstreams, &health).unwrap().url.clone();
        balancer.reset();
        let after_reset = balancer.select(&upstreams, &health).unwrap().url.clone();
        assert_eq!(first, after_reset);
    }
}
