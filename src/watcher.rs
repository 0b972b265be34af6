use crate::config::Config;
use crate::error::ProxyError;
use crate::server::ProxyServer;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

/// How often the config file's modification time is checked.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

impl ProxyServer {
    /// Spawns the periodic config watcher. It lives for the rest of the
    /// process.
    pub fn start_config_watcher(self: Arc<Self>) {
        let server = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RELOAD_INTERVAL);
            // The first tick completes immediately; skip it so the initial
            // load is not re-checked right away.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = server.reload_config() {
                    error!("Config reload error: {}", e);
                }
            }
        });
        info!(
            "Config file watcher started (checking every {}s)",
            RELOAD_INTERVAL.as_secs()
        );
    }

    /// Re-stats the config file; a strictly newer modification time triggers
    /// a re-parse. On success the active config is swapped and the registry
    /// rebuilt; health entries and per-upstream counters keyed by URL
    /// survive, and the selection cursor starts over. On failure the
    /// previous configuration stays active.
    pub fn reload_config(&self) -> Result<(), ProxyError> {
        let _guard = self.reload_lock.lock().unwrap();

        let metadata = std::fs::metadata(&self.config_path)
            .map_err(|e| ProxyError::Config(format!("Failed to stat config file: {}", e)))?;
        let mod_time = metadata
            .modified()
            .map_err(|e| ProxyError::Config(format!("Failed to read mtime: {}", e)))?;

        {
            let last = self.config_mod_time.lock().unwrap();
            if let Some(last_time) = *last {
                if mod_time <= last_time {
                    return Ok(());
                }
            }
        }

        info!(
            "Config file modified, reloading configuration from {}",
            self.config_path
        );

        let new_config = Config::from_file(&self.config_path)?;
        new_config.validate()?;

        let old_enabled = self.registry.len();

        {
            let mut config = self.config.write().unwrap();
            *config = new_config.clone();
        }
        *self.config_mod_time.lock().unwrap() = Some(mod_time);

        info!("Configuration reloaded successfully:");
        info!("  - Server: {}", new_config.server.name);
        info!("  - Authentication: {}", new_config.authentication.enabled);

        let (_old_entries, new_entries) = self.registry.rebuild(&new_config);
        for upstream in &new_entries {
            self.health.register(&upstream.url, upstream.tag.as_deref());
            self.stats
                .register_upstream(&upstream.url, upstream.tag.as_deref());
        }
        self.balancer.reset();

        info!(
            "  - Upstream proxies: {} enabled (was {})",
            new_entries.len(),
            old_enabled
        );

        Ok(())
    }
}
