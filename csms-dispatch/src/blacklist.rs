//! Per-station action blacklist
//!
//! While a station's boot is pending or rejected, every action except
//! BootNotification is flagged in the cache and the router turns such calls
//! away. One key is written per action and station.

use std::sync::Arc;

use tracing::info;

use csms_core::{Cache, CacheNamespace, Identifier, BOOT_NOTIFICATION};

#[derive(Clone)]
pub struct ActionBlacklist {
    cache: Arc<dyn Cache>,
}

impl ActionBlacklist {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn namespace(identifier: &Identifier) -> String {
        format!("{}:{}", CacheNamespace::Blacklist.as_str(), identifier)
    }

    /// Flag every action in `actions` except BootNotification; returns the count written
    pub async fn blacklist_all_except_boot(&self, identifier: &Identifier, actions: &[String]) -> usize {
        let namespace = Self::namespace(identifier);
        let mut written = 0;
        for action in actions.iter().filter(|a| a.as_str() != BOOT_NOTIFICATION) {
            if self.cache.set(action, "true".to_string(), Some(&namespace), None).await {
                written += 1;
            }
        }
        info!("Blacklisted {} actions for {}", written, identifier);
        written
    }

    /// Lift the flags for `actions`; returns how many were present
    pub async fn clear(&self, identifier: &Identifier, actions: &[String]) -> usize {
        let namespace = Self::namespace(identifier);
        let mut removed = 0;
        for action in actions {
            if self.cache.remove(action, Some(&namespace)).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleared {} blacklisted actions for {}", removed, identifier);
        }
        removed
    }

    pub async fn is_blacklisted(&self, identifier: &Identifier, action: &str) -> bool {
        self.cache.exists(action, Some(&Self::namespace(identifier))).await
    }
}
