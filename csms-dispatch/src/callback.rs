//! Callback-URL forwarding
//!
//! A caller of `send_call` may ask for the station's answer to be POSTed to a
//! URL. The URL is kept in the shared cache under the correlation id until the
//! response comes back through the module. Forwarding is best effort.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use csms_core::{Cache, ConfigHandle, Identifier, Message};

const CALLBACK_NAMESPACE: &str = "callbacks";

/// Stores callback URLs and forwards responses to them
#[derive(Clone)]
pub struct CallbackForwarder {
    client: reqwest::Client,
    cache: Arc<dyn Cache>,
    config: Arc<ConfigHandle>,
}

impl CallbackForwarder {
    pub fn new(cache: Arc<dyn Cache>, config: Arc<ConfigHandle>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client, cache, config }
    }

    fn namespace(identifier: &Identifier) -> String {
        format!("{}:{}", CALLBACK_NAMESPACE, identifier)
    }

    /// Remember `url` for the response to `correlation_id`
    pub async fn register(&self, identifier: &Identifier, correlation_id: &str, url: &str) -> bool {
        let ttl = self.config.get().max_caching_seconds;
        self.cache
            .set(correlation_id, url.to_string(), Some(&Self::namespace(identifier)), Some(ttl))
            .await
    }

    /// Take the registered URL, if any, so a redelivered response is not forwarded twice
    pub async fn take(&self, identifier: &Identifier, correlation_id: &str) -> Option<String> {
        let namespace = Self::namespace(identifier);
        let url = self.cache.get(correlation_id, Some(&namespace)).await?;
        self.cache.remove(correlation_id, Some(&namespace)).await;
        Some(url)
    }

    /// Forward `message` in the background if a callback was registered for it
    pub fn forward(&self, message: &Message) {
        let forwarder = self.clone();
        let identifier = message.identifier();
        let correlation_id = message.correlation_id().to_string();
        let body = message.payload_value();

        tokio::spawn(async move {
            let Some(url) = forwarder.take(&identifier, &correlation_id).await else {
                return;
            };
            debug!("Forwarding response {} to {}", correlation_id, url);
            let result = forwarder
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            if let Err(e) = result {
                warn!("Callback to {} for {} failed: {}", url, correlation_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csms_core::{MemoryCache, SystemConfig};

    #[tokio::test]
    async fn test_register_then_take_once() {
        let cache: Arc<dyn Cache> = MemoryCache::shared();
        let config = ConfigHandle::new(SystemConfig::default(), None).unwrap();
        let forwarder = CallbackForwarder::new(cache.clone(), config);
        let id = Identifier::new("t1", "CS001");

        assert!(forwarder.register(&id, "abc", "http://localhost:9/hook").await);
        assert!(cache.exists("abc", Some("callbacks:t1:CS001")).await);

        assert_eq!(forwarder.take(&id, "abc").await.as_deref(), Some("http://localhost:9/hook"));
        assert_eq!(forwarder.take(&id, "abc").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_expires_with_caching_window() {
        let cache: Arc<dyn Cache> = MemoryCache::shared();
        let config = ConfigHandle::new(SystemConfig::default().with_caching(2, 1), None).unwrap();
        let forwarder = CallbackForwarder::new(cache, config);
        let id = Identifier::new("t1", "CS001");

        forwarder.register(&id, "abc", "http://localhost:9/hook").await;
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(forwarder.take(&id, "abc").await, None);
    }
}
