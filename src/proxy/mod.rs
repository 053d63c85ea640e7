//! Proxy Allocator — given an instance identity, returns a proxy endpoint.
//!
//! Reuses the last stored IP/token for that instance when available; only
//! calls the external allocation service (Oxylabs, via `OxylabsProxyGenerator`)
//! on cold start or on an explicit `rotate(id)`. This reuse-first behaviour is
//! the primary fix for upstream proxy-service overload, and is the opposite
//! of the source's "always mint a fresh random sessid" behaviour.

mod config;
mod forwarder;
mod oxylabs;

pub use config::ProxyConfig;
pub use forwarder::{allocate_port, LocalProxyForwarder};
pub use oxylabs::{OxylabsProxyGenerator, ProxyInfo};

use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::ProxyError;
use crate::session_store::SessionStore;

/// Result of `ProxyAllocator::acquire`.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub endpoint: String,
    pub session_token: String,
    pub observed_ip: String,
}

pub struct ProxyAllocator {
    config: RwLock<ProxyConfig>,
    session_store: std::sync::Arc<SessionStore>,
}

impl ProxyAllocator {
    pub fn new(config: ProxyConfig, session_store: std::sync::Arc<SessionStore>) -> Self {
        Self {
            config: RwLock::new(config),
            session_store,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.read().is_configured()
    }

    pub fn reconfigure(&self, config: ProxyConfig) {
        *self.config.write() = config;
    }

    /// Reuse-first acquisition. Only reaches for the external allocation
    /// service when there is no stored session for this instance.
    pub async fn acquire(&self, id: u32) -> Result<Allocation, ProxyError> {
        if !self.is_configured() {
            return Err(ProxyError::NotConfigured);
        }

        if let Some(record) = self.session_store.load(id).map_err(|e| {
            ProxyError::AllocationFailed(format!("session store read failed: {e}"))
        })? {
            if !record.proxy_ip.is_empty() && !record.session_token.is_empty() {
                info!(instance_id = id, "reusing stored proxy session, no allocator call");
                let endpoint = self.endpoint_for_session_token(&record.session_token);
                return Ok(Allocation {
                    endpoint,
                    session_token: record.session_token,
                    observed_ip: record.proxy_ip,
                });
            }
        }

        self.allocate_fresh(id).await
    }

    /// Force a new external allocation regardless of any stored session.
    pub async fn rotate(&self, id: u32) -> Result<Allocation, ProxyError> {
        info!(instance_id = id, "explicit proxy rotation requested");
        self.allocate_fresh(id).await
    }

    async fn allocate_fresh(&self, id: u32) -> Result<Allocation, ProxyError> {
        let info = {
            let config = self.config.read();
            let generator = OxylabsProxyGenerator::new(config.clone());
            generator.next_with_info()
        };

        let observed_ip = detect_egress_ip(&info.proxy_url).await.unwrap_or_else(|e| {
            warn!(instance_id = id, "could not observe egress ip for fresh proxy: {e}");
            String::new()
        });

        Ok(Allocation {
            endpoint: info.proxy_url,
            session_token: info.session_id.to_string(),
            observed_ip,
        })
    }

    /// Reconstruct the same proxy endpoint for a previously allocated
    /// session token (the Oxylabs sessid), so that reusing a session never
    /// requires the generator to mint a new one.
    fn endpoint_for_session_token(&self, session_token: &str) -> String {
        let config = self.config.read();
        let password_encoded = urlencoding::encode(&config.password);
        format!(
            "{}://customer-{}-cc-{}-sessid-{}-sesstime-{}:{}@{}:{}",
            config.scheme, config.customer, config.country, session_token, config.sesstime,
            password_encoded, config.host, config.port
        )
    }
}

/// Best-effort egress-IP observation through a freshly allocated proxy
/// endpoint. Failure here is not fatal: the allocation still succeeds with
/// an empty `observed_ip`, which the Instance will fill in later once the
/// Browser Worker has actually used the proxy.
async fn detect_egress_ip(proxy_endpoint: &str) -> Result<String, ProxyError> {
    let proxy = reqwest::Proxy::all(proxy_endpoint).map_err(|e| {
        ProxyError::AllocationFailed(format!("invalid proxy endpoint: {e}"))
    })?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| ProxyError::AllocationFailed(e.to_string()))?;

    let resp = client
        .get("https://api.ipify.org")
        .send()
        .await
        .map_err(|e| ProxyError::AllocationFailed(e.to_string()))?;

    let ip = resp
        .text()
        .await
        .map_err(|e| ProxyError::AllocationFailed(e.to_string()))?;

    Ok(ip.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("votefleet-proxy-{}", uuid::Uuid::new_v4()));
        dir
    }

    #[tokio::test]
    async fn cold_start_without_stored_session_allocates_fresh() {
        let dir = tempdir();
        let store = std::sync::Arc::new(SessionStore::new(&dir));
        let config = ProxyConfig::new("testcustomer", "testpass");
        let allocator = ProxyAllocator::new(config, store);

        // Networking to ipify is not reachable in a sandboxed test run; the
        // allocation still succeeds (endpoint/session_token are local
        // computation), only observed_ip may end up empty.
        let allocation = allocator.acquire(1).await.unwrap();
        assert!(allocation.endpoint.contains("customer-testcustomer"));
        assert!(!allocation.session_token.is_empty());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn reuse_of_stored_session_skips_generator() {
        use crate::session_store::SessionRecord;

        let dir = tempdir();
        let store = std::sync::Arc::new(SessionStore::new(&dir));
        store
            .save(
                2,
                &SessionRecord {
                    instance_id: 2,
                    proxy_ip: "9.9.9.9".to_string(),
                    session_token: "123456789".to_string(),
                    last_success_at: None,
                    vote_count: 1,
                    saved_at: chrono::Utc::now(),
                },
            )
            .unwrap();

        let config = ProxyConfig::new("testcustomer", "testpass");
        let allocator = ProxyAllocator::new(config, store);

        let first = allocator.acquire(2).await.unwrap();
        let second = allocator.acquire(2).await.unwrap();

        assert_eq!(first.session_token, "123456789");
        assert_eq!(second.session_token, "123456789");
        assert_eq!(first.observed_ip, "9.9.9.9");
        assert_eq!(second.observed_ip, "9.9.9.9");

        std::fs::remove_dir_all(dir).ok();
    }
}
