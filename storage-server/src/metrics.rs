//! Prometheus metrics, exported at `/metrics`.

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Metric handles registered once at startup and cloned into handlers.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<RwLock<Registry>>,
    /// Requests by (endpoint, status).
    pub http_requests: Family<[(String, String); 2], Counter>,
    pub client_stores: Counter,
    pub client_retrieves: Counter,
    pub peer_pushes: Counter,
    pub pow_rejections: Counter,
    pub replication_failures: Counter,
    pub tests_passed: Counter,
    pub tests_failed: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "storage_http_requests_total",
            "HTTP requests by endpoint and status",
            http_requests.clone(),
        );

        let client_stores = Counter::default();
        registry.register(
            "storage_client_store_total",
            "Client store requests accepted",
            client_stores.clone(),
        );

        let client_retrieves = Counter::default();
        registry.register(
            "storage_client_retrieve_total",
            "Client retrieve requests served",
            client_retrieves.clone(),
        );

        let peer_pushes = Counter::default();
        registry.register(
            "storage_peer_push_total",
            "Messages accepted from swarm peers",
            peer_pushes.clone(),
        );

        let pow_rejections = Counter::default();
        registry.register(
            "storage_pow_rejections_total",
            "Stores rejected for insufficient proof of work",
            pow_rejections.clone(),
        );

        let replication_failures = Counter::default();
        registry.register(
            "storage_replication_failures_total",
            "Failed replication pushes to peers",
            replication_failures.clone(),
        );

        let tests_passed = Counter::default();
        registry.register(
            "storage_peer_tests_passed_total",
            "Peer audits that passed",
            tests_passed.clone(),
        );

        let tests_failed = Counter::default();
        registry.register(
            "storage_peer_tests_failed_total",
            "Peer audits that failed",
            tests_failed.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests,
            client_stores,
            client_retrieves,
            peer_pushes,
            pow_rejections,
            replication_failures,
            tests_passed,
            tests_failed,
        }
    }

    pub fn record_request(&self, endpoint: &str, status: u16) {
        self.http_requests
            .get_or_create(&[
                ("endpoint".to_string(), endpoint.to_string()),
                ("status".to_string(), status.to_string()),
            ])
            .inc();
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let registry = self.registry.read();
        if encode(&mut out, &registry).is_err() {
            out.clear();
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_counters() {
        let metrics = Metrics::new();
        metrics.client_stores.inc();
        metrics.record_request("storage_rpc", 200);
        let text = metrics.encode();
        assert!(text.contains("storage_client_store_total"));
        assert!(text.contains("storage_http_requests_total"));
    }
}
