//! Prometheus metrics for the worker cache.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Cache and heartbeat counters, registered in a private registry so several
/// workers can live in one process.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    pub admitted_blocks: IntCounter,
    pub rejected_admissions: IntCounter,
    pub evicted_blocks: IntCounter,
    pub removed_blocks: IntCounter,
    pub reclaimed_leases: IntCounter,
    pub heartbeats_sent: IntCounter,
    pub heartbeat_failures: IntCounter,
    pub used_bytes: IntGauge,
    pub capacity_bytes: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let admitted_blocks = IntCounter::new(
            "worker_cache_admitted_blocks_total",
            "Blocks admitted into the cache",
        )?;
        let rejected_admissions = IntCounter::new(
            "worker_cache_rejected_admissions_total",
            "Admissions refused for lack of evictable space",
        )?;
        let evicted_blocks = IntCounter::new(
            "worker_cache_evicted_blocks_total",
            "Blocks evicted to make room",
        )?;
        let removed_blocks = IntCounter::new(
            "worker_cache_removed_blocks_total",
            "Blocks removed explicitly",
        )?;
        let reclaimed_leases = IntCounter::new(
            "worker_cache_reclaimed_leases_total",
            "Leases dropped by timeout or session teardown",
        )?;
        let heartbeats_sent = IntCounter::new(
            "worker_cache_heartbeats_sent_total",
            "Heartbeats delivered to the master",
        )?;
        let heartbeat_failures = IntCounter::new(
            "worker_cache_heartbeat_failures_total",
            "Heartbeats that could not be delivered",
        )?;
        let used_bytes = IntGauge::new("worker_cache_used_bytes", "Bytes held by resident blocks")?;
        let capacity_bytes = IntGauge::new("worker_cache_capacity_bytes", "Cache capacity in bytes")?;

        registry.register(Box::new(admitted_blocks.clone()))?;
        registry.register(Box::new(rejected_admissions.clone()))?;
        registry.register(Box::new(evicted_blocks.clone()))?;
        registry.register(Box::new(removed_blocks.clone()))?;
        registry.register(Box::new(reclaimed_leases.clone()))?;
        registry.register(Box::new(heartbeats_sent.clone()))?;
        registry.register(Box::new(heartbeat_failures.clone()))?;
        registry.register(Box::new(used_bytes.clone()))?;
        registry.register(Box::new(capacity_bytes.clone()))?;

        Ok(Self {
            registry,
            admitted_blocks,
            rejected_admissions,
            evicted_blocks,
            removed_blocks,
            reclaimed_leases,
            heartbeats_sent,
            heartbeat_failures,
            used_bytes,
            capacity_bytes,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("used_bytes", &self.used_bytes.get())
            .field("capacity_bytes", &self.capacity_bytes.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_counters() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.admitted_blocks.inc();
        metrics.used_bytes.set(4000);

        let text = metrics.encode().unwrap();
        assert!(text.contains("worker_cache_admitted_blocks_total 1"));
        assert!(text.contains("worker_cache_used_bytes 4000"));
    }

    #[test]
    fn test_independent_registries() {
        let a = CacheMetrics::new().unwrap();
        let b = CacheMetrics::new().unwrap();
        a.evicted_blocks.inc();
        assert_eq!(b.evicted_blocks.get(), 0);
    }
}
