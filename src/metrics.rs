//! Prometheus counters shared across node components.
//!
//! A single [`Metrics`] value is created at startup and handed to every
//! component; the registry behind it is scraped by the control plane's
//! `/metrics` endpoint.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Shared handle to the node's metric registry and counters.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub requests_observed: IntCounter,
    pub requests_skipped: IntCounter,
    pub requests_handled: IntCounter,
    pub requests_failed: IntCounter,
    pub responses_submitted: IntCounter,
    pub submit_failures: IntCounter,
    pub heartbeats_sent: IntCounter,
    pub containers_started: IntCounter,
    pub containers_reaped: IntCounter,
    pub receipt_uploads: IntCounter,
    pub receipt_upload_failures: IntCounter,
    pub proxy_requests_total: IntCounter,
    pub proxy_requests_in_flight: IntGauge,
    pub inference_requests_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let counter = IntCounter::with_opts(Opts::new(name, help))
                .expect("metric options are statically valid");
            registry
                .register(Box::new(counter.clone()))
                .expect("metric names are unique");
            counter
        }

        let proxy_requests_in_flight = IntGauge::with_opts(Opts::new(
            "agent_host_proxy_requests_in_flight",
            "Forward-proxy requests currently being served",
        ))
        .expect("metric options are statically valid");
        registry
            .register(Box::new(proxy_requests_in_flight.clone()))
            .expect("metric names are unique");

        Arc::new(Self {
            requests_observed: counter(
                &registry,
                "agent_host_requests_observed_total",
                "RequestCreated events decoded from the subscription",
            ),
            requests_skipped: counter(
                &registry,
                "agent_host_requests_skipped_total",
                "Events ignored: duplicate, foreign subcommittee, or no longer pending",
            ),
            requests_handled: counter(
                &registry,
                "agent_host_requests_handled_total",
                "Requests executed to completion",
            ),
            requests_failed: counter(
                &registry,
                "agent_host_requests_failed_total",
                "Requests that failed during execution or submission",
            ),
            responses_submitted: counter(
                &registry,
                "agent_host_responses_submitted_total",
                "submitResponse transactions mined (revert status included)",
            ),
            submit_failures: counter(
                &registry,
                "agent_host_submit_failures_total",
                "Transactions that failed to send or to produce a receipt",
            ),
            heartbeats_sent: counter(
                &registry,
                "agent_host_heartbeats_sent_total",
                "heartbeatMembership transactions mined",
            ),
            containers_started: counter(
                &registry,
                "agent_host_containers_started_total",
                "Workload containers started",
            ),
            containers_reaped: counter(
                &registry,
                "agent_host_containers_reaped_total",
                "Workload containers stopped and removed",
            ),
            receipt_uploads: counter(
                &registry,
                "agent_host_receipt_uploads_total",
                "Receipts archived to the receipts service",
            ),
            receipt_upload_failures: counter(
                &registry,
                "agent_host_receipt_upload_failures_total",
                "Receipt archive attempts that failed",
            ),
            proxy_requests_total: counter(
                &registry,
                "agent_host_proxy_requests_total",
                "Requests accepted by the sandbox forward proxy",
            ),
            inference_requests_total: counter(
                &registry,
                "agent_host_inference_requests_total",
                "Requests forwarded to the inference upstream",
            ),
            proxy_requests_in_flight,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::TextEncoder;

    #[test]
    fn registry_renders_exposition_format() {
        let metrics = Metrics::new();
        metrics.requests_observed.inc();
        metrics.proxy_requests_in_flight.set(3);

        let encoder = TextEncoder::new();
        let body = encoder
            .encode_to_string(&metrics.registry().gather())
            .unwrap();
        assert!(body.contains("agent_host_requests_observed_total 1"));
        assert!(body.contains("agent_host_proxy_requests_in_flight 3"));
    }

    #[test]
    fn counters_register_without_collision() {
        // Two instances must not share state.
        let a = Metrics::new();
        let b = Metrics::new();
        a.heartbeats_sent.inc();
        assert_eq!(b.heartbeats_sent.get(), 0);
    }
}
