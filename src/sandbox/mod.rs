//! Workload network isolation.
//!
//! Sandboxed containers live on a dedicated bridge network with explicit IPAM,
//! so the gateway address they see is deterministic. With the firewall
//! enabled, the only egress they have is `gateway:allowlist` — the forward
//! proxy and, when configured, the inference proxy. Everything else sourced
//! from the sandbox subnet is dropped, including lateral traffic between
//! workloads.
//!
//! - [`network`] — bridge creation / validation
//! - [`firewall`] — packet-filter rule set and idempotent install
//! - [`forward_proxy`] — HTTP/HTTPS egress proxy on the gateway
//! - [`inference_proxy`] — authenticated, determinism-gated LLM proxy

pub mod firewall;
pub mod forward_proxy;
pub mod inference_proxy;
pub mod network;

pub use network::NetworkInfo;
