//! Committee node runtime for on-chain agent workloads.
//!
//! An `agent-host` process holds one committee seat: it watches the request
//! contract for `RequestCreated` events, runs the referenced workload container
//! inside an isolated bridge network, and submits the result back on-chain.
//! Liveness is maintained with periodic heartbeat transactions.
//!
//! # Modules
//!
//! - [`chain`] — Contract surfaces, the transaction [`Submitter`](chain::submitter::Submitter),
//!   the event [`Listener`](chain::listener::Listener), and the heartbeat loop.
//! - [`config`] — JSON configuration with environment-variable resolution.
//! - [`control`] — Health / version / metrics HTTP endpoints.
//! - [`metrics`] — Prometheus counters shared across components.
//! - [`receipts`] — Best-effort archival of workload receipts.
//! - [`sandbox`] — Bridge network, egress firewall, forward proxy, and the
//!   deterministic inference proxy.
//! - [`startup`] — Ordered preflight checks that bring the host into a
//!   known-good state before any work is accepted.
//! - [`workload`] — Versioned container lifecycle and the JSON framing
//!   protocol spoken to workloads.
//! - [`util`] — Tracing setup.

pub mod chain;
pub mod config;
pub mod control;
pub mod metrics;
pub mod receipts;
pub mod sandbox;
pub mod startup;
pub mod util;
pub mod workload;
