//! Ordered preflight checks.
//!
//! Startup runs a fixed sequence that brings the host into a known-good
//! state: Docker reachability, sandbox network, stale container reap,
//! firewall rules, and the inference determinism gate. A fatal failure aborts
//! with a remediation message; the full pass/fail list is logged as a summary
//! either way. Stale-container cleanup is the one check where partial failure
//! is only a warning.

use bollard::Docker;

use crate::config::Config;
use crate::sandbox::firewall::{self, FirewallStatus};
use crate::sandbox::inference_proxy;
use crate::sandbox::network::{self, NetworkInfo};
use crate::workload::manager::WorkloadManager;

/// Outcome of a single preflight check.
#[derive(Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    /// Underlying failure text for non-fatal checks, when one exists.
    pub error: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            message: message.into(),
            error: None,
        }
    }

    fn warn(name: &'static str, message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            error,
        }
    }
}

/// Fatal preflight failure, carrying remediation text for the operator.
#[derive(Debug, thiserror::Error)]
#[error("startup check '{check}' failed: {message}\nremediation: {remediation}")]
pub struct StartupError {
    pub check: &'static str,
    pub message: String,
    pub remediation: &'static str,
}

/// Everything later components need from a successful preflight.
pub struct Preflight {
    pub docker: Docker,
    pub network: NetworkInfo,
    pub results: Vec<CheckResult>,
}

pub async fn run_preflight(config: &Config) -> Result<Preflight, StartupError> {
    let mut results = Vec::new();

    // 1. Docker reachable: negotiate the API version, then ping.
    let docker = connect_docker().await.map_err(|message| StartupError {
        check: "docker",
        message,
        remediation: "ensure the Docker daemon is running and the socket is accessible to this user",
    })?;
    results.push(CheckResult::pass("docker", "daemon reachable"));

    // 2. Sandbox network: create or validate.
    let network = network::ensure_network(&docker, config.sandbox_network())
        .await
        .map_err(|error| StartupError {
            check: "sandbox-network",
            message: error.to_string(),
            remediation: "remove or fix the conflicting Docker network, or change sandboxNetwork in the config",
        })?;
    results.push(CheckResult::pass(
        "sandbox-network",
        format!("{} ({} via {})", network.name, network.subnet, network.gateway),
    ));

    // 3. Stale container reap. Partial failures are warnings, not fatal.
    match WorkloadManager::reap_labeled(&docker).await {
        Ok(reaped) => {
            results.push(CheckResult::pass(
                "stale-containers",
                format!("removed {reaped} leftover container(s)"),
            ));
        }
        Err(error) => {
            tracing::warn!(%error, "stale container cleanup incomplete");
            results.push(CheckResult::warn(
                "stale-containers",
                "cleanup incomplete",
                Some(error.to_string()),
            ));
        }
    }

    // 4. Firewall rules, only when enabled. A missing toolkit downgrades to
    // skipped; a rejected rule is fatal.
    if config.enable_firewall() {
        let mut allow_ports = vec![config.sandbox_proxy_port()];
        if config.llm_proxy().enabled {
            allow_ports.push(config.llm_proxy().port);
        }
        match firewall::apply(&network.subnet, &network.gateway, &allow_ports).await {
            Ok(FirewallStatus::Applied { inserted, total }) => {
                results.push(CheckResult::pass(
                    "firewall",
                    format!("{total} rule(s) in place, {inserted} inserted"),
                ));
            }
            Ok(FirewallStatus::Skipped { reason }) => {
                tracing::warn!(%reason, "FIREWALL SKIPPED: sandboxed workloads are NOT network-isolated");
                results.push(CheckResult::warn(
                    "firewall",
                    format!("skipped: {reason}"),
                    None,
                ));
            }
            Err(error) => {
                return Err(StartupError {
                    check: "firewall",
                    message: error.to_string(),
                    remediation: "inspect the iptables error; the node refuses to run with a partially installed rule set",
                });
            }
        }
    } else {
        results.push(CheckResult::pass("firewall", "disabled by configuration"));
    }

    // 5. Inference determinism gate.
    let llm = config.llm_proxy();
    if llm.enabled && !config.disable_llm_validation() {
        let upstream = llm.upstream_url.as_ref().ok_or_else(|| StartupError {
            check: "inference-determinism",
            message: "llmProxy.upstreamUrl is not configured".to_string(),
            remediation: "set llmProxy.upstreamUrl, or disable the proxy",
        })?;
        let api_key = llm.api_key.as_ref().map(|k| k.as_str()).unwrap_or("");
        inference_proxy::validate_determinism(upstream, api_key)
            .await
            .map_err(|error| StartupError {
                check: "inference-determinism",
                message: error.to_string(),
                remediation: "the upstream must return byte-identical completions for fixed prompt and seed; point the node at a deterministic inference service",
            })?;
        results.push(CheckResult::pass(
            "inference-determinism",
            format!("{} model(s) verified", inference_proxy::MODEL_ALLOWLIST.len()),
        ));
    } else if llm.enabled {
        tracing::warn!("inference determinism validation disabled");
        results.push(CheckResult::pass(
            "inference-determinism",
            "validation disabled",
        ));
    }

    log_summary(&results);
    Ok(Preflight {
        docker,
        network,
        results,
    })
}

async fn connect_docker() -> Result<Docker, String> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| e.to_string())?;
    let docker = docker.negotiate_version().await.map_err(|e| e.to_string())?;
    docker.ping().await.map_err(|e| e.to_string())?;
    Ok(docker)
}

fn log_summary(results: &[CheckResult]) {
    let passed = results.iter().filter(|r| r.passed).count();
    tracing::info!("startup checks: {passed}/{} passed", results.len());
    for result in results {
        if result.passed {
            tracing::info!(check = result.name, "  ok: {}", result.message);
        } else if let Some(error) = &result.error {
            tracing::warn!(check = result.name, "  warn: {}: {}", result.message, error);
        } else {
            tracing::warn!(check = result.name, "  warn: {}", result.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_results_carry_status() {
        let pass = CheckResult::pass("docker", "daemon reachable");
        let warn = CheckResult::warn("firewall", "skipped: iptables not found", None);
        assert!(pass.passed);
        assert!(pass.error.is_none());
        assert!(!warn.passed);
        assert!(warn.message.starts_with("skipped"));

        let partial = CheckResult::warn(
            "stale-containers",
            "cleanup incomplete",
            Some("container xyz in use".to_string()),
        );
        assert_eq!(partial.error.as_deref(), Some("container xyz in use"));
    }

    #[test]
    fn startup_error_includes_remediation() {
        let error = StartupError {
            check: "docker",
            message: "connection refused".to_string(),
            remediation: "ensure the Docker daemon is running and the socket is accessible to this user",
        };
        let text = error.to_string();
        assert!(text.contains("docker"));
        assert!(text.contains("remediation"));
    }
}
