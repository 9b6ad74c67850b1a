//! Committee node entrypoint.
//!
//! Startup order: configuration and telemetry, preflight checks (Docker,
//! sandbox network, stale reap, firewall, determinism gate), then chain
//! plumbing (provider, submitter), sandbox proxies, workload manager,
//! heartbeater and listener, and finally the control plane. When SIGTERM or
//! SIGINT arrives, shutdown runs in reverse dependency order: stop intake
//! first, leave the committee, wind down proxies with a bounded grace
//! period, reap containers, then drain the submitter queue.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use alloy_network::EthereumWallet;
use alloy_provider::{Provider, ProviderBuilder};
use dotenvy::dotenv;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use agent_host::chain::heartbeat::Heartbeater;
use agent_host::chain::listener::{Listener, resolve_contracts};
use agent_host::chain::submitter::{GasPolicy, Submitter};
use agent_host::config::Config;
use agent_host::control::{self, ControlState};
use agent_host::metrics::Metrics;
use agent_host::receipts::ReceiptsClient;
use agent_host::sandbox::forward_proxy::ForwardProxy;
use agent_host::sandbox::inference_proxy::{self, InferenceProxyState};
use agent_host::startup;
use agent_host::util::Telemetry;
use agent_host::workload::{WorkloadManager, WorkloadSettings};

/// Budget for the proxies to finish in-flight exchanges at shutdown.
const PROXY_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Placeholder credential injected into workloads; the inference proxy swaps
/// in the real key on every forwarded request.
const WORKLOAD_API_KEY_PLACEHOLDER: &str = "proxy-managed";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = Config::load()?;
    let _telemetry = Telemetry::init(config.log_file(), config.max_log_file_size());
    let signer = Config::signing_key_from_env()?;
    let metrics = Metrics::new();

    // Preflight, including the determinism gate: nothing is reachable until
    // the host is in a known-good state.
    let preflight = startup::run_preflight(&config).await?;
    let gateway_ip: IpAddr = preflight.network.gateway.parse().map_err(|e| {
        format!(
            "sandbox gateway {} is not an IP address: {e}",
            preflight.network.gateway
        )
    })?;

    // Chain plumbing. The submitter is the only holder of the signing key.
    let wallet_address = signer.address();
    let wallet = EthereumWallet::from(signer);
    let provider = ProviderBuilder::new()
        .wallet(wallet)
        .connect_http(config.rpc_url().clone())
        .erased();
    let contracts = resolve_contracts(&provider, config.somnia_agents_contract()).await?;
    let submitter = Arc::new(
        Submitter::start(
            provider.clone(),
            wallet_address,
            GasPolicy {
                gas_limit: config.gas_limit(),
                gas_price: config.gas_price_wei(),
            },
        )
        .await?,
    );

    // Sandbox proxies on the gateway address.
    let proxy_cancel = CancellationToken::new();
    let forward_addr = SocketAddr::new(gateway_ip, config.sandbox_proxy_port());
    let forward_proxy = ForwardProxy::bind(forward_addr, Arc::clone(&metrics), None).await?;
    let forward_task = tokio::spawn(forward_proxy.run(proxy_cancel.clone()));

    let llm = config.llm_proxy().clone();
    let inference_task = if llm.enabled {
        let upstream = llm
            .upstream_url
            .clone()
            .ok_or("llmProxy.upstreamUrl is required when the inference proxy is enabled")?;
        let api_key = llm
            .api_key
            .as_ref()
            .map(|key| key.as_str().to_string())
            .unwrap_or_default();
        let state = InferenceProxyState::new(upstream, api_key, Arc::clone(&metrics));
        let addr = SocketAddr::new(gateway_ip, llm.port);
        let cancel = proxy_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(error) = inference_proxy::serve(addr, state, cancel).await {
                tracing::error!(%error, "inference proxy exited");
            }
        }))
    } else {
        None
    };

    // Environment seen by every workload container.
    let mut workload_env = vec![format!(
        "AGENT_REGISTRY_CONTRACT={}",
        contracts.agent_registry
    )];
    if llm.enabled {
        let base = format!("http://{}:{}/v1", preflight.network.gateway, llm.port);
        workload_env.push(format!("OPENAI_API_BASE={base}"));
        workload_env.push(format!("OPENAI_BASE_URL={base}"));
        workload_env.push(format!("LLM_API_BASE={base}"));
        workload_env.push(format!("OPENAI_API_KEY={WORKLOAD_API_KEY_PLACEHOLDER}"));
    }

    let workloads = WorkloadManager::new(
        preflight.docker.clone(),
        WorkloadSettings {
            cache_dir: config.cache_dir().to_path_buf(),
            start_port: config.start_port(),
            runtime: config.runtime().map(String::from),
            network_name: preflight.network.name.clone(),
            env: workload_env,
        },
        config.version_cache_ttl(),
        Arc::clone(&metrics),
    )
    .await?;

    let receipts = match config.receipts_service_url() {
        Some(base) => Some(Arc::new(ReceiptsClient::new(base, Arc::clone(&metrics))?)),
        None => None,
    };

    let heartbeater = Heartbeater::start(
        Arc::clone(&submitter),
        provider.clone(),
        contracts.committee,
        config.committee_interval(),
        Arc::clone(&metrics),
    );
    let listener = Listener::start(
        provider.clone(),
        config.rpc_url().clone(),
        contracts,
        Arc::clone(&submitter),
        Arc::clone(&workloads),
        receipts,
        Arc::clone(&metrics),
        config.max_concurrent_requests(),
    );

    let control_cancel = CancellationToken::new();
    let control_state = ControlState::new(config.api_key().map(String::from), Arc::clone(&metrics));
    let control_addr = SocketAddr::new(IpAddr::from([0u8, 0, 0, 0]), config.port());
    let control_task = tokio::spawn({
        let cancel = control_cancel.clone();
        async move {
            if let Err(error) = control::serve(control_addr, control_state, cancel).await {
                tracing::error!(%error, "control plane exited");
            }
        }
    });

    tracing::info!(
        version = control::VERSION,
        wallet = %wallet_address,
        "agent host running"
    );

    // Block until a shutdown signal arrives, then run the ordered stop below.
    // Components never watch signals themselves; they only see the explicit
    // stop calls and cancellation tokens this sequence drives.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = received, "shutdown signal received, beginning ordered stop");

    // 1. Stop taking new work.
    listener.stop().await;
    // 2. Leave the committee while the submitter is still up.
    heartbeater.stop().await;
    // 3. Proxies get a bounded grace period.
    proxy_cancel.cancel();
    let grace = tokio::time::timeout(PROXY_SHUTDOWN_GRACE, async {
        let _ = forward_task.await;
        if let Some(task) = inference_task {
            let _ = task.await;
        }
    })
    .await;
    if grace.is_err() {
        tracing::warn!("proxies did not stop within the grace period");
    }
    // 4. Reap every workload container.
    workloads.cleanup().await;
    // 5. Drain and close the transaction queue.
    submitter.stop().await;

    control_cancel.cancel();
    let _ = control_task.await;

    tracing::info!("shutdown complete");
    Ok(())
}
