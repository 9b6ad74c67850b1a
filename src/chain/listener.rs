//! Request event subscription and dispatch.
//!
//! The listener owns the WebSocket subscription to `RequestCreated` logs and
//! drives the whole per-request pipeline: dedupe, subcommittee membership,
//! pending check, registry lookup, workload execution, receipt archival, and
//! response submission. The subscription itself is wrapped in an explicit
//! outer loop — subscribe, drain until the stream errors, sleep, reconnect —
//! driven by one cancellation token.
//!
//! Per-request work runs on its own task, bounded by a semaphore; the only
//! serialization point is the submitter queue.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy_rpc_types_eth::{BlockId, Filter, TransactionRequest};
use alloy_sol_types::{SolCall, SolEvent};
use dashmap::DashSet;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::chain::submitter::{SubmitError, Submitter};
use crate::chain::{AgentRegistry, SomniaAgents, replay_revert_reason, ws_rpc_url};
use crate::metrics::Metrics;
use crate::receipts::ReceiptsClient;
use crate::workload::manager::{WorkloadError, WorkloadManager};

/// Wait between subscription reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Contract addresses resolved from the configured entry point.
#[derive(Debug, Clone, Copy)]
pub struct ContractAddresses {
    pub somnia_agents: Address,
    pub agent_registry: Address,
    pub committee: Address,
}

/// Reads the registry and committee pointers from the request contract, so
/// only one address needs to be configured.
pub async fn resolve_contracts(
    provider: &DynProvider,
    somnia_agents: Address,
) -> Result<ContractAddresses, alloy_contract::Error> {
    let contract = SomniaAgents::new(somnia_agents, provider);
    let agent_registry = contract.agentRegistry().call().await?;
    let committee = contract.committee().call().await?;
    tracing::info!(%somnia_agents, %agent_registry, %committee, "resolved contract addresses");
    Ok(ContractAddresses {
        somnia_agents,
        agent_registry,
        committee,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid websocket url: {0}")]
    WsUrl(#[from] url::ParseError),
    #[error("rpc failure: {0}")]
    Rpc(#[from] alloy_transport::TransportError),
    #[error("contract call failed: {0}")]
    Contract(#[from] alloy_contract::Error),
    #[error("log stream closed by remote")]
    StreamClosed,
    #[error("agent {0} has no container image uri")]
    NoContainerImage(U256),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// How a request event left the pipeline. Skips are normal operation.
enum Disposition {
    Submitted,
    Skipped(&'static str),
}

pub struct Listener {
    ctx: Arc<ListenerCtx>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct ListenerCtx {
    provider: DynProvider,
    rpc_url: Url,
    contracts: ContractAddresses,
    wallet: Address,
    submitter: Arc<Submitter>,
    workloads: Arc<WorkloadManager>,
    receipts: Option<Arc<ReceiptsClient>>,
    metrics: Arc<Metrics>,
    limiter: Arc<Semaphore>,
    seen: DashSet<(B256, U256)>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        provider: DynProvider,
        rpc_url: Url,
        contracts: ContractAddresses,
        submitter: Arc<Submitter>,
        workloads: Arc<WorkloadManager>,
        receipts: Option<Arc<ReceiptsClient>>,
        metrics: Arc<Metrics>,
        max_concurrent_requests: usize,
    ) -> Self {
        let wallet = submitter.wallet_address();
        let ctx = Arc::new(ListenerCtx {
            provider,
            rpc_url,
            contracts,
            wallet,
            submitter,
            workloads,
            receipts,
            metrics,
            limiter: Arc::new(Semaphore::new(max_concurrent_requests)),
            seen: DashSet::new(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });

        let loop_ctx = Arc::clone(&ctx);
        let handle = tokio::spawn(async move { subscription_loop(loop_ctx).await });

        Self {
            ctx,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Stops accepting new events, then waits for in-flight request tasks.
    /// Their blocking calls are individually bounded, so the wait is too.
    pub async fn stop(&self) {
        self.ctx.cancel.cancel();
        let handle = self
            .worker
            .lock()
            .expect("listener worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;
    }
}

async fn subscription_loop(ctx: Arc<ListenerCtx>) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match run_subscription(&ctx).await {
            Ok(()) => break, // cancelled while draining
            Err(error) => {
                tracing::warn!(%error, "request subscription ended, reconnecting");
            }
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    tracing::info!("request listener stopped");
}

async fn run_subscription(ctx: &Arc<ListenerCtx>) -> Result<(), ListenerError> {
    let ws_url = ws_rpc_url(&ctx.rpc_url)?;
    let ws_provider = ProviderBuilder::new()
        .connect_ws(WsConnect::new(ws_url.as_str()))
        .await?;
    let filter = Filter::new()
        .address(ctx.contracts.somnia_agents)
        .event_signature(SomniaAgents::RequestCreated::SIGNATURE_HASH);
    let subscription = ws_provider.subscribe_logs(&filter).await?;
    let mut stream = subscription.into_stream();
    tracing::info!(url = %ws_url, "subscribed to RequestCreated");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            log = stream.next() => {
                let log = log.ok_or(ListenerError::StreamClosed)?;
                dispatch(ctx, log);
            }
        }
    }
}

fn dispatch(ctx: &Arc<ListenerCtx>, log: alloy_rpc_types_eth::Log) {
    ctx.metrics.requests_observed.inc();
    if log.removed {
        // Reorged-out delivery. The canonical block's copy arrives separately.
        ctx.metrics.requests_skipped.inc();
        tracing::debug!(tx_hash = ?log.transaction_hash, "dropping reorg-removed log");
        return;
    }
    let tx_hash = log.transaction_hash.unwrap_or_default();
    let decoded = match log.log_decode::<SomniaAgents::RequestCreated>() {
        Ok(decoded) => decoded,
        Err(error) => {
            tracing::warn!(%error, "undecodable RequestCreated log");
            return;
        }
    };
    let event = decoded.inner.data;
    let request_id = event.requestId;

    if !ctx.seen.insert((tx_hash, request_id)) {
        ctx.metrics.requests_skipped.inc();
        tracing::debug!(%request_id, %tx_hash, "duplicate event dropped");
        return;
    }
    if !event.subcommittee.contains(&ctx.wallet) {
        ctx.metrics.requests_skipped.inc();
        tracing::debug!(%request_id, "not in subcommittee, ignoring");
        return;
    }

    let task_ctx = Arc::clone(ctx);
    ctx.tasks.spawn(async move {
        let permit = tokio::select! {
            _ = task_ctx.cancel.cancelled() => return,
            permit = Arc::clone(&task_ctx.limiter).acquire_owned() => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed, shutting down
        };
        match handle_request(&task_ctx, &event).await {
            Ok(Disposition::Submitted) => task_ctx.metrics.requests_handled.inc(),
            Ok(Disposition::Skipped(reason)) => {
                task_ctx.metrics.requests_skipped.inc();
                tracing::info!(%request_id, reason, "request skipped");
            }
            Err(error) => {
                if matches!(error, ListenerError::Submit(_)) {
                    task_ctx.metrics.submit_failures.inc();
                }
                task_ctx.metrics.requests_failed.inc();
                tracing::warn!(%request_id, %error, "request handling failed");
            }
        }
    });
}

async fn handle_request(
    ctx: &ListenerCtx,
    event: &SomniaAgents::RequestCreated,
) -> Result<Disposition, ListenerError> {
    let request_id = event.requestId;
    let somnia = SomniaAgents::new(ctx.contracts.somnia_agents, &ctx.provider);
    if !somnia.isRequestPending(request_id).call().await? {
        return Ok(Disposition::Skipped("no longer pending"));
    }

    let registry = AgentRegistry::new(ctx.contracts.agent_registry, &ctx.provider);
    let agent = registry.getAgent(event.agentId).call().await?;
    if agent.containerImageUri.is_empty() {
        return Err(ListenerError::NoContainerImage(event.agentId));
    }

    let rid = format!("blockchain-{request_id}");
    tracing::info!(%request_id, agent_id = %event.agentId, url = %agent.containerImageUri, "executing request");
    let reply = ctx
        .workloads
        .forward(&agent.containerImageUri, &rid, &event.payload)
        .await?;

    if let (Some(receipts), Some(receipt)) = (&ctx.receipts, reply.receipt.clone()) {
        // Archival is best-effort and must never hold up the response.
        let receipts = Arc::clone(receipts);
        let rid = rid.clone();
        tokio::spawn(async move { receipts.upload(&rid, &receipt).await });
    }

    if !somnia.isRequestPending(request_id).call().await? {
        return Ok(Disposition::Skipped("resolved while executing"));
    }

    let call = SomniaAgents::submitResponseCall {
        requestId: request_id,
        result: Bytes::from(reply.result),
        receipt: U256::ZERO,
        price: agent.cost,
    };
    let input = Bytes::from(call.abi_encode());
    let to = ctx.contracts.somnia_agents;
    let request = TransactionRequest::default().with_to(to).with_input(input);
    let replay = request.clone();

    let outcome = ctx
        .submitter
        .submit(format!("submitResponse({request_id})"), None, move |_| {
            request
        })
        .await?;
    ctx.metrics.responses_submitted.inc();

    if outcome.reverted() {
        let block = outcome
            .receipt
            .block_number
            .map(BlockId::from)
            .unwrap_or(BlockId::latest());
        let replay = replay.with_from(ctx.wallet);
        match replay_revert_reason(&ctx.provider, replay, block).await {
            Some(reason) => {
                tracing::warn!(%request_id, reason = %reason, "submitResponse reverted");
            }
            None => {
                tracing::warn!(%request_id, "submitResponse reverted, no reason recovered");
            }
        }
    }

    Ok(Disposition::Submitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_delivery_key_is_rejected_once() {
        let seen: DashSet<(B256, U256)> = DashSet::new();
        let key = (B256::repeat_byte(0xab), U256::from(42));
        assert!(seen.insert(key));
        assert!(!seen.insert(key));
        // The same request id in a different transaction is a distinct delivery.
        assert!(seen.insert((B256::repeat_byte(0xcd), U256::from(42))));
    }

    #[test]
    fn membership_is_exact_address_equality() {
        let node = Address::repeat_byte(0x11);
        let other = Address::repeat_byte(0x22);
        assert!(vec![other, node].contains(&node));
        assert!(!vec![other].contains(&node));
    }

    #[test]
    fn submit_response_calldata_round_trips() {
        let call = SomniaAgents::submitResponseCall {
            requestId: U256::from(42),
            result: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            receipt: U256::ZERO,
            price: U256::ZERO,
        };
        let encoded = call.abi_encode();
        let decoded = SomniaAgents::submitResponseCall::abi_decode(&encoded).unwrap();
        assert_eq!(decoded.requestId, U256::from(42));
        assert_eq!(decoded.result.as_ref(), [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decoded.receipt, U256::ZERO);
        assert_eq!(decoded.price, U256::ZERO);
    }

    #[test]
    fn request_id_header_value_shape() {
        let request_id = U256::from(42);
        assert_eq!(format!("blockchain-{request_id}"), "blockchain-42");
    }
}
