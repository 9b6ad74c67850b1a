//! Periodic committee liveness transactions.
//!
//! A ticker loop submits `heartbeatMembership()` through the [`Submitter`]
//! once immediately and then at the configured interval. On stop, if the
//! contract still reports this wallet active, a best-effort
//! `leaveMembership()` is submitted with a bounded deadline so shutdown can
//! not hang on a stuck receipt.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, Bytes};
use alloy_provider::DynProvider;
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::SolCall;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::chain::Committee;
use crate::chain::submitter::Submitter;
use crate::metrics::Metrics;

/// Budget for the leave transaction during shutdown.
const LEAVE_DEADLINE: Duration = Duration::from_secs(30);

pub struct Heartbeater {
    submitter: Arc<Submitter>,
    provider: DynProvider,
    committee: Address,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeater {
    /// Spawns the heartbeat loop. The first beat fires immediately.
    pub fn start(
        submitter: Arc<Submitter>,
        provider: DynProvider,
        committee: Address,
        period: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let loop_submitter = Arc::clone(&submitter);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match beat(&loop_submitter, committee).await {
                    Ok(()) => metrics.heartbeats_sent.inc(),
                    Err(error) => {
                        metrics.submit_failures.inc();
                        tracing::warn!(%error, "heartbeat failed");
                    }
                }
            }
            tracing::info!("heartbeat loop stopped");
        });

        Self {
            submitter,
            provider,
            committee,
            cancel,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Stops the ticker and attempts a graceful leave when still active.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .worker
            .lock()
            .expect("heartbeater worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let contract = Committee::new(self.committee, &self.provider);
        let wallet = self.submitter.wallet_address();
        match contract.isActive(wallet).call().await {
            Ok(true) => {
                let committee = self.committee;
                let result = self
                    .submitter
                    .submit("leaveMembership", Some(LEAVE_DEADLINE), move |_| {
                        TransactionRequest::default()
                            .with_to(committee)
                            .with_input(Bytes::from(
                                Committee::leaveMembershipCall {}.abi_encode(),
                            ))
                    })
                    .await;
                match result {
                    Ok(outcome) if outcome.reverted() => {
                        tracing::warn!(tx = %outcome.tx_hash, "leaveMembership reverted");
                    }
                    Ok(outcome) => {
                        tracing::info!(tx = %outcome.tx_hash, "left committee membership");
                    }
                    Err(error) => tracing::warn!(%error, "leaveMembership failed"),
                }
            }
            Ok(false) => {
                tracing::info!("not an active committee member, skipping leave");
            }
            Err(error) => {
                tracing::warn!(%error, "isActive check failed, skipping leave");
            }
        }
    }
}

async fn beat(
    submitter: &Submitter,
    committee: Address,
) -> Result<(), crate::chain::submitter::SubmitError> {
    let outcome = submitter
        .submit("heartbeatMembership", None, move |_| {
            TransactionRequest::default()
                .with_to(committee)
                .with_input(Bytes::from(
                    Committee::heartbeatMembershipCall {}.abi_encode(),
                ))
        })
        .await?;
    if outcome.reverted() {
        tracing::warn!(tx = %outcome.tx_hash, "heartbeat reverted");
    }
    Ok(())
}
