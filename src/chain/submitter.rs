//! Serialized transaction submission.
//!
//! The [`Submitter`] is the only component that signs: it owns the wallet and
//! the local nonce counter, and processes every state-changing transaction
//! through a single worker task, strictly in submission order. Callers hand in
//! a closure that builds the unsigned transaction from prefilled
//! [`SigningOptions`] and block on a per-job result channel.
//!
//! Nonce discipline: the local counter advances only when a send succeeded
//! *and* a receipt arrived — revert receipts included, since the network
//! consumes the nonce regardless of revert status. On any failure the counter
//! is re-synced from the RPC pending nonce, conservatively keeping
//! `max(local, pending)`.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256};
use alloy_provider::{DynProvider, PendingTransactionError, Provider};
use alloy_rpc_types_eth::{TransactionReceipt, TransactionRequest};
use alloy_transport::TransportError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Queue depth before `submit` callers start blocking on enqueue.
const QUEUE_DEPTH: usize = 64;

/// Fixed gas policy applied to every job. Underpriced replacement is not
/// attempted; callers retry with a fresh submit if they want.
#[derive(Debug, Clone, Copy)]
pub struct GasPolicy {
    pub gas_limit: u64,
    pub gas_price: u128,
}

/// Signing options prefilled by the worker and handed to the build closure.
#[derive(Debug, Clone, Copy)]
pub struct SigningOptions {
    pub from: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub chain_id: u64,
}

/// Result of a successfully mined submission.
///
/// A receipt with revert status is still a successful submission: the
/// transaction was mined and the nonce consumed. Callers inspect
/// [`SubmitOutcome::reverted`] to decide whether to surface the revert.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub tx_hash: B256,
    pub receipt: TransactionReceipt,
}

impl SubmitOutcome {
    pub fn reverted(&self) -> bool {
        !self.receipt.status()
    }
}

/// Errors surfaced to submit callers.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("submit queue is closed")]
    QueueClosed,
    #[error("transaction send failed: {0}")]
    Send(#[from] TransportError),
    #[error("receipt wait failed: {0}")]
    Receipt(#[from] PendingTransactionError),
}

type BuildFn = Box<dyn FnOnce(SigningOptions) -> TransactionRequest + Send>;

struct Job {
    name: String,
    deadline: Option<Duration>,
    build: BuildFn,
    reply: oneshot::Sender<Result<SubmitOutcome, SubmitError>>,
}

/// Handle to the single-worker submission queue.
///
/// Cheap to share behind an `Arc`; the wallet key lives inside the provider's
/// signing layer and is never exposed through this handle.
pub struct Submitter {
    address: Address,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Submitter {
    /// Fetches the pending nonce and spawns the worker task.
    pub async fn start(
        provider: DynProvider,
        address: Address,
        gas: GasPolicy,
    ) -> Result<Self, SubmitError> {
        let chain_id = provider.get_chain_id().await?;
        let nonce = provider.get_transaction_count(address).pending().await?;
        tracing::info!(%address, chain_id, nonce, "starting transaction submitter");

        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let mut worker = Worker {
            provider,
            address,
            gas,
            chain_id,
            nonce,
        };
        let handle = tokio::spawn(async move { worker.run(receiver).await });

        Ok(Self {
            address,
            jobs: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// The wallet address transactions are sent from.
    pub fn wallet_address(&self) -> Address {
        self.address
    }

    /// Enqueues a transaction and waits for it to be mined.
    ///
    /// `build` receives prefilled signing options and returns the unsigned
    /// transaction; the worker re-applies the options afterwards, so a closure
    /// cannot escape the nonce discipline. `deadline` bounds the receipt wait;
    /// `None` waits until the transaction is mined or the send fails.
    pub async fn submit<F>(
        &self,
        name: impl Into<String>,
        deadline: Option<Duration>,
        build: F,
    ) -> Result<SubmitOutcome, SubmitError>
    where
        F: FnOnce(SigningOptions) -> TransactionRequest + Send + 'static,
    {
        let sender = {
            let guard = self.jobs.lock().expect("submitter queue lock poisoned");
            guard.clone().ok_or(SubmitError::QueueClosed)?
        };
        let (reply, result) = oneshot::channel();
        sender
            .send(Job {
                name: name.into(),
                deadline,
                build: Box::new(build),
                reply,
            })
            .await
            .map_err(|_| SubmitError::QueueClosed)?;
        result.await.map_err(|_| SubmitError::QueueClosed)?
    }

    /// Closes the queue, waits for queued jobs to drain, and stops the worker.
    ///
    /// Subsequent submits return [`SubmitError::QueueClosed`].
    pub async fn stop(&self) {
        let sender = self
            .jobs
            .lock()
            .expect("submitter queue lock poisoned")
            .take();
        drop(sender);
        let handle = self
            .worker
            .lock()
            .expect("submitter worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "submitter worker ended abnormally");
            }
        }
    }
}

struct Worker {
    provider: DynProvider,
    address: Address,
    gas: GasPolicy,
    chain_id: u64,
    nonce: u64,
}

impl Worker {
    async fn run(&mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            self.process(job).await;
        }
        tracing::info!("submitter queue drained");
    }

    async fn process(&mut self, job: Job) {
        let name = job.name;
        let options = SigningOptions {
            from: self.address,
            nonce: self.nonce,
            gas_limit: self.gas.gas_limit,
            gas_price: self.gas.gas_price,
            chain_id: self.chain_id,
        };
        let request = finalize_request((job.build)(options), options);

        let pending = match self.provider.send_transaction(request).await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::warn!(job = %name, %error, "transaction send failed");
                self.resync_nonce().await;
                let _ = job.reply.send(Err(SubmitError::Send(error)));
                return;
            }
        };
        let tx_hash = *pending.tx_hash();

        let receipt = match pending.with_timeout(job.deadline).get_receipt().await {
            Ok(receipt) => receipt,
            Err(error) => {
                tracing::warn!(job = %name, tx = %tx_hash, %error, "receipt wait failed");
                self.resync_nonce().await;
                let _ = job.reply.send(Err(SubmitError::Receipt(error)));
                return;
            }
        };

        // A receipt means the nonce is consumed, revert status included.
        self.nonce += 1;
        let outcome = SubmitOutcome { tx_hash, receipt };
        if outcome.reverted() {
            tracing::warn!(job = %name, tx = %tx_hash, "transaction reverted");
        } else {
            tracing::info!(job = %name, tx = %tx_hash, nonce = options.nonce, "transaction mined");
        }
        let _ = job.reply.send(Ok(outcome));
    }

    async fn resync_nonce(&mut self) {
        match self
            .provider
            .get_transaction_count(self.address)
            .pending()
            .await
        {
            Ok(pending) => {
                let resynced = resynced_nonce(self.nonce, pending);
                if resynced != self.nonce {
                    tracing::info!(local = self.nonce, pending, resynced, "nonce re-synced");
                }
                self.nonce = resynced;
            }
            Err(error) => {
                tracing::warn!(%error, "pending nonce re-sync failed, keeping local counter");
            }
        }
    }
}

/// Re-applies the signing options after the build closure ran, so jobs cannot
/// diverge from the worker's nonce and gas policy.
fn finalize_request(request: TransactionRequest, options: SigningOptions) -> TransactionRequest {
    request
        .with_from(options.from)
        .with_nonce(options.nonce)
        .with_gas_limit(options.gas_limit)
        .with_gas_price(options.gas_price)
        .with_chain_id(options.chain_id)
}

/// A lagging gateway may report a pending nonce below the local counter;
/// taking the max never reuses a consumed nonce.
fn resynced_nonce(local: u64, pending: u64) -> u64 {
    local.max(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, U256, address};

    #[test]
    fn finalize_overrides_job_supplied_fields() {
        let options = SigningOptions {
            from: address!("1111111111111111111111111111111111111111"),
            nonce: 7,
            gas_limit: 5_000_000,
            gas_price: 10_000_000_000,
            chain_id: 50312,
        };
        let rogue = TransactionRequest::default()
            .with_nonce(999)
            .with_gas_limit(1)
            .with_chain_id(1)
            .with_value(U256::from(3))
            .with_input(Bytes::from_static(b"\x01\x02"));

        let finalized = finalize_request(rogue, options);
        assert_eq!(finalized.nonce, Some(7));
        assert_eq!(finalized.gas, Some(5_000_000));
        assert_eq!(finalized.gas_price, Some(10_000_000_000));
        assert_eq!(finalized.chain_id, Some(50312));
        assert_eq!(finalized.from, Some(options.from));
        // Caller-controlled fields survive.
        assert_eq!(finalized.value, Some(U256::from(3)));
    }

    #[test]
    fn resync_keeps_the_larger_nonce() {
        assert_eq!(resynced_nonce(10, 4), 10);
        assert_eq!(resynced_nonce(4, 10), 10);
        assert_eq!(resynced_nonce(5, 5), 5);
    }
}
