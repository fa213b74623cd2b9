//! Reporter core: the reporting-transaction queue and its serializer.
//!
//! Every chain write this process makes flows through one bounded channel
//! drained by one sender task, so at most one transaction is in flight at
//! any instant and nonce management stays sequential. Producers (the
//! message consumer, the event subscriber, the store dispatcher) hold a
//! narrow [`ReporterHandle`] rather than a reference to the core.

pub mod events;
pub mod mq;
pub mod store;
pub mod verify;

use crate::chain::{abi, ChainClient, ChainError};
use crate::reporter::store::MarketItemStore;
use crate::reporter::verify::VerifierClient;
use alloy::primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Capacity of the reporting-transaction channel.
pub const REPORTING_TX_BUFFER: usize = 100;

/// Retry budget for one dispatched transaction.
const MAX_TX_TRIES: u64 = 4;
/// Base gas price in wei; attempt n bids (n+1) times this.
const TX_GAS_PRICE_WEI: u128 = 1_000_000_000;
const TX_GAS_LIMIT: u64 = 1_000_000;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bus payload: `{"marketHash": "0x…64 hex…", "outcome": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "marketHash")]
    pub market_hash: B256,
    pub outcome: i32,
}

/// One queued chain write.
///
/// A `Vote` exists only after the verifier resolved an outcome, and a
/// `Report` carries none, so an unresolved outcome cannot reach the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportingTx {
    Propose { market_hash: B256, outcome: u8 },
    Vote { market_hash: B256, outcome: u8 },
    Report { market_hash: B256 },
}

impl ReportingTx {
    /// On-chain function name, for logs.
    pub fn function_name(&self) -> &'static str {
        match self {
            ReportingTx::Propose { .. } => "proposeOutcome",
            ReportingTx::Vote { .. } => "voteOutcome",
            ReportingTx::Report { .. } => "reportOutcome",
        }
    }

    pub fn market_hash(&self) -> B256 {
        match *self {
            ReportingTx::Propose { market_hash, .. }
            | ReportingTx::Vote { market_hash, .. }
            | ReportingTx::Report { market_hash } => market_hash,
        }
    }

    fn calldata(&self) -> Bytes {
        match *self {
            ReportingTx::Propose {
                market_hash,
                outcome,
            } => abi::propose_outcome_call(market_hash, outcome),
            ReportingTx::Vote {
                market_hash,
                outcome,
            } => abi::vote_outcome_call(market_hash, outcome),
            ReportingTx::Report { market_hash } => abi::report_outcome_call(market_hash),
        }
    }
}

/// Enqueue capability handed to the producer tasks.
#[derive(Clone)]
pub struct ReporterHandle {
    queue: mpsc::Sender<ReportingTx>,
    verifier: VerifierClient,
}

impl ReporterHandle {
    pub fn new(queue: mpsc::Sender<ReportingTx>, verifier: VerifierClient) -> Self {
        Self { queue, verifier }
    }

    /// Queue a proposal straight from the bus. The outcome is proposed as
    /// received: the protocol trusts bus producers for proposals and
    /// verifies only before voting.
    pub async fn propose(&self, market_hash: B256, outcome: u8) {
        self.enqueue(ReportingTx::Propose {
            market_hash,
            outcome,
        })
        .await;
    }

    /// Verify the market and queue a vote. The oracle call runs on the
    /// calling producer task so a slow oracle can never stall the sender;
    /// a failed verification drops the vote.
    pub async fn vote(&self, market_hash: B256) {
        match self.verifier.verify(market_hash).await {
            Ok(outcome) => {
                self.enqueue(ReportingTx::Vote {
                    market_hash,
                    outcome,
                })
                .await
            }
            Err(err) => {
                error!(
                    market = %market_hash,
                    error = %err,
                    "error verifying market, skipping vote tx"
                );
            }
        }
    }

    /// Queue the finalizing report for a market whose voting period ended.
    pub async fn report(&self, market_hash: B256) {
        self.enqueue(ReportingTx::Report { market_hash }).await;
    }

    async fn enqueue(&self, tx: ReportingTx) {
        debug!(
            function = tx.function_name(),
            market = %tx.market_hash(),
            "queueing reporting tx"
        );
        if self.queue.send(tx).await.is_err() {
            debug!("reporting channel closed, dropping tx");
        }
    }
}

/// The narrow chain surface the sender drives. Implemented by
/// [`ChainClient`]; tests substitute scripted fakes.
pub trait ChainWriter: Send + Sync + 'static {
    /// Current transaction count of the reporter address (the nonce source
    /// of truth).
    fn transaction_count(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Sign and submit a transaction, returning its hash.
    fn submit(
        &self,
        to: Address,
        input: Bytes,
        gas_price: u128,
        gas_limit: u64,
        nonce: u64,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Receipt status of a submitted transaction, `None` while pending.
    fn receipt_status(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<bool>, ChainError>> + Send;
}

impl ChainWriter for ChainClient {
    async fn transaction_count(&self) -> Result<u64, ChainError> {
        ChainClient::transaction_count(self).await
    }

    async fn submit(
        &self,
        to: Address,
        input: Bytes,
        gas_price: u128,
        gas_limit: u64,
        nonce: u64,
    ) -> Result<B256, ChainError> {
        ChainClient::submit(self, to, input, gas_price, gas_limit, nonce).await
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>, ChainError> {
        Ok(self.receipt(tx_hash).await?.map(|receipt| receipt.status()))
    }
}

/// The serializer: drains the reporting queue one transaction at a time.
pub struct TxSender<C: ChainWriter> {
    chain: Arc<C>,
    store: Arc<MarketItemStore>,
    sx_node: Address,
    queue: mpsc::Receiver<ReportingTx>,
    shutdown: watch::Receiver<bool>,
}

impl<C: ChainWriter> TxSender<C> {
    pub fn new(
        chain: Arc<C>,
        store: Arc<MarketItemStore>,
        sx_node: Address,
        queue: mpsc::Receiver<ReportingTx>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain,
            store,
            sx_node,
            queue,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                next = self.queue.recv() => match next {
                    Some(tx) => {
                        debug!(
                            function = tx.function_name(),
                            market = %tx.market_hash(),
                            "processing reporting tx"
                        );
                        self.send_tx_with_retry(tx).await;
                    }
                    None => break,
                },
            }
        }

        debug!("tx sender stopped");
    }

    /// Submit with up to [`MAX_TX_TRIES`] attempts, bumping the gas price
    /// each try and refreshing the nonce after "nonce too low" rejections
    /// and failed receipts. A Report that succeeds or exhausts its budget
    /// removes the market from the store; every other exit leaves the store
    /// untouched so the dispatcher re-emits the market on its next scan.
    async fn send_tx_with_retry(&mut self, tx: ReportingTx) {
        let function = tx.function_name();
        let market_hash = tx.market_hash();
        let input = tx.calldata();

        let mut curr_nonce = match self.chain.transaction_count().await {
            Ok(nonce) => nonce,
            Err(err) => {
                error!(
                    function,
                    market = %market_hash,
                    error = %err,
                    "failed to fetch nonce, abandoning dispatch"
                );
                return;
            }
        };

        let mut tx_try: u64 = 0;
        while tx_try < MAX_TX_TRIES {
            if *self.shutdown.borrow() {
                return;
            }

            let gas_price = (tx_try as u128 + 1) * TX_GAS_PRICE_WEI;

            debug!(
                function,
                nonce = curr_nonce,
                tx_try,
                market = %market_hash,
                "attempting tx"
            );

            let tx_hash = match self
                .chain
                .submit(self.sx_node, input.clone(), gas_price, TX_GAS_LIMIT, curr_nonce)
                .await
            {
                Ok(tx_hash) => tx_hash,
                Err(err) if err.is_nonce_too_low() => {
                    debug!(
                        function,
                        tx_try,
                        nonce = curr_nonce,
                        market = %market_hash,
                        "nonce too low, retrying with refreshed nonce"
                    );
                    match self.refresh_nonce().await {
                        Some(nonce) => curr_nonce = nonce,
                        None => return,
                    }
                    tx_try += 1;
                    continue;
                }
                Err(err) => {
                    error!(
                        function,
                        error = %err,
                        tx_try,
                        nonce = curr_nonce,
                        market = %market_hash,
                        "failed to send tx due to non-recoverable error"
                    );
                    return;
                }
            };

            debug!(
                function,
                tx_hash = %tx_hash,
                nonce = curr_nonce,
                market = %market_hash,
                "sent tx"
            );

            let Some(success) = self.wait_tx_confirmed(tx_hash).await else {
                return; // shutting down
            };

            if success {
                debug!(
                    function,
                    nonce = curr_nonce,
                    tx_hash = %tx_hash,
                    market = %market_hash,
                    "got success receipt"
                );
                if matches!(tx, ReportingTx::Report { .. }) {
                    self.store.remove(market_hash);
                }
                return;
            }

            match self.refresh_nonce().await {
                Some(nonce) => curr_nonce = nonce,
                None => return,
            }
            debug!(
                function,
                tx_try,
                nonce = curr_nonce,
                tx_hash = %tx_hash,
                market = %market_hash,
                "got failed receipt, retrying with next nonce and more gas"
            );
            tx_try += 1;
        }

        warn!(
            function,
            tx_try,
            nonce = curr_nonce,
            market = %market_hash,
            "could not get success tx receipt even after max tx retries"
        );
        if matches!(tx, ReportingTx::Report { .. }) {
            self.store.remove(market_hash);
        }
    }

    /// Fresh chain nonce + 1, since the rejected or failed transaction may
    /// already occupy the current slot. `None` abandons the dispatch when
    /// the nonce endpoint itself fails.
    async fn refresh_nonce(&self) -> Option<u64> {
        match self.chain.transaction_count().await {
            Ok(nonce) => Some(nonce.saturating_add(1)),
            Err(err) => {
                error!(error = %err, "failed to refresh nonce, abandoning dispatch");
                None
            }
        }
    }

    /// Poll for the receipt every [`RECEIPT_POLL_INTERVAL`] until the
    /// transaction mines. Returns its status, or `None` when shutdown
    /// interrupts the wait.
    async fn wait_tx_confirmed(&mut self, tx_hash: B256) -> Option<bool> {
        loop {
            match self.chain.receipt_status(tx_hash).await {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(err) => debug!(tx_hash = %tx_hash, error = %err, "receipt poll failed"),
            }

            tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(RECEIPT_POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::verify::spawn_oracle_stub;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Submission {
        to: Address,
        input: Bytes,
        gas_price: u128,
        gas_limit: u64,
        nonce: u64,
    }

    /// Scripted ChainWriter: pops pre-seeded responses, records submissions.
    #[derive(Default)]
    struct ChainScript {
        nonces: Mutex<VecDeque<u64>>,
        submits: Mutex<VecDeque<Result<B256, ChainError>>>,
        receipts: Mutex<VecDeque<Option<bool>>>,
        submissions: Mutex<Vec<Submission>>,
    }

    impl ChainWriter for ChainScript {
        async fn transaction_count(&self) -> Result<u64, ChainError> {
            Ok(self.nonces.lock().unwrap().pop_front().unwrap_or(0))
        }

        async fn submit(
            &self,
            to: Address,
            input: Bytes,
            gas_price: u128,
            gas_limit: u64,
            nonce: u64,
        ) -> Result<B256, ChainError> {
            self.submissions.lock().unwrap().push(Submission {
                to,
                input,
                gas_price,
                gas_limit,
                nonce,
            });
            self.submits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(B256::repeat_byte(0x77)))
        }

        async fn receipt_status(&self, _tx_hash: B256) -> Result<Option<bool>, ChainError> {
            Ok(self
                .receipts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Some(true)))
        }
    }

    const SX_NODE: Address = Address::repeat_byte(0x42);

    fn test_sender(
        script: Arc<ChainScript>,
        store: Arc<MarketItemStore>,
    ) -> (TxSender<ChainScript>, watch::Sender<bool>) {
        let (_queue_tx, queue_rx) = mpsc::channel(REPORTING_TX_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sender = TxSender::new(script, store, SX_NODE, queue_rx, shutdown_rx);
        (sender, shutdown_tx)
    }

    #[test]
    fn test_report_json_roundtrip() {
        let json = format!(r#"{{"marketHash":"0x{}","outcome":2}}"#, "ab".repeat(32));

        let report: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(report.market_hash, B256::repeat_byte(0xab));
        assert_eq!(report.outcome, 2);

        assert_eq!(serde_json::to_string(&report).unwrap(), json);
    }

    #[tokio::test]
    async fn test_happy_propose_uses_rpc_nonce_and_base_gas() {
        let script = Arc::new(ChainScript::default());
        script.nonces.lock().unwrap().push_back(7);

        let store = Arc::new(MarketItemStore::new());
        let (mut sender, _shutdown) = test_sender(script.clone(), store);

        let market = B256::repeat_byte(0xab);
        sender
            .send_tx_with_retry(ReportingTx::Propose {
                market_hash: market,
                outcome: 2,
            })
            .await;

        let submissions = script.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].to, SX_NODE);
        assert_eq!(submissions[0].nonce, 7);
        assert_eq!(submissions[0].gas_price, 1_000_000_000);
        assert_eq!(submissions[0].gas_limit, 1_000_000);
        assert_eq!(submissions[0].input, abi::propose_outcome_call(market, 2));
    }

    #[tokio::test]
    async fn test_nonce_too_low_retries_with_refreshed_nonce() {
        let script = Arc::new(ChainScript::default());
        // initial nonce fetch, then the refresh after the rejection
        script.nonces.lock().unwrap().extend([5, 9]);
        script
            .submits
            .lock()
            .unwrap()
            .push_back(Err(ChainError::Rpc("nonce too low: have 5, want 7".into())));

        let store = Arc::new(MarketItemStore::new());
        let (mut sender, _shutdown) = test_sender(script.clone(), store);

        sender
            .send_tx_with_retry(ReportingTx::Vote {
                market_hash: B256::repeat_byte(0xcd),
                outcome: 3,
            })
            .await;

        let submissions = script.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].nonce, 5);
        // refreshed to chain nonce + 1, second try bids more gas
        assert_eq!(submissions[1].nonce, 10);
        assert_eq!(submissions[1].gas_price, 2_000_000_000);
        assert!(submissions[1].nonce >= submissions[0].nonce);
    }

    #[tokio::test]
    async fn test_successful_report_removes_store_entry() {
        let script = Arc::new(ChainScript::default());
        script.nonces.lock().unwrap().push_back(1);

        let store = Arc::new(MarketItemStore::new());
        let market = B256::repeat_byte(0xcd);
        store.add(market, 1000);

        let (mut sender, _shutdown) = test_sender(script.clone(), store.clone());
        sender
            .send_tx_with_retry(ReportingTx::Report {
                market_hash: market,
            })
            .await;

        assert!(!store.contains(&market));
        let submissions = script.submissions.lock().unwrap();
        assert_eq!(submissions[0].input, abi::report_outcome_call(market));
    }

    #[tokio::test]
    async fn test_report_exhaustion_removes_store_entry() {
        let script = Arc::new(ChainScript::default());
        script.nonces.lock().unwrap().extend([3, 4, 5, 6, 7]);
        // four failed receipts in a row exhaust the budget
        script
            .receipts
            .lock()
            .unwrap()
            .extend([Some(false), Some(false), Some(false), Some(false)]);

        let store = Arc::new(MarketItemStore::new());
        let market = B256::repeat_byte(0xee);
        store.add(market, 0);

        let (mut sender, _shutdown) = test_sender(script.clone(), store.clone());
        sender
            .send_tx_with_retry(ReportingTx::Report {
                market_hash: market,
            })
            .await;

        assert!(!store.contains(&market));

        let submissions = script.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 4);
        // gas price climbs every try, nonce never decreases
        for (i, submission) in submissions.iter().enumerate() {
            assert_eq!(submission.gas_price, (i as u128 + 1) * 1_000_000_000);
        }
        for pair in submissions.windows(2) {
            assert!(pair[1].nonce >= pair[0].nonce);
        }
    }

    #[tokio::test]
    async fn test_fatal_submit_error_keeps_store_entry() {
        let script = Arc::new(ChainScript::default());
        script.nonces.lock().unwrap().push_back(0);
        script
            .submits
            .lock()
            .unwrap()
            .push_back(Err(ChainError::Rpc("insufficient funds".into())));

        let store = Arc::new(MarketItemStore::new());
        let market = B256::repeat_byte(0x99);
        store.add(market, 0);

        let (mut sender, _shutdown) = test_sender(script.clone(), store.clone());
        sender
            .send_tx_with_retry(ReportingTx::Report {
                market_hash: market,
            })
            .await;

        // one attempt, no retries, and the entry stays for re-dispatch
        assert_eq!(script.submissions.lock().unwrap().len(), 1);
        assert!(store.contains(&market));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_poll_waits_for_mining() {
        let script = Arc::new(ChainScript::default());
        script.nonces.lock().unwrap().push_back(0);
        script
            .receipts
            .lock()
            .unwrap()
            .extend([None, None, Some(true)]);

        let store = Arc::new(MarketItemStore::new());
        let (mut sender, _shutdown) = test_sender(script.clone(), store);

        sender
            .send_tx_with_retry(ReportingTx::Propose {
                market_hash: B256::repeat_byte(0x01),
                outcome: 0,
            })
            .await;

        // mined on the third poll, no resubmission
        assert_eq!(script.submissions.lock().unwrap().len(), 1);
        assert!(script.receipts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_vote_enqueues_verified_outcome() {
        let base = spawn_oracle_stub("200 OK", r#"{"Outcome": 3, "Timestamp": 1000}"#).await;
        let (queue_tx, mut queue_rx) = mpsc::channel(REPORTING_TX_BUFFER);
        let handle = ReporterHandle::new(queue_tx, VerifierClient::new(base));

        let market = B256::repeat_byte(0xcd);
        handle.vote(market).await;

        assert_eq!(
            queue_rx.try_recv().unwrap(),
            ReportingTx::Vote {
                market_hash: market,
                outcome: 3
            }
        );
    }

    #[tokio::test]
    async fn test_handle_vote_skips_on_verifier_failure() {
        let base = spawn_oracle_stub("502 Bad Gateway", "downstream").await;
        let (queue_tx, mut queue_rx) = mpsc::channel(REPORTING_TX_BUFFER);
        let handle = ReporterHandle::new(queue_tx, VerifierClient::new(base));

        handle.vote(B256::repeat_byte(0xcd)).await;

        assert!(queue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_propose_enqueues_as_received() {
        let (queue_tx, mut queue_rx) = mpsc::channel(REPORTING_TX_BUFFER);
        let handle = ReporterHandle::new(queue_tx, VerifierClient::new("http://unused"));

        let market = B256::repeat_byte(0xab);
        handle.propose(market, 2).await;

        assert_eq!(
            queue_rx.try_recv().unwrap(),
            ReportingTx::Propose {
                market_hash: market,
                outcome: 2
            }
        );
    }
}
