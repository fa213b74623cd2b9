//! Chain event subscriber.
//!
//! Watches the outcome-reporter contract over WebSocket for two events:
//!
//! - `ProposeOutcome(bytes32 marketHash, uint8 outcome, uint256 blockTime)`:
//!   some reporter (this one included) proposed an outcome. Refresh the
//!   voting period from chain, vote on the market (outcome resolved by the
//!   verifier on this task), and remember the proposal timestamp so the
//!   dispatcher can finalize the market later.
//! - `OutcomeReported(bytes32 marketHash, uint8 outcome)`: some reporter
//!   finalized the market; forget it.
//!
//! Each event gets its own subscription on its own WebSocket connection, so
//! one dropped stream never disturbs the other. A dropped stream is
//! re-opened after a delay; undecodable logs are skipped. A missed event is
//! recoverable because the store still times the market out from the
//! on-chain timestamp carried by the proposal.

use crate::chain::{abi, ChainClient, ChainError};
use crate::reporter::store::{MarketItemStore, SharedVotingPeriod};
use crate::reporter::ReporterHandle;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::SubscriptionStream;
use alloy::rpc::types::{Filter, Log};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before re-opening a dropped subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// One live log subscription. The provider is held alongside the stream
/// because dropping the connection cancels the subscription.
struct EventStream {
    _provider: DynProvider,
    stream: SubscriptionStream<Log>,
}

impl EventStream {
    async fn open(ws_url: &str, contract: Address, topic: B256) -> Result<Self, ChainError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(ws_url))
            .await
            .map_err(ChainError::from)?
            .erased();

        let filter = Filter::new().address(contract).event_signature(topic);
        let stream = provider
            .subscribe_logs(&filter)
            .await
            .map_err(ChainError::from)?
            .into_stream();

        Ok(Self {
            _provider: provider,
            stream,
        })
    }
}

pub struct EventSubscriber {
    ws_url: String,
    contract: Address,
    chain: Arc<ChainClient>,
    voting_period: SharedVotingPeriod,
    store: Arc<MarketItemStore>,
    handle: ReporterHandle,
    shutdown: watch::Receiver<bool>,
}

impl EventSubscriber {
    pub fn new(
        ws_url: String,
        contract: Address,
        chain: Arc<ChainClient>,
        voting_period: SharedVotingPeriod,
        store: Arc<MarketItemStore>,
        handle: ReporterHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ws_url,
            contract,
            chain,
            voting_period,
            store,
            handle,
            shutdown,
        }
    }

    /// Open both subscriptions and spawn the multiplex loop. A failure to
    /// subscribe here is a startup error.
    pub async fn start(self) -> Result<JoinHandle<()>, ChainError> {
        let propose =
            EventStream::open(&self.ws_url, self.contract, *abi::PROPOSE_OUTCOME_TOPIC).await?;
        let reported =
            EventStream::open(&self.ws_url, self.contract, *abi::OUTCOME_REPORTED_TOPIC).await?;

        info!(contract = %self.contract, "listening for ProposeOutcome and OutcomeReported events");

        Ok(tokio::spawn(self.run(propose, reported)))
    }

    async fn run(mut self, mut propose: EventStream, mut reported: EventStream) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                log = propose.stream.next() => match log {
                    Some(log) => self.on_propose_outcome(&log).await,
                    None => {
                        error!(
                            delay_secs = RESUBSCRIBE_DELAY.as_secs(),
                            "ProposeOutcome subscription dropped, re-subscribing after delay"
                        );
                        match self.reopen(*abi::PROPOSE_OUTCOME_TOPIC).await {
                            Some(stream) => propose = stream,
                            None => break,
                        }
                    }
                },
                log = reported.stream.next() => match log {
                    Some(log) => self.on_outcome_reported(&log),
                    None => {
                        error!(
                            delay_secs = RESUBSCRIBE_DELAY.as_secs(),
                            "OutcomeReported subscription dropped, re-subscribing after delay"
                        );
                        match self.reopen(*abi::OUTCOME_REPORTED_TOPIC).await {
                            Some(stream) => reported = stream,
                            None => break,
                        }
                    }
                },
            }
        }

        debug!("event subscriber stopped");
    }

    /// Re-open one subscription on a fresh connection, retrying until it
    /// succeeds. `None` means shutdown arrived while waiting.
    async fn reopen(&mut self, topic: B256) -> Option<EventStream> {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }

            match EventStream::open(&self.ws_url, self.contract, topic).await {
                Ok(stream) => return Some(stream),
                Err(err) => error!(error = %err, "re-subscribe failed"),
            }
        }
    }

    async fn on_propose_outcome(&self, log: &Log) {
        let (market_hash, outcome, block_time) =
            match abi::decode_propose_outcome(&log.data().data) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(error = %err, "error unpacking ProposeOutcome event, skipping");
                    return;
                }
            };

        debug!(
            market = %market_hash,
            outcome,
            block_time,
            "received ProposeOutcome event"
        );

        self.sync_voting_period().await;
        self.handle.vote(market_hash).await;
        self.store.add(market_hash, block_time);
    }

    fn on_outcome_reported(&self, log: &Log) {
        let (market_hash, outcome) = match abi::decode_outcome_reported(&log.data().data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "error unpacking OutcomeReported event, skipping");
                return;
            }
        };

        debug!(market = %market_hash, outcome, "received OutcomeReported event");

        self.store.remove(market_hash);
    }

    /// Lazily refresh the voting period the store dispatcher works with.
    async fn sync_voting_period(&self) {
        match self.chain.voting_period().await {
            Ok(period) => {
                debug!(period, "retrieved onchain voting period");
                self.voting_period.set(period);
            }
            Err(err) => error!(error = %err, "failed to sync voting period"),
        }
    }
}
