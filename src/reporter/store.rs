//! Market item store and the deferred report dispatcher.
//!
//! Every observed ProposeOutcome lands in the store keyed by market hash
//! with the proposal's on-chain block timestamp. A 5-second scan emits a
//! Report reporting-tx for every entry whose voting period has elapsed.
//! Emission does NOT remove the entry; removal happens only when an
//! OutcomeReported event is observed, when a Report transaction mines
//! successfully, or when the Report retry budget is exhausted. A market
//! whose Report keeps failing is therefore re-dispatched every tick until
//! one of those terminal conditions fires.

use crate::reporter::ReporterHandle;
use alloy::primitives::B256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::debug;

/// Interval between report-eligibility scans.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Voting period in seconds, written by the event subscriber after each
/// ProposeOutcome (lazily refreshed from chain) and read by the dispatcher.
#[derive(Clone, Default)]
pub struct SharedVotingPeriod(Arc<AtomicU64>);

impl SharedVotingPeriod {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, seconds: u64) {
        self.0.store(seconds, Ordering::Relaxed)
    }
}

/// Concurrent map of market hash → proposal block timestamp (seconds).
#[derive(Default)]
pub struct MarketItemStore {
    items: Mutex<HashMap<B256, u64>>,
}

impl MarketItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, market_hash: B256, block_timestamp: u64) {
        self.items.lock().unwrap().insert(market_hash, block_timestamp);
        debug!(market = %market_hash, block_timestamp, "added to store");
    }

    pub fn remove(&self, market_hash: B256) {
        self.items.lock().unwrap().remove(&market_hash);
        debug!(market = %market_hash, "removed from store");
    }

    pub fn contains(&self, market_hash: &B256) -> bool {
        self.items.lock().unwrap().contains_key(market_hash)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Markets whose voting period has elapsed. The snapshot is taken under
    /// the lock; callers enqueue after release so a full reporting channel
    /// can never stall other store users.
    pub fn due(&self, voting_period_secs: u64, now_secs: u64) -> Vec<B256> {
        let items = self.items.lock().unwrap();
        items
            .iter()
            .filter_map(|(market_hash, timestamp)| {
                if timestamp + voting_period_secs <= now_secs {
                    Some(*market_hash)
                } else {
                    debug!(
                        market = %market_hash,
                        block_timestamp = timestamp,
                        remaining_secs = timestamp + voting_period_secs - now_secs,
                        "market not yet ready for reporting"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Task that scans the store every [`SCAN_INTERVAL`] and dispatches a
/// Report for each due market. The first scan runs one interval after
/// startup.
pub struct StoreDispatcher {
    store: Arc<MarketItemStore>,
    voting_period: SharedVotingPeriod,
    handle: ReporterHandle,
    shutdown: watch::Receiver<bool>,
}

impl StoreDispatcher {
    pub fn new(
        store: Arc<MarketItemStore>,
        voting_period: SharedVotingPeriod,
        handle: ReporterHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            voting_period,
            handle,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + SCAN_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, SCAN_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = ticker.tick() => self.scan().await,
            }
        }

        debug!("store dispatcher stopped");
    }

    async fn scan(&self) {
        let period = self.voting_period.get();
        let now = unix_now();

        for market_hash in self.store.due(period, now) {
            debug!(
                market = %market_hash,
                voting_period_secs = period,
                "voting period elapsed, dispatching report"
            );
            self.handle.report(market_hash).await;
        }
    }
}
