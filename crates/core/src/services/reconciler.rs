//! Running-total reconciliation.
//!
//! Merges three independent views of the recipient's ledger state into the
//! session's [`TotalCell`]:
//!
//! 1. a historical scan of incoming transfers (slow, lowest authority)
//! 2. balance snapshots (authoritative, full overwrite)
//! 3. live `DonationReceived` events (additive deltas)
//!
//! All three run concurrently and may complete in any order. Whatever the
//! order, the converged total is the last snapshot plus the deltas that
//! arrived after it.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_primitives::utils::format_ether;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::LedgerResult;
use crate::metrics::{ScanTimer, record_total_update, record_total_update_discarded};
use crate::models::{BlockRange, ContractEvent, DONATION_RECEIVED, RunningTotal, TotalSource};
use crate::ports::LedgerClient;
use crate::services::session::{Session, TotalCell, ether_f64};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Address whose incoming funds are totalled.
    pub recipient: Address,
    /// Contract emitting `DonationReceived`.
    pub contract: Address,
    /// Block range of the historical scan.
    pub scan_range: BlockRange,
    /// Re-read the balance on this interval (`None` = once at start).
    pub balance_refresh_interval: Option<Duration>,
    /// First delay before resubscribing to events.
    pub resubscribe_initial_delay: Duration,
    /// Upper bound of the resubscription backoff.
    pub resubscribe_max_delay: Duration,
}

impl ReconcilerConfig {
    /// Recipient and contract are the same address, as with a donation
    /// contract that holds the funds itself.
    pub fn for_contract(contract: Address) -> Self {
        Self {
            recipient: contract,
            contract,
            scan_range: BlockRange::full(),
            balance_refresh_interval: Some(Duration::from_secs(30)),
            resubscribe_initial_delay: Duration::from_millis(500),
            resubscribe_max_delay: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// TotalReconciler
// =============================================================================

/// Produces the running total shown to visitors.
///
/// One-shot fetches are not retried here; the [`LedgerClient`]
/// implementation applies its own retry policy and the reconciler accepts
/// whatever value or failure comes back.
pub struct TotalReconciler<L: LedgerClient> {
    config: ReconcilerConfig,
    ledger: Arc<L>,
    total: Arc<TotalCell>,
}

impl<L: LedgerClient> TotalReconciler<L> {
    pub fn new(config: ReconcilerConfig, ledger: Arc<L>, session: &Session) -> Self {
        Self {
            config,
            ledger,
            total: session.total(),
        }
    }

    /// Current total.
    pub fn current(&self) -> RunningTotal {
        self.total.get()
    }

    /// Receive every accepted total update.
    pub fn subscribe(&self) -> watch::Receiver<RunningTotal> {
        self.total.subscribe()
    }

    /// Run all three sources until shutdown.
    #[instrument(skip_all, fields(recipient = %self.config.recipient))]
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) {
        info!("💰 Starting reconciler");

        let mut scan_shutdown = shutdown_rx.clone();
        let scan = async {
            tokio::select! {
                _ = self.historical_scan() => {}
                _ = shutdown_requested(&mut scan_shutdown) => {}
            }
        };

        tokio::join!(
            scan,
            self.follow_balance(shutdown_rx.clone()),
            self.follow_events(shutdown_rx),
        );

        debug!("Reconciler stopped");
    }

    /// Sum incoming transfers and apply the result as a historical scan.
    ///
    /// A failed scan leaves the current total untouched (zero baseline at
    /// session start). Returns the new total if the scan was applied.
    #[instrument(skip(self))]
    pub async fn historical_scan(&self) -> Option<RunningTotal> {
        let _timer = ScanTimer::new();

        let (sum, count) = match self.sum_incoming().await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "⚠️  Historical scan failed, keeping current total");
                return None;
            }
        };

        match self.total.apply_historical(sum) {
            Some(total) => {
                record_total_update(TotalSource::HistoricalScan, ether_f64(total.value));
                info!(transfers = count, total = %format_ether(total.value), "📜 Historical scan applied");
                Some(total)
            }
            None => {
                record_total_update_discarded();
                debug!(transfers = count, "Historical scan superseded by an authoritative source");
                None
            }
        }
    }

    async fn sum_incoming(&self) -> LedgerResult<(U256, usize)> {
        let recipient = self.config.recipient;
        let mut transfers = self
            .ledger
            .list_incoming_transfers(recipient, self.config.scan_range)
            .await?;

        let mut sum = U256::ZERO;
        let mut count = 0;
        while let Some(transfer) = transfers.next().await {
            let transfer = transfer?;
            if !transfer.is_incoming_to(&recipient) {
                trace!(tx = %transfer.tx_hash, "Skipping outgoing transfer");
                continue;
            }
            sum = sum.saturating_add(transfer.value);
            count += 1;
        }
        Ok((sum, count))
    }

    /// Read the recipient balance and overwrite the total with it.
    #[instrument(skip(self))]
    pub async fn refresh_balance(&self) -> Option<RunningTotal> {
        match self.ledger.get_balance(self.config.recipient).await {
            Ok(balance) => {
                let total = self.total.apply_snapshot(balance);
                record_total_update(TotalSource::BalanceSnapshot, ether_f64(total.value));
                info!(total = %format_ether(total.value), "🏦 Balance snapshot applied");
                Some(total)
            }
            Err(e) => {
                warn!(error = %e, "⚠️  Balance fetch failed, keeping current total");
                None
            }
        }
    }

    /// Apply one live event. Events without an amount, or of another
    /// type, leave the total unchanged.
    pub fn apply_event(&self, event: &ContractEvent) -> Option<RunningTotal> {
        if event.name != DONATION_RECEIVED {
            trace!(name = %event.name, "Ignoring unrelated event");
            return None;
        }
        let amount = event.amount?;

        let total = self.total.apply_delta(amount);
        record_total_update(TotalSource::LiveEvent, ether_f64(total.value));
        info!(
            block = event.block_number,
            tx = %event.tx_hash,
            amount = %format_ether(amount),
            total = %format_ether(total.value),
            "🎁 Donation received"
        );
        Some(total)
    }

    async fn follow_balance(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::select! {
            _ = self.refresh_balance() => {}
            _ = shutdown_requested(&mut shutdown_rx) => return,
        }

        let Some(period) = self.config.balance_refresh_interval else {
            return;
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!("Refreshing balance snapshot");
                    self.refresh_balance().await;
                }
                _ = shutdown_requested(&mut shutdown_rx) => return,
            }
        }
    }

    /// Consume the event subscription, resubscribing when it drops.
    #[instrument(skip_all)]
    async fn follow_events(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let initial_delay = self.config.resubscribe_initial_delay;
        let max_delay = self.config.resubscribe_max_delay;
        let mut retry_delay = initial_delay;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            match self
                .ledger
                .subscribe_events(self.config.contract, DONATION_RECEIVED)
                .await
            {
                Ok(mut subscription) => {
                    debug!("📡 Event subscription established");
                    retry_delay = initial_delay;

                    loop {
                        tokio::select! {
                            next = subscription.next() => match next {
                                Some(Ok(event)) => {
                                    self.apply_event(&event);
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "⚠️  Event subscription error, resubscribing...");
                                    break;
                                }
                                None => {
                                    warn!("⚠️  Event subscription ended, resubscribing...");
                                    break;
                                }
                            },
                            _ = shutdown_requested(&mut shutdown_rx) => {
                                subscription.unsubscribe();
                                return;
                            }
                        }
                    }
                    subscription.unsubscribe();
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = retry_delay.as_millis() as u64,
                        "⚠️  Failed to subscribe to events, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {
                    debug!(retry_delay_ms = retry_delay.as_millis() as u64, "🔄 Resubscribing to events...");
                    retry_delay = (retry_delay * 2).min(max_delay);
                }
                _ = shutdown_requested(&mut shutdown_rx) => return,
            }
        }
    }
}

/// Resolve once shutdown is signalled (or the sender is gone).
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::models::{FinalityResult, TransactionHandle, Transfer};
    use crate::ports::{EventSubscription, TransferStream};
    use alloy_primitives::B256;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn recipient() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn tenths(n: u64) -> U256 {
        U256::from(n) * U256::from(100_000_000_000_000_000u64)
    }

    fn transfer(to: Address, value: U256) -> Transfer {
        Transfer {
            tx_hash: B256::ZERO,
            block_number: 1,
            from: Address::repeat_byte(0x01),
            to: Some(to),
            value,
            block_timestamp: None,
        }
    }

    fn donation(amount: U256) -> ContractEvent {
        ContractEvent {
            name: DONATION_RECEIVED.into(),
            tx_hash: B256::repeat_byte(0x42),
            log_index: 0,
            block_number: 10,
            donor: Some(Address::repeat_byte(0x01)),
            amount: Some(amount),
        }
    }

    /// Scripted ledger: fixed history and balance, events fed by the test.
    struct FakeLedger {
        history: LedgerResult<Vec<Transfer>>,
        balance: LedgerResult<U256>,
        events: Mutex<Option<mpsc::UnboundedReceiver<LedgerResult<ContractEvent>>>>,
        subscriptions: AtomicU32,
    }

    impl FakeLedger {
        fn new(history: Vec<Transfer>, balance: U256) -> Self {
            Self {
                history: Ok(history),
                balance: Ok(balance),
                events: Mutex::new(None),
                subscriptions: AtomicU32::new(0),
            }
        }

        fn with_events(self) -> (Self, mpsc::UnboundedSender<LedgerResult<ContractEvent>>) {
            let (tx, rx) = mpsc::unbounded();
            *self.events.lock().unwrap() = Some(rx);
            (self, tx)
        }
    }

    fn clone_err(e: &LedgerError) -> LedgerError {
        LedgerError::Unavailable(e.to_string())
    }

    #[async_trait]
    impl LedgerClient for FakeLedger {
        async fn get_balance(&self, _address: Address) -> LedgerResult<U256> {
            self.balance.as_ref().copied().map_err(clone_err)
        }

        async fn list_incoming_transfers(
            &self,
            _address: Address,
            _range: BlockRange,
        ) -> LedgerResult<TransferStream> {
            let history = self.history.as_ref().map_err(clone_err)?.clone();
            Ok(Box::pin(futures::stream::iter(history.into_iter().map(Ok))))
        }

        async fn subscribe_events(
            &self,
            _contract: Address,
            _event_name: &str,
        ) -> LedgerResult<EventSubscription> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            match self.events.lock().unwrap().take() {
                Some(rx) => Ok(EventSubscription::new(Box::pin(rx))),
                None => Ok(EventSubscription::new(Box::pin(futures::stream::pending::<
                    LedgerResult<ContractEvent>,
                >()))),
            }
        }

        async fn wait_for_finality(&self, _tx: &TransactionHandle) -> LedgerResult<FinalityResult> {
            Ok(FinalityResult::Success { block_number: 1 })
        }
    }

    fn reconciler(ledger: FakeLedger) -> TotalReconciler<FakeLedger> {
        let mut config = ReconcilerConfig::for_contract(recipient());
        config.balance_refresh_interval = None;
        config.resubscribe_initial_delay = Duration::from_millis(1);
        TotalReconciler::new(config, Arc::new(ledger), &Session::new())
    }

    // Scenario: history sums to 2.0, balance says 2.5 -> 2.5, not 4.5
    #[tokio::test]
    async fn test_snapshot_supersedes_historical_sum() {
        let r = reconciler(FakeLedger::new(
            vec![transfer(recipient(), tenths(15)), transfer(recipient(), tenths(5))],
            tenths(25),
        ));

        assert_eq!(r.historical_scan().await.unwrap().value, tenths(20));
        assert_eq!(r.refresh_balance().await.unwrap().value, tenths(25));
        assert_eq!(r.current().source, Some(TotalSource::BalanceSnapshot));
    }

    #[tokio::test]
    async fn test_historical_scan_ignores_outgoing_transfers() {
        let r = reconciler(FakeLedger::new(
            vec![
                transfer(recipient(), tenths(10)),
                transfer(Address::repeat_byte(0xbb), tenths(7)),
            ],
            U256::ZERO,
        ));
        assert_eq!(r.historical_scan().await.unwrap().value, tenths(10));
    }

    #[tokio::test]
    async fn test_failed_sources_degrade_to_zero_baseline() {
        let mut ledger = FakeLedger::new(vec![], U256::ZERO);
        ledger.history = Err(LedgerError::Unavailable("rate limited".into()));
        ledger.balance = Err(LedgerError::Timeout("balance".into()));
        let r = reconciler(ledger);

        assert!(r.historical_scan().await.is_none());
        assert!(r.refresh_balance().await.is_none());
        assert_eq!(r.current(), RunningTotal::default());
    }

    // For every arrival order, final = last snapshot + deltas after it
    #[tokio::test]
    async fn test_converges_for_every_arrival_order() {
        #[derive(Clone, Copy, Debug)]
        enum Arrival {
            Scan,
            Snapshot,
            Event,
        }
        use Arrival::*;

        let orders = [
            [Scan, Snapshot, Event],
            [Scan, Event, Snapshot],
            [Snapshot, Scan, Event],
            [Snapshot, Event, Scan],
            [Event, Scan, Snapshot],
            [Event, Snapshot, Scan],
        ];

        for order in orders {
            let r = reconciler(FakeLedger::new(vec![transfer(recipient(), tenths(20))], tenths(25)));
            let mut seen_snapshot = false;
            let mut deltas_after_snapshot = U256::ZERO;

            for arrival in order {
                match arrival {
                    Scan => {
                        r.historical_scan().await;
                    }
                    Snapshot => {
                        r.refresh_balance().await;
                        seen_snapshot = true;
                        deltas_after_snapshot = U256::ZERO;
                    }
                    Event => {
                        r.apply_event(&donation(tenths(5)));
                        if seen_snapshot {
                            deltas_after_snapshot += tenths(5);
                        }
                    }
                }
            }

            assert_eq!(
                r.current().value,
                tenths(25) + deltas_after_snapshot,
                "order {order:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_live_event_before_snapshot_still_counts() {
        let r = reconciler(FakeLedger::new(vec![], tenths(25)));
        assert_eq!(r.apply_event(&donation(tenths(5))).unwrap().value, tenths(5));
        assert_eq!(r.current().source, Some(TotalSource::LiveEvent));
    }

    #[tokio::test]
    async fn test_events_without_amount_are_ignored() {
        let r = reconciler(FakeLedger::new(vec![], U256::ZERO));
        let mut event = donation(tenths(5));
        event.amount = None;
        assert!(r.apply_event(&event).is_none());

        let mut other = donation(tenths(5));
        other.name = "Withdrawn".into();
        assert!(r.apply_event(&other).is_none());
        assert_eq!(r.current().value, U256::ZERO);
    }

    #[tokio::test]
    async fn test_run_merges_all_sources_and_stops_on_shutdown() {
        let (ledger, events_tx) = FakeLedger::new(vec![transfer(recipient(), tenths(20))], tenths(25))
            .with_events();
        let r = Arc::new(reconciler(ledger));
        let mut totals = r.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let r = r.clone();
            tokio::spawn(async move { r.run(shutdown_rx).await })
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            totals.wait_for(|t| t.source == Some(TotalSource::BalanceSnapshot)),
        )
        .await
        .unwrap()
        .unwrap();

        events_tx.unbounded_send(Ok(donation(tenths(5)))).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            totals.wait_for(|t| t.source == Some(TotalSource::LiveEvent)),
        )
        .await
        .unwrap()
        .unwrap();

        // The scan may have landed before or after the snapshot; either way
        // the snapshot wins and the event adds on top.
        assert_eq!(r.current().value, tenths(30));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_subscription_drops() {
        let (ledger, events_tx) = FakeLedger::new(vec![], U256::ZERO).with_events();
        let ledger = Arc::new(ledger);
        let mut config = ReconcilerConfig::for_contract(recipient());
        config.balance_refresh_interval = None;
        config.resubscribe_initial_delay = Duration::from_millis(1);
        let r = Arc::new(TotalReconciler::new(config, ledger.clone(), &Session::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let r = r.clone();
            tokio::spawn(async move { r.run(shutdown_rx).await })
        };

        // Closing the channel ends the first subscription
        drop(events_tx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while ledger.subscriptions.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
