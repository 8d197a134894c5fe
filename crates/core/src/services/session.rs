//! Session-scoped state shared by the donation services.
//!
//! A [`Session`] owns the running total and the publication guard for one
//! visitor session. It is created by the orchestrating caller and handed to
//! each service; nothing here is process-global.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy_primitives::U256;
use alloy_primitives::utils::format_ether;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::models::{RunningTotal, TotalSource};

/// Source of wall-clock time for record timestamps and key nonces.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Running Total Cell
// =============================================================================

/// The single mutable running total of a session.
///
/// Every update is a read-modify-write under the watch channel's lock, so
/// concurrent sources never lose each other's writes. Observers subscribe to
/// receive each accepted update.
#[derive(Debug)]
pub struct TotalCell {
    tx: watch::Sender<RunningTotal>,
}

impl Default for TotalCell {
    fn default() -> Self {
        Self::new()
    }
}

impl TotalCell {
    /// Zero baseline, no source yet.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunningTotal::default());
        Self { tx }
    }

    /// Current total.
    pub fn get(&self) -> RunningTotal {
        *self.tx.borrow()
    }

    /// Receive every accepted update.
    pub fn subscribe(&self) -> watch::Receiver<RunningTotal> {
        self.tx.subscribe()
    }

    /// Apply a historical sum.
    ///
    /// Discarded (returns `None`) once a balance snapshot or live event has
    /// been applied, since either one already supersedes the scan.
    pub fn apply_historical(&self, value: U256) -> Option<RunningTotal> {
        let mut applied = None;
        self.tx.send_if_modified(|total| {
            if total.source.is_some_and(|s| s.is_authoritative()) {
                return false;
            }
            *total = RunningTotal {
                value,
                source: Some(TotalSource::HistoricalScan),
                as_of: total.as_of + 1,
            };
            applied = Some(*total);
            true
        });
        applied
    }

    /// Overwrite with a balance snapshot.
    pub fn apply_snapshot(&self, value: U256) -> RunningTotal {
        self.update(|_| value, TotalSource::BalanceSnapshot)
    }

    /// Add a live event delta on top of whatever is currently held.
    pub fn apply_delta(&self, amount: U256) -> RunningTotal {
        self.update(|current| current.saturating_add(amount), TotalSource::LiveEvent)
    }

    fn update(&self, next: impl FnOnce(U256) -> U256, source: TotalSource) -> RunningTotal {
        let mut updated = RunningTotal::default();
        self.tx.send_modify(|total| {
            *total = RunningTotal {
                value: next(total.value),
                source: Some(source),
                as_of: total.as_of + 1,
            };
            updated = *total;
        });
        updated
    }
}

/// Wei amount as (lossy) ether, for gauges and logs.
pub fn ether_f64(value: U256) -> f64 {
    format_ether(value).parse().unwrap_or(f64::MAX)
}

// =============================================================================
// Publication Guard
// =============================================================================

/// At-most-once publication flag for the current donation attempt.
///
/// Not durable: a restart between confirmation and publication loses the
/// message.
#[derive(Debug, Default)]
pub struct PublicationGuard {
    attempted: AtomicBool,
}

impl PublicationGuard {
    /// Atomically claim the right to publish. Only the first caller since
    /// the last [`reset`](Self::reset) gets `true`.
    pub fn try_claim(&self) -> bool {
        self.attempted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear a stale flag left by a previous attempt.
    pub fn reset(&self) {
        self.attempted.store(false, Ordering::Release);
    }

    pub fn is_attempted(&self) -> bool {
        self.attempted.load(Ordering::Acquire)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Context object owning the per-session state.
#[derive(Debug, Clone)]
pub struct Session {
    started_at: DateTime<Utc>,
    total: Arc<TotalCell>,
    publication: Arc<PublicationGuard>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            total: Arc::new(TotalCell::new()),
            publication: Arc::new(PublicationGuard::default()),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn total(&self) -> Arc<TotalCell> {
        self.total.clone()
    }

    pub fn publication_guard(&self) -> Arc<PublicationGuard> {
        self.publication.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ether(tenths: u64) -> U256 {
        U256::from(tenths) * U256::from(100_000_000_000_000_000u64)
    }

    // Scenario: historical 2.0 then snapshot 2.5 shows 2.5, not 4.5
    #[test]
    fn test_snapshot_overwrites_historical_sum() {
        let cell = TotalCell::new();
        cell.apply_historical(ether(20));
        let total = cell.apply_snapshot(ether(25));
        assert_eq!(total.value, ether(25));
        assert_eq!(total.source, Some(TotalSource::BalanceSnapshot));
    }

    // Scenario: snapshot 2.5 then live event 0.5 shows 3.0
    #[test]
    fn test_live_delta_adds_on_top_of_snapshot() {
        let cell = TotalCell::new();
        cell.apply_snapshot(ether(25));
        let total = cell.apply_delta(ether(5));
        assert_eq!(total.value, ether(30));
        assert_eq!(total.source, Some(TotalSource::LiveEvent));
    }

    #[test]
    fn test_late_historical_scan_is_discarded() {
        let cell = TotalCell::new();
        cell.apply_delta(ether(5));
        assert!(cell.apply_historical(ether(20)).is_none());
        assert_eq!(cell.get().value, ether(5));

        cell.apply_snapshot(ether(25));
        assert!(cell.apply_historical(ether(20)).is_none());
        assert_eq!(cell.get().value, ether(25));
    }

    #[test]
    fn test_logical_clock_advances_only_on_accepted_updates() {
        let cell = TotalCell::new();
        assert_eq!(cell.get().as_of, 0);
        cell.apply_historical(ether(1));
        cell.apply_snapshot(ether(2));
        cell.apply_historical(ether(3));
        assert_eq!(cell.get().as_of, 2);
    }

    #[tokio::test]
    async fn test_subscribers_observe_updates() {
        let cell = TotalCell::new();
        let mut rx = cell.subscribe();
        cell.apply_snapshot(ether(1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().value, ether(1));
    }

    #[test]
    fn test_guard_claims_once_until_reset() {
        let guard = PublicationGuard::default();
        assert!(guard.try_claim());
        assert!(!guard.try_claim());
        assert!(guard.is_attempted());
        guard.reset();
        assert!(guard.try_claim());
    }

    #[test]
    fn test_guard_claim_is_exclusive_across_threads() {
        let guard = Arc::new(PublicationGuard::default());
        let winners: usize = (0..8)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.try_claim())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_ether_conversion_for_gauges() {
        assert_eq!(ether_f64(ether(25)), 2.5);
    }
}
