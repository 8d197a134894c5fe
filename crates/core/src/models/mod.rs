//! Domain models for the donation ledger.
//!
//! These models are adapter-agnostic: the EVM adapter and the content
//! store adapters translate their wire formats into these types.

mod record;

use std::fmt;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use record::{ContentKey, DonationDraft, DonationRecord, KeyStrategy, MIN_MESSAGE_CHARS};

// =============================================================================
// Ledger Data
// =============================================================================

/// A value transfer observed on the ledger.
///
/// Identity is the transaction hash; the explorer may return the same
/// transaction for both sides of a transfer, so consumers filter on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Block height containing the transaction.
    pub block_number: u64,
    /// Sender.
    pub from: Address,
    /// Recipient (`None` for contract creation).
    pub to: Option<Address>,
    /// Value moved, in wei.
    pub value: U256,
    /// Block timestamp, if the source reports one.
    pub block_timestamp: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Whether this transfer credits `address`.
    pub fn is_incoming_to(&self, address: &Address) -> bool {
        self.to.as_ref() == Some(address)
    }
}

/// Inclusive block range for historical scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockRange {
    /// First block to include.
    pub from: u64,
    /// Last block to include (`None` = chain head).
    pub to: Option<u64>,
}

impl BlockRange {
    /// Every block from genesis to the current head.
    pub fn full() -> Self {
        Self::default()
    }
}

/// Name of the contract event carrying donation deltas.
pub const DONATION_RECEIVED: &str = "DonationReceived";

/// A decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractEvent {
    /// Event name (e.g. `DonationReceived`).
    pub name: String,
    /// Transaction that emitted the event.
    pub tx_hash: B256,
    /// Log index within the block.
    pub log_index: u64,
    /// Block height.
    pub block_number: u64,
    /// `donor` argument, when the event has one.
    pub donor: Option<Address>,
    /// `amount` argument, when the event has one.
    pub amount: Option<U256>,
}

// =============================================================================
// Transactions
// =============================================================================

/// Handle to a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(pub B256);

impl TransactionHandle {
    pub fn hash(&self) -> B256 {
        self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<B256> for TransactionHandle {
    fn from(hash: B256) -> Self {
        Self(hash)
    }
}

/// Outcome reported once a transaction is included and confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityResult {
    Success { block_number: u64 },
    Reverted { block_number: u64 },
}

// =============================================================================
// Running Total
// =============================================================================

/// Which view of the ledger produced the current total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalSource {
    HistoricalScan,
    BalanceSnapshot,
    LiveEvent,
}

impl TotalSource {
    /// Balance snapshots and live events outrank the historical sum.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, Self::HistoricalScan)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HistoricalScan => "historical_scan",
            Self::BalanceSnapshot => "balance_snapshot",
            Self::LiveEvent => "live_event",
        }
    }
}

impl fmt::Display for TotalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total shown to visitors.
///
/// `source` is `None` until the first source arrives (zero baseline).
/// `as_of` is a logical clock bumped on every accepted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunningTotal {
    pub value: U256,
    pub source: Option<TotalSource>,
    pub as_of: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_filter_ignores_outgoing_and_creation() {
        let recipient = Address::repeat_byte(0x11);
        let mut transfer = Transfer {
            tx_hash: B256::ZERO,
            block_number: 1,
            from: Address::repeat_byte(0x22),
            to: Some(recipient),
            value: U256::from(5),
            block_timestamp: None,
        };
        assert!(transfer.is_incoming_to(&recipient));

        transfer.to = Some(Address::repeat_byte(0x33));
        assert!(!transfer.is_incoming_to(&recipient));

        transfer.to = None;
        assert!(!transfer.is_incoming_to(&recipient));
    }

    #[test]
    fn test_historical_scan_is_not_authoritative() {
        assert!(!TotalSource::HistoricalScan.is_authoritative());
        assert!(TotalSource::BalanceSnapshot.is_authoritative());
        assert!(TotalSource::LiveEvent.is_authoritative());
    }
}
