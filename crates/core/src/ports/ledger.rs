//! Port traits for the external ledger.
//!
//! These traits define how the domain reads balances, historical transfers
//! and contract events, and how it submits donations. Implementations live
//! in the infrastructure layer (e.g., `almoner-evm`).

use std::pin::Pin;
use std::task::{Context, Poll};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::LedgerResult;
use crate::models::{BlockRange, ContractEvent, FinalityResult, TransactionHandle, Transfer};

/// Lazy, finite, non-restartable stream of transfers in ascending block order.
pub type TransferStream = Pin<Box<dyn Stream<Item = LedgerResult<Transfer>> + Send>>;

/// Raw stream of contract events.
pub type EventStream = Pin<Box<dyn Stream<Item = LedgerResult<ContractEvent>> + Send>>;

// =============================================================================
// Event Subscription
// =============================================================================

/// Cancellable, infinite stream of contract events.
///
/// The stream ends once [`unsubscribe`](Self::unsubscribe) is called (from
/// any clone of the handle) or the subscription is dropped. Ending on its own
/// means the underlying connection was lost.
pub struct EventSubscription {
    events: EventStream,
    token: CancellationToken,
}

impl EventSubscription {
    /// Wrap a raw event stream.
    pub fn new(events: EventStream) -> Self {
        let token = CancellationToken::new();
        let events = events.take_until(token.clone().cancelled_owned()).boxed();
        Self { events, token }
    }

    /// Stop delivery. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    /// Handle that can cancel this subscription from elsewhere.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Stream for EventSubscription {
    type Item = LedgerResult<ContractEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Port trait for reading the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Point-in-time balance of `address`, in wei.
    async fn get_balance(&self, address: Address) -> LedgerResult<U256>;

    /// Transfers touching `address` within `range`, ascending by block.
    ///
    /// The provider may also return outgoing transactions; callers filter
    /// with [`Transfer::is_incoming_to`].
    async fn list_incoming_transfers(
        &self,
        address: Address,
        range: BlockRange,
    ) -> LedgerResult<TransferStream>;

    /// Subscribe to `event_name` emitted by `contract`.
    ///
    /// Delivers events in commit order. Events committed before the call
    /// are not replayed.
    async fn subscribe_events(
        &self,
        contract: Address,
        event_name: &str,
    ) -> LedgerResult<EventSubscription>;

    /// Suspend until the transaction is included and confirmed.
    async fn wait_for_finality(&self, tx: &TransactionHandle) -> LedgerResult<FinalityResult>;
}

/// Port trait for sending donations from the donor's account.
#[async_trait]
pub trait DonationSubmitter: Send + Sync {
    /// Account the donations are sent from.
    fn donor(&self) -> Address;

    /// Call the contract's payable `donate()` with `value` wei.
    async fn submit_donation(&self, contract: Address, value: U256)
    -> LedgerResult<TransactionHandle>;
}
