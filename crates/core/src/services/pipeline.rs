//! Post-confirmation annotation pipeline.
//!
//! Drives one donation flow through
//! `Idle -> Submitting -> Submitted -> Confirmed -> Published | PublishFailed`,
//! with `Submitted -> TransferFailed` when the transfer never reaches
//! successful finality. A failed submission returns to the state it left. Each terminal state tells the donor whether the funds moved and
//! whether the message was saved.
//!
//! Confirmation notifications may fire more than once for the same
//! transaction. The session's [`PublicationGuard`] is claimed with a single
//! compare-and-swap before the store call, so only one record is written per
//! confirmed transfer.

use std::sync::Arc;

use alloy_primitives::Address;
use alloy_primitives::utils::format_ether;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{
    DonationError, DonationResult, FinalityError, PublicationError, StoreError, ValidationError,
};
use crate::metrics::{record_duplicate_confirmation, record_publication};
use crate::models::{
    ContentKey, DonationDraft, DonationRecord, FinalityResult, KeyStrategy, TransactionHandle,
};
use crate::ports::{ContentStore, DonationSubmitter, LedgerClient};
use crate::services::session::{Clock, PublicationGuard, Session, SystemClock};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the annotation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Donation contract receiving the payable call.
    pub contract: Address,
    /// How content keys are derived.
    pub key_strategy: KeyStrategy,
    /// Reject donations above the donor's readable balance.
    pub check_donor_balance: bool,
}

impl PipelineConfig {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            key_strategy: KeyStrategy::default(),
            check_donor_balance: true,
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// A submitted donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub tx: TransactionHandle,
    pub donor: Address,
    pub draft: DonationDraft,
}

/// State of the current donation flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DonationState {
    #[default]
    Idle,
    /// Claimed by `submit`, transaction not yet broadcast.
    Submitting(DonationDraft),
    Submitted(Attempt),
    Confirmed(Attempt),
    Published {
        attempt: Attempt,
        key: ContentKey,
    },
    PublishFailed {
        attempt: Attempt,
        key: ContentKey,
        reason: String,
    },
    TransferFailed {
        attempt: Attempt,
        reason: String,
    },
}

impl DonationState {
    pub fn attempt(&self) -> Option<&Attempt> {
        match self {
            Self::Idle | Self::Submitting(_) => None,
            Self::Submitted(attempt) | Self::Confirmed(attempt) => Some(attempt),
            Self::Published { attempt, .. }
            | Self::PublishFailed { attempt, .. }
            | Self::TransferFailed { attempt, .. } => Some(attempt),
        }
    }

    /// A new attempt may start from this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Submitting(_) | Self::Submitted(_) | Self::Confirmed(_)
        )
    }

    /// Whether the funds moved; `None` while that is not yet known.
    pub fn funds_moved(&self) -> Option<bool> {
        match self {
            Self::Idle | Self::TransferFailed { .. } => Some(false),
            Self::Submitting(_) | Self::Submitted(_) => None,
            Self::Confirmed(_) | Self::Published { .. } | Self::PublishFailed { .. } => Some(true),
        }
    }

    /// Text shown to the donor.
    pub fn user_message(&self) -> String {
        match self {
            Self::Idle => String::new(),
            Self::Submitting(_) => "Sending transaction...".to_string(),
            Self::Submitted(_) => "Transaction sent! Waiting for confirmation...".to_string(),
            Self::Confirmed(_) => "Donation confirmed, saving your message...".to_string(),
            Self::Published { .. } => "Thank you for your donation!".to_string(),
            Self::PublishFailed { attempt, .. } => format!(
                "Your donation went through (transaction {}), but your message could not be saved. \
                 Please contact support with this transaction hash.",
                attempt.tx
            ),
            Self::TransferFailed { reason, .. } => format!("Transaction failed: {reason}"),
        }
    }
}

// =============================================================================
// AnnotationPipeline
// =============================================================================

/// One donation flow: validate, submit, await finality, publish the message.
pub struct AnnotationPipeline<L, W, S>
where
    L: LedgerClient,
    W: DonationSubmitter,
    S: ContentStore,
{
    config: PipelineConfig,
    ledger: Arc<L>,
    submitter: Arc<W>,
    store: Arc<S>,
    guard: Arc<PublicationGuard>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<DonationState>,
}

impl<L, W, S> AnnotationPipeline<L, W, S>
where
    L: LedgerClient,
    W: DonationSubmitter,
    S: ContentStore,
{
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<L>,
        submitter: Arc<W>,
        store: Arc<S>,
        session: &Session,
    ) -> Self {
        let (state, _rx) = watch::channel(DonationState::Idle);
        Self {
            config,
            ledger,
            submitter,
            store,
            guard: session.publication_guard(),
            clock: Arc::new(SystemClock),
            state,
        }
    }

    /// Replace the clock used for record timestamps and key nonces.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> DonationState {
        self.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DonationState> {
        self.state.subscribe()
    }

    /// Submit, wait for finality and publish the message.
    pub async fn donate(&self, draft: DonationDraft) -> DonationResult<DonationState> {
        self.submit(draft).await?;
        self.await_finality().await
    }

    /// `Idle -> Submitting -> Submitted`.
    ///
    /// Input is validated before any ledger call. The flow is claimed before
    /// the first await, so a concurrent `submit` gets `AttemptInProgress`; on
    /// failure the previous state is restored.
    #[instrument(skip_all, fields(name = %draft.name, amount = %format_ether(draft.amount)))]
    pub async fn submit(&self, draft: DonationDraft) -> DonationResult<TransactionHandle> {
        draft.validate()?;

        let mut previous = None;
        self.state.send_if_modified(|state| {
            if !state.is_terminal() {
                return false;
            }
            previous = Some(std::mem::replace(
                state,
                DonationState::Submitting(draft.clone()),
            ));
            true
        });
        let Some(previous) = previous else {
            return Err(DonationError::AttemptInProgress);
        };

        match self.send(&draft).await {
            Ok((tx, donor)) => {
                info!(tx = %tx, "📤 Donation submitted");
                self.state
                    .send_replace(DonationState::Submitted(Attempt { tx, donor, draft }));
                Ok(tx)
            }
            Err(e) => {
                self.state.send_replace(previous);
                Err(e)
            }
        }
    }

    async fn send(&self, draft: &DonationDraft) -> DonationResult<(TransactionHandle, Address)> {
        let donor = self.submitter.donor();
        if self.config.check_donor_balance {
            match self.ledger.get_balance(donor).await {
                Ok(available) if draft.amount > available => {
                    return Err(ValidationError::InsufficientBalance {
                        requested: draft.amount,
                        available,
                    }
                    .into());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "⚠️  Could not read donor balance, submitting anyway"),
            }
        }

        self.guard.reset();

        let tx = self
            .submitter
            .submit_donation(self.config.contract, draft.amount)
            .await?;
        Ok((tx, donor))
    }

    /// Wait for the current attempt's transaction to finalize, then publish.
    #[instrument(skip_all)]
    pub async fn await_finality(&self) -> DonationResult<DonationState> {
        let attempt = match self.state() {
            DonationState::Submitted(attempt) => attempt,
            other => {
                debug!(state = ?other, "No submitted attempt to wait for");
                return Ok(other);
            }
        };

        match self.ledger.wait_for_finality(&attempt.tx).await {
            Ok(FinalityResult::Success { block_number }) => {
                info!(tx = %attempt.tx, block = block_number, "✅ Donation confirmed");
                self.on_confirmed(&attempt.tx).await
            }
            Ok(FinalityResult::Reverted { block_number }) => {
                warn!(tx = %attempt.tx, block = block_number, "❌ Donation reverted");
                let err = FinalityError::Reverted(attempt.tx.hash());
                self.fail_transfer(attempt, err.to_string());
                Err(err.into())
            }
            Err(e) => {
                warn!(tx = %attempt.tx, error = %e, "❌ Could not confirm donation");
                let err = FinalityError::Unconfirmed {
                    tx: attempt.tx.hash(),
                    reason: e.to_string(),
                };
                self.fail_transfer(attempt, err.to_string());
                Err(err.into())
            }
        }
    }

    /// Handle a successful-finality notification for `tx`.
    ///
    /// May be called any number of times; only the first call for the
    /// current attempt publishes. Later calls, and calls for a handle other
    /// than the current attempt's, return the current state unchanged.
    #[instrument(skip(self), fields(tx = %tx))]
    pub async fn on_confirmed(&self, tx: &TransactionHandle) -> DonationResult<DonationState> {
        let attempt = match self.state() {
            DonationState::Submitted(attempt) if attempt.tx == *tx => attempt,
            current => {
                if current.attempt().is_some_and(|a| a.tx == *tx) {
                    debug!("Duplicate confirmation ignored");
                    record_duplicate_confirmation();
                } else {
                    warn!("Confirmation for an unknown transaction ignored");
                }
                return Ok(current);
            }
        };

        if !self.guard.try_claim() {
            debug!("Publication already attempted, ignoring confirmation");
            record_duplicate_confirmation();
            return Ok(self.state());
        }

        self.state
            .send_replace(DonationState::Confirmed(attempt.clone()));

        self.publish(attempt).await
    }

    /// `Confirmed -> Published | PublishFailed`. Never retried.
    async fn publish(&self, attempt: Attempt) -> DonationResult<DonationState> {
        let record = match DonationRecord::new(
            &attempt.draft.name,
            &attempt.draft.message,
            attempt.donor,
            attempt.tx.hash(),
            self.clock.now(),
            self.config.key_strategy,
        ) {
            Ok(record) => record,
            Err(e) => {
                // Drafts are validated on submit, so this only trips if the
                // validation rules changed mid-flight.
                error!(error = %e, "❌ Donation record rejected after confirmation");
                self.fail_publication(attempt, ContentKey::default(), e.to_string());
                return Err(e.into());
            }
        };
        let key = record.content_key.clone();

        let result = match record.to_bytes() {
            Ok(bytes) => self.store.put(key.as_str(), bytes).await.map(|_| ()),
            Err(e) => Err(StoreError::Serialization(e.to_string())),
        };

        match result {
            Ok(()) => {
                info!(key = %key, "📝 Donation message published");
                record_publication("published");
                let state = DonationState::Published { attempt, key };
                self.state.send_replace(state.clone());
                Ok(state)
            }
            Err(source) => {
                error!(key = %key, error = %source, "❌ Funds sent but message not saved");
                record_publication("failed");
                let tx = attempt.tx.hash();
                self.fail_publication(attempt, key.clone(), source.to_string());
                Err(PublicationError { tx, key: key.to_string(), source }.into())
            }
        }
    }

    fn fail_transfer(&self, attempt: Attempt, reason: String) {
        self.state
            .send_replace(DonationState::TransferFailed { attempt, reason });
    }

    fn fail_publication(&self, attempt: Attempt, key: ContentKey, reason: String) {
        self.state.send_replace(DonationState::PublishFailed {
            attempt,
            key,
            reason,
        });
    }
}
