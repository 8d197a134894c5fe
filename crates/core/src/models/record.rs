//! Donation message records and their content keys.

use std::fmt;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Minimum message length, in characters.
pub const MIN_MESSAGE_CHARS: usize = 50;

// =============================================================================
// Content Keys
// =============================================================================

/// How content keys are derived for new records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// `donation-<name>-<unix millis>`.
    #[default]
    NameNonce,
    /// `donation-<sha256 of the record and transaction hash>`.
    Digest,
}

/// Caller-chosen key a record is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentKey(String);

impl ContentKey {
    /// Prefix shared by every donation record key.
    pub const PREFIX: &'static str = "donation-";

    /// Key from the donor name and a millisecond nonce.
    pub fn from_name_nonce(name: &str, nonce_millis: i64) -> Self {
        Self(format!("{}{}-{}", Self::PREFIX, slug(name), nonce_millis))
    }

    /// Whether a store key follows the donation record naming convention.
    pub fn is_donation_key(key: &str) -> bool {
        key.starts_with(Self::PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContentKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Lowercase ASCII slug; runs of other characters collapse into one `-`.
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "anonymous".to_string()
    } else {
        trimmed.to_string()
    }
}

// =============================================================================
// Drafts & Records
// =============================================================================

/// User input for one donation, before anything touches the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationDraft {
    pub name: String,
    pub message: String,
    /// Amount in wei.
    pub amount: U256,
}

impl DonationDraft {
    pub fn new(name: impl Into<String>, message: impl Into<String>, amount: U256) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            amount,
        }
    }

    /// Validate the annotation fields and the amount.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_annotation(&self.name, &self.message)?;
        if self.amount.is_zero() {
            return Err(ValidationError::ZeroAmount);
        }
        Ok(())
    }
}

fn validate_annotation(name: &str, message: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let len = message.chars().count();
    if len < MIN_MESSAGE_CHARS {
        return Err(ValidationError::MessageTooShort {
            len,
            min: MIN_MESSAGE_CHARS,
        });
    }
    Ok(())
}

/// A published donation message.
///
/// The JSON form (`name`, `message`, `timestamp`, `donor`, `txHash`) is what
/// lands in the content store. `content_key` is not serialized: on read it
/// comes from the store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationRecord {
    pub name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub donor: Address,
    #[serde(rename = "txHash", default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    #[serde(skip)]
    pub content_key: ContentKey,
}

impl DonationRecord {
    /// Build a record for a confirmed transfer.
    ///
    /// Fails if the name is empty or the message too short, so an invalid
    /// record can never be constructed.
    pub fn new(
        name: &str,
        message: &str,
        donor: Address,
        tx_hash: B256,
        now: DateTime<Utc>,
        strategy: KeyStrategy,
    ) -> Result<Self, ValidationError> {
        validate_annotation(name, message)?;

        let mut record = Self {
            name: name.trim().to_string(),
            message: message.to_string(),
            timestamp: now,
            donor,
            tx_hash: Some(tx_hash),
            content_key: ContentKey::default(),
        };
        record.content_key = match strategy {
            KeyStrategy::NameNonce => ContentKey::from_name_nonce(name, now.timestamp_millis()),
            KeyStrategy::Digest => record.digest_key(),
        };
        Ok(record)
    }

    /// Parse stored bytes, attaching the key they were listed under.
    ///
    /// Stored records are held to the same name and message rules as new ones.
    pub fn from_slice(key: &str, bytes: &[u8]) -> Result<Self, ValidationError> {
        let malformed = |reason: String| ValidationError::MalformedRecord {
            key: key.to_string(),
            reason,
        };
        let mut record: Self =
            serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
        validate_annotation(&record.name, &record.message)
            .map_err(|e| malformed(e.to_string()))?;
        record.content_key = ContentKey::from(key.to_string());
        Ok(record)
    }

    /// Serialized form written to the content store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn digest_key(&self) -> ContentKey {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.message.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.donor.as_slice());
        if let Some(tx) = &self.tx_hash {
            hasher.update(tx.as_slice());
        }
        ContentKey(format!("{}{}", ContentKey::PREFIX, hex::encode(hasher.finalize())))
    }
}
