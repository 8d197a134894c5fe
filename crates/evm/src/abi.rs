//! Donation contract ABI: event topics, log decoding and call data.

use alloy_primitives::{Address, B256, U256, keccak256};
use serde::Deserialize;

use almoner_core::error::{LedgerError, LedgerResult};
use almoner_core::models::{ContractEvent, DONATION_RECEIVED};

use crate::rpc::parse_u64;

const DONATION_RECEIVED_SIGNATURE: &str = "DonationReceived(address,uint256)";
const DONATE_SIGNATURE: &str = "donate()";

/// topic0 of a known contract event.
pub(crate) fn event_topic(event_name: &str) -> LedgerResult<B256> {
    match event_name {
        DONATION_RECEIVED => Ok(keccak256(DONATION_RECEIVED_SIGNATURE)),
        other => Err(LedgerError::UnknownEvent(other.to_string())),
    }
}

/// Call data for the payable `donate()`.
pub(crate) fn donate_calldata() -> String {
    format!("0x{}", hex::encode(&keccak256(DONATE_SIGNATURE)[..4]))
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    pub topics: Vec<B256>,
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// Decode a `DonationReceived(address indexed donor, uint256 amount)` log.
///
/// Pending logs (no block number yet) are rejected; the poller only asks
/// for mined ranges.
pub(crate) fn decode_log(event_name: &str, log: &RpcLog) -> LedgerResult<ContractEvent> {
    let block_number = log
        .block_number
        .as_deref()
        .ok_or_else(|| LedgerError::Decode("log without block number".into()))
        .and_then(parse_u64)?;
    let log_index = log.log_index.as_deref().map(parse_u64).transpose()?.unwrap_or(0);

    let donor = log.topics.get(1).map(|topic| Address::from_word(*topic));

    let data = hex::decode(log.data.trim_start_matches("0x"))
        .map_err(|e| LedgerError::Decode(format!("log data: {e}")))?;
    let amount = match data.len() {
        0 => None,
        len if len >= 32 => Some(U256::from_be_slice(&data[..32])),
        len => return Err(LedgerError::Decode(format!("log data is {len} bytes"))),
    };

    Ok(ContractEvent {
        name: event_name.to_string(),
        tx_hash: log.transaction_hash.unwrap_or_default(),
        log_index,
        block_number,
        donor,
        amount,
    })
}
