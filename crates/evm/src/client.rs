//! EVM client implementing the ledger ports over JSON-RPC.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, trace, warn};

use almoner_core::error::{LedgerError, LedgerResult};
use almoner_core::models::{BlockRange, ContractEvent, FinalityResult, TransactionHandle};
use almoner_core::ports::{
    DonationSubmitter, EventSubscription, LedgerClient, TransferStream,
};
use almoner_core::retry::RetryPolicy;

use crate::abi::{RpcLog, decode_log, donate_calldata, event_topic};
use crate::explorer::Explorer;
use crate::rpc::{RpcTransport, parse_u64, parse_u256, quantity, quantity_u256};

/// Configuration for the EVM client.
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    /// JSON-RPC endpoint (e.g., "http://localhost:8545").
    pub rpc_url: String,
    /// Etherscan V2 compatible API endpoint.
    pub explorer_url: String,
    pub explorer_api_key: Option<String>,
    /// Expected chain id; connecting fails if the node reports another one.
    pub chain_id: Option<u64>,
    /// Interval between log and receipt polls.
    pub poll_interval: Duration,
    /// Blocks on top of the inclusion block required for finality (1 = included).
    pub confirmations: u64,
    /// Give up waiting for finality after this long.
    pub finality_timeout: Duration,
    /// Explorer rows per page.
    pub page_size: u32,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EvmClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            explorer_url: "https://api.etherscan.io/v2/api".to_string(),
            explorer_api_key: None,
            chain_id: None,
            poll_interval: Duration::from_secs(4),
            confirmations: 1,
            finality_timeout: Duration::from_secs(300),
            page_size: 1000,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    block_number: Option<String>,
    /// Absent on pre-Byzantium chains.
    status: Option<String>,
}

/// EVM adapter implementing the ledger ports.
pub struct EvmClient {
    rpc: Arc<RpcTransport>,
    explorer: Arc<Explorer>,
    chain_id: u64,
    poll_interval: Duration,
    confirmations: u64,
    finality_timeout: Duration,
}

impl EvmClient {
    /// Connect to an EVM node and check its chain id.
    #[instrument(skip_all)]
    pub async fn connect(config: EvmClientConfig) -> LedgerResult<Self> {
        debug!("Connecting to node");

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let rpc = Arc::new(RpcTransport::new(
            http.clone(),
            config.rpc_url.clone(),
            config.retry,
        ));

        let chain_id: String = rpc.call("eth_chainId", json!([])).await?;
        let chain_id = parse_u64(&chain_id)?;
        if let Some(expected) = config.chain_id
            && expected != chain_id
        {
            return Err(LedgerError::Rejected(format!(
                "chain id mismatch: expected {expected}, node reports {chain_id}"
            )));
        }

        let explorer = Arc::new(Explorer {
            http,
            url: config.explorer_url,
            api_key: config.explorer_api_key,
            chain_id,
            page_size: config.page_size.max(1),
            retry: config.retry,
        });

        debug!(chain_id, "Connected successfully");

        Ok(Self {
            rpc,
            explorer,
            chain_id,
            poll_interval: config.poll_interval,
            confirmations: config.confirmations.max(1),
            finality_timeout: config.finality_timeout,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Current head block number.
    pub async fn block_number(&self) -> LedgerResult<u64> {
        block_number(&self.rpc).await
    }

    /// Submitter sending donations from `from`, an account unlocked on the node.
    pub fn submitter(&self, from: Address) -> EvmSubmitter {
        EvmSubmitter {
            rpc: self.rpc.clone(),
            from,
        }
    }

    async fn receipt(&self, tx: B256) -> LedgerResult<Option<RpcReceipt>> {
        self.rpc
            .call("eth_getTransactionReceipt", json!([tx]))
            .await
    }

    async fn poll_finality(&self, tx: &TransactionHandle) -> LedgerResult<FinalityResult> {
        let receipt = loop {
            if let Some(receipt) = self.receipt(tx.hash()).await? {
                break receipt;
            }
            trace!(tx = %tx, "Receipt not available yet");
            tokio::time::sleep(self.poll_interval).await;
        };

        let block_number = receipt
            .block_number
            .as_deref()
            .ok_or_else(|| LedgerError::Decode("receipt without block number".into()))
            .and_then(parse_u64)?;

        let target = block_number + self.confirmations - 1;
        loop {
            let head = self.block_number().await?;
            if head >= target {
                break;
            }
            trace!(tx = %tx, head, target, "Waiting for confirmations");
            tokio::time::sleep(self.poll_interval).await;
        }

        let succeeded = match receipt.status.as_deref() {
            Some(status) => parse_u64(status)? == 1,
            None => true,
        };
        Ok(if succeeded {
            FinalityResult::Success { block_number }
        } else {
            FinalityResult::Reverted { block_number }
        })
    }
}

async fn block_number(rpc: &RpcTransport) -> LedgerResult<u64> {
    let head: String = rpc.call("eth_blockNumber", json!([])).await?;
    parse_u64(&head)
}

#[async_trait]
impl LedgerClient for EvmClient {
    async fn get_balance(&self, address: Address) -> LedgerResult<U256> {
        let balance: String = self
            .rpc
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_u256(&balance)
    }

    async fn list_incoming_transfers(
        &self,
        address: Address,
        range: BlockRange,
    ) -> LedgerResult<TransferStream> {
        Ok(self.explorer.clone().transfers(address, range))
    }

    #[instrument(skip_all, fields(contract = %contract, event = event_name))]
    async fn subscribe_events(
        &self,
        contract: Address,
        event_name: &str,
    ) -> LedgerResult<EventSubscription> {
        let topic = event_topic(event_name)?;
        let head = self.block_number().await?;
        debug!(from_block = head + 1, "📡 Polling contract logs");

        let poller = LogPoller {
            rpc: self.rpc.clone(),
            contract,
            topic,
            event_name: event_name.to_string(),
            next_block: head + 1,
            interval: self.poll_interval,
            pending: VecDeque::new(),
            failed: false,
        };
        let events = stream::unfold(poller, |mut poller| async move {
            let item = poller.next_event().await?;
            Some((item, poller))
        })
        .boxed();

        Ok(EventSubscription::new(events))
    }

    #[instrument(skip_all, fields(tx = %tx))]
    async fn wait_for_finality(&self, tx: &TransactionHandle) -> LedgerResult<FinalityResult> {
        tokio::time::timeout(self.finality_timeout, self.poll_finality(tx))
            .await
            .map_err(|_| {
                LedgerError::Timeout(format!(
                    "transaction {tx} not final after {}s",
                    self.finality_timeout.as_secs()
                ))
            })?
    }
}

// =============================================================================
// Log polling
// =============================================================================

/// Polls `eth_getLogs` for one event of one contract, block range by block
/// range, starting after the head seen at subscription time.
struct LogPoller {
    rpc: Arc<RpcTransport>,
    contract: Address,
    topic: B256,
    event_name: String,
    next_block: u64,
    interval: Duration,
    pending: VecDeque<ContractEvent>,
    failed: bool,
}

impl LogPoller {
    /// Next event, an error once the node can no longer be reached, then `None`.
    async fn next_event(&mut self) -> Option<LedgerResult<ContractEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.failed {
                return None;
            }
            tokio::time::sleep(self.interval).await;
            if let Err(e) = self.poll().await {
                warn!(error = %e, "⚠️  Log polling failed");
                self.failed = true;
                return Some(Err(e));
            }
        }
    }

    async fn poll(&mut self) -> LedgerResult<()> {
        let head = block_number(&self.rpc).await?;
        if head < self.next_block {
            return Ok(());
        }

        let filter = json!({
            "address": self.contract,
            "topics": [self.topic],
            "fromBlock": quantity(self.next_block),
            "toBlock": quantity(head),
        });
        let logs: Vec<RpcLog> = self.rpc.call("eth_getLogs", json!([filter])).await?;
        trace!(from = self.next_block, to = head, logs = logs.len(), "Logs polled");

        self.pending.extend(decode_batch(&self.event_name, &logs));
        self.next_block = head + 1;
        Ok(())
    }
}

/// Decode one `eth_getLogs` batch, skipping removed and undecodable logs.
fn decode_batch(event_name: &str, logs: &[RpcLog]) -> Vec<ContractEvent> {
    logs.iter()
        .filter(|log| !log.removed)
        .filter_map(|log| match decode_log(event_name, log) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(
                    tx = ?log.transaction_hash,
                    error = %e,
                    "⚠️  Skipping undecodable log"
                );
                None
            }
        })
        .collect()
}

// =============================================================================
// Submission
// =============================================================================

/// Sends `donate()` through `eth_sendTransaction` from a node-managed account.
pub struct EvmSubmitter {
    rpc: Arc<RpcTransport>,
    from: Address,
}

#[async_trait]
impl DonationSubmitter for EvmSubmitter {
    fn donor(&self) -> Address {
        self.from
    }

    #[instrument(skip(self), fields(from = %self.from))]
    async fn submit_donation(
        &self,
        contract: Address,
        value: U256,
    ) -> LedgerResult<TransactionHandle> {
        let transaction = json!({
            "from": self.from,
            "to": contract,
            "value": quantity_u256(value),
            "data": donate_calldata(),
        });

        // Not idempotent: never retried
        let hash: B256 = self
            .rpc
            .call_once("eth_sendTransaction", &json!([transaction]))
            .await?;

        info!(tx = %hash, "📤 Transaction broadcast");
        Ok(TransactionHandle(hash))
    }
}
