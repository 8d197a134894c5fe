//! Block explorer client for address transaction history.
//!
//! Speaks the Etherscan V2 `account/txlist` API, which pages results and
//! answers errors with `status: "0"` and a string `result`.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use chrono::DateTime;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use tracing::{debug, trace};

use almoner_core::error::{LedgerError, LedgerResult};
use almoner_core::models::{BlockRange, Transfer};
use almoner_core::ports::TransferStream;
use almoner_core::retry::RetryPolicy;

use crate::rpc::http_error;

/// Highest block Etherscan accepts as an open-ended `endblock`.
const OPEN_END_BLOCK: u64 = 99_999_999;

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorerTx {
    block_number: String,
    time_stamp: String,
    hash: B256,
    from: Address,
    /// Empty for contract creation.
    to: String,
    value: String,
    #[serde(default)]
    is_error: String,
}

/// One decoded page: raw row count (for paging) and the usable transfers.
#[derive(Debug)]
struct Page {
    rows: usize,
    transfers: Vec<Transfer>,
}

pub(crate) struct Explorer {
    pub(crate) http: reqwest::Client,
    pub(crate) url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) chain_id: u64,
    pub(crate) page_size: u32,
    pub(crate) retry: RetryPolicy,
}

impl Explorer {
    /// Lazily page through the transfers of `address`, ascending by block.
    pub(crate) fn transfers(self: Arc<Self>, address: Address, range: BlockRange) -> TransferStream {
        stream::try_unfold(Some(1u32), move |page| {
            let explorer = self.clone();
            async move {
                let Some(page) = page else {
                    return Ok::<_, LedgerError>(None);
                };
                let batch = explorer.fetch_page(address, range, page).await?;
                let next = (batch.rows >= explorer.page_size as usize).then_some(page + 1);
                debug!(page, rows = batch.rows, "📄 Explorer page fetched");
                Ok(Some((batch.transfers, next)))
            }
        })
        .map_ok(|transfers| stream::iter(transfers.into_iter().map(Ok::<_, LedgerError>)))
        .try_flatten()
        .boxed()
    }

    async fn fetch_page(&self, address: Address, range: BlockRange, page: u32) -> LedgerResult<Page> {
        let mut query = vec![
            ("chainid", self.chain_id.to_string()),
            ("module", "account".to_string()),
            ("action", "txlist".to_string()),
            ("address", address.to_string()),
            ("startblock", range.from.to_string()),
            ("endblock", range.to.unwrap_or(OPEN_END_BLOCK).to_string()),
            ("page", page.to_string()),
            ("offset", self.page_size.to_string()),
            ("sort", "asc".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.clone()));
        }

        self.retry
            .run("explorer_txlist", || async {
                let response = self
                    .http
                    .get(&self.url)
                    .query(&query)
                    .send()
                    .await
                    .map_err(http_error)?;
                let status = response.status();
                if status.as_u16() == 429 || status.is_server_error() {
                    return Err(LedgerError::Unavailable(format!("explorer: HTTP {status}")));
                }
                let body: ExplorerResponse = response.json().await.map_err(http_error)?;
                parse_page(body)
            })
            .await
    }
}

fn parse_page(body: ExplorerResponse) -> LedgerResult<Page> {
    if body.status != "1" {
        if body.message.starts_with("No transactions found") {
            return Ok(Page {
                rows: 0,
                transfers: Vec::new(),
            });
        }
        let detail = body.result.as_str().unwrap_or(&body.message).to_string();
        return Err(if detail.to_ascii_lowercase().contains("rate limit") {
            LedgerError::Unavailable(format!("explorer: {detail}"))
        } else {
            LedgerError::Rejected(format!("explorer: {detail}"))
        });
    }

    let rows: Vec<ExplorerTx> = serde_json::from_value(body.result)
        .map_err(|e| LedgerError::Decode(format!("explorer txlist: {e}")))?;
    let count = rows.len();

    let mut transfers = Vec::with_capacity(count);
    for row in rows {
        if row.is_error == "1" {
            trace!(tx = %row.hash, "Skipping failed transaction");
            continue;
        }
        transfers.push(to_transfer(row)?);
    }

    Ok(Page {
        rows: count,
        transfers,
    })
}

fn to_transfer(row: ExplorerTx) -> LedgerResult<Transfer> {
    let decode = |field: &str, e: String| LedgerError::Decode(format!("explorer {field}: {e}"));

    let block_number = row
        .block_number
        .parse::<u64>()
        .map_err(|e| decode("blockNumber", e.to_string()))?;
    let value = U256::from_str_radix(&row.value, 10).map_err(|e| decode("value", e.to_string()))?;
    let to = if row.to.is_empty() {
        None
    } else {
        Some(row.to.parse::<Address>().map_err(|e| decode("to", e.to_string()))?)
    };
    let block_timestamp = row
        .time_stamp
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    Ok(Transfer {
        tx_hash: row.hash,
        block_number,
        from: row.from,
        to,
        value,
        block_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> ExplorerResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_txlist_page() {
        let page = parse_page(body(
            r#"{"status":"1","message":"OK","result":[
                {"blockNumber":"100","timeStamp":"1700000000","hash":"0x1111111111111111111111111111111111111111111111111111111111111111",
                 "from":"0x00000000000000000000000000000000000000d0","to":"0x00000000000000000000000000000000000000aa",
                 "value":"2000000000000000000","isError":"0"},
                {"blockNumber":"101","timeStamp":"1700000012","hash":"0x2222222222222222222222222222222222222222222222222222222222222222",
                 "from":"0x00000000000000000000000000000000000000d0","to":"0x00000000000000000000000000000000000000aa",
                 "value":"1","isError":"1"},
                {"blockNumber":"102","timeStamp":"1700000024","hash":"0x3333333333333333333333333333333333333333333333333333333333333333",
                 "from":"0x00000000000000000000000000000000000000aa","to":"",
                 "value":"0","isError":"0"}
            ]}"#,
        ))
        .unwrap();

        assert_eq!(page.rows, 3);
        assert_eq!(page.transfers.len(), 2);

        let first = &page.transfers[0];
        assert_eq!(first.block_number, 100);
        assert_eq!(first.value, U256::from(2_000_000_000_000_000_000u64));
        assert_eq!(first.to, Some(Address::with_last_byte(0xaa)));
        assert_eq!(first.from, Address::with_last_byte(0xd0));
        assert_eq!(first.block_timestamp.unwrap().timestamp(), 1_700_000_000);

        // Contract creation has no recipient
        assert_eq!(page.transfers[1].to, None);
    }

    #[test]
    fn test_no_transactions_is_an_empty_page() {
        let page = parse_page(body(
            r#"{"status":"0","message":"No transactions found","result":[]}"#,
        ))
        .unwrap();
        assert_eq!(page.rows, 0);
        assert!(page.transfers.is_empty());
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let err = parse_page(body(
            r#"{"status":"0","message":"NOTOK","result":"Max rate limit reached"}"#,
        ))
        .unwrap_err();
        assert!(err.is_transient());

        let err = parse_page(body(
            r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }
}
