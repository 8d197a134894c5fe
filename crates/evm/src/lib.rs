//! EVM adapter for Almoner.
//!
//! This crate implements the [`LedgerClient`] and [`DonationSubmitter`]
//! ports from `almoner-core` for EVM chains, over plain HTTP JSON-RPC plus
//! an Etherscan V2 compatible block explorer.
//!
//! # Features
//!
//! - Balance reads via `eth_getBalance`
//! - Lazy, paged transaction history from the explorer's `txlist`
//! - `DonationReceived` events by polling `eth_getLogs`
//! - Finality via receipt polling with a confirmation depth and timeout
//! - Chain id check at connect time
//!
//! # Usage
//!
//! ```ignore
//! use almoner_evm::{EvmClient, EvmClientConfig};
//!
//! let config = EvmClientConfig {
//!     rpc_url: "http://localhost:8545".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = EvmClient::connect(config).await?;
//! let balance = client.get_balance(contract).await?;
//! let mut events = client.subscribe_events(contract, "DonationReceived").await?;
//!
//! while let Some(event) = events.next().await {
//!     // Apply event...
//! }
//! ```
//!
//! Every read goes through the configured [`RetryPolicy`]; transaction
//! submission is sent once.
//!
//! [`LedgerClient`]: almoner_core::ports::LedgerClient
//! [`DonationSubmitter`]: almoner_core::ports::DonationSubmitter
//! [`RetryPolicy`]: almoner_core::retry::RetryPolicy

mod abi;
mod client;
mod explorer;
mod rpc;

pub use client::{EvmClient, EvmClientConfig, EvmSubmitter};
