//! Core domain layer for Almoner, a donation ledger reconciler.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! business logic services. It follows hexagonal architecture principles:
//! this is the innermost layer, with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      almoner (binary)                       │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │         almoner-evm          │        almoner-store         │
//! │   (JSON-RPC, block explorer) │   (Lighthouse, in-memory)    │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                     almoner-core  ← YOU ARE HERE            │
//! │               (models, ports, services)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Transfer, RunningTotal, DonationRecord, etc.)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Reconciler, annotation pipeline and aggregator
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//! - [`retry`] - Retry policy used by the adapters
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::LedgerClient`] - Balances, transfer history, events, finality
//! - [`ports::DonationSubmitter`] - Send the payable donation call
//! - [`ports::ContentStore`] - Write, list and read donation messages
//!
//! ## Running Total
//!
//! [`services::TotalReconciler`] merges a historical scan, balance
//! snapshots and live events into one total. Snapshots overwrite, events
//! add, and a scan is only applied while nothing better has arrived.
//!
//! ## Donation Lifecycle
//!
//! 1. Validate the name, message and amount
//! 2. Submit the payable call
//! 3. Wait for finality
//! 4. Publish the message exactly once
//! 5. Report whether the funds moved and whether the message was saved

pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod retry;
pub mod services;
