//! Almoner - donation ledger watcher and annotator.
//!
//! # Usage
//!
//! ```bash
//! # Follow the running total until Ctrl+C
//! CONTRACT_ADDRESS=0x... RPC_URL=http://localhost:8545 almoner watch
//!
//! # Donate 0.1 ether and publish a message
//! almoner donate --from 0x... --name alice --amount 0.1 \
//!     --message "Thanks for keeping the project alive, it helps a lot of people!"
//!
//! # Print published messages, newest first
//! LIGHTHOUSE_API_KEY=... almoner donors
//! ```

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::utils::{format_ether, parse_ether};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use almoner_core::error::{DonationError, StoreResult};
use almoner_core::metrics::init_metrics;
use almoner_core::models::{BlockRange, DonationDraft, KeyStrategy};
use almoner_core::ports::{ContentRef, ContentStore, StoredObject};
use almoner_core::retry::RetryPolicy;
use almoner_core::services::{
    AggregatorConfig, AnnotationAggregator, AnnotationPipeline, PipelineConfig, ReconcilerConfig,
    Session, TotalReconciler,
};
use almoner_evm::{EvmClient, EvmClientConfig};
use almoner_store::{LighthouseConfig, LighthouseStore, MemoryStore};

/// Almoner CLI - donation ledger watcher and annotator.
#[derive(Parser, Debug)]
#[command(name = "almoner")]
#[command(about = "Almoner - donation totals and donor messages for an EVM donation contract")]
#[command(version)]
struct Cli {
    /// EVM node JSON-RPC URL.
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Donation contract address (required by `watch` and `donate`).
    #[arg(long, env = "CONTRACT_ADDRESS")]
    contract: Option<Address>,

    /// Expected chain id (checked at connect time).
    #[arg(long, env = "CHAIN_ID")]
    chain_id: Option<u64>,

    /// Etherscan V2 compatible API URL for transfer history.
    #[arg(long, env = "EXPLORER_URL", default_value = "https://api.etherscan.io/v2/api")]
    explorer_url: String,

    /// Block explorer API key.
    #[arg(long, env = "EXPLORER_API_KEY")]
    explorer_api_key: Option<String>,

    /// Lighthouse API key. Without it, messages are kept in memory only.
    #[arg(long, env = "LIGHTHOUSE_API_KEY")]
    lighthouse_api_key: Option<String>,

    /// Prometheus metrics port (disabled when unset).
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the running total and follow live donations until stopped.
    Watch {
        /// First block of the historical scan.
        #[arg(long, env = "SCAN_FROM_BLOCK", default_value = "0")]
        from_block: u64,

        /// Balance refresh interval in seconds (0 = only at start).
        #[arg(long, env = "BALANCE_REFRESH_SECS", default_value = "30")]
        refresh_secs: u64,
    },

    /// Send a donation and publish its message once confirmed.
    Donate {
        /// Node-managed account the donation is sent from.
        #[arg(long, env = "DONOR_ADDRESS")]
        from: Address,

        /// Donor display name.
        #[arg(long)]
        name: String,

        /// Message (at least 50 characters).
        #[arg(long)]
        message: String,

        /// Amount in ether (e.g., 0.1).
        #[arg(long, value_parser = parse_amount)]
        amount: U256,

        /// How the message's storage key is derived.
        #[arg(long, env = "KEY_STRATEGY", value_enum, default_value_t = KeyStrategyArg::NameNonce)]
        key_strategy: KeyStrategyArg,
    },

    /// Print published donor messages, newest first.
    Donors,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KeyStrategyArg {
    NameNonce,
    Digest,
}

impl From<KeyStrategyArg> for KeyStrategy {
    fn from(arg: KeyStrategyArg) -> Self {
        match arg {
            KeyStrategyArg::NameNonce => KeyStrategy::NameNonce,
            KeyStrategyArg::Digest => KeyStrategy::Digest,
        }
    }
}

/// Parse an ether amount into wei.
fn parse_amount(s: &str) -> Result<U256, String> {
    parse_ether(s.trim()).map_err(|e| format!("Invalid amount '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    if let Some(port) = cli.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
        {
            Ok(()) => {
                init_metrics();
                info!("📊 Metrics:  http://localhost:{}/metrics", port);
            }
            Err(e) => {
                warn!("⚠️  Failed to start metrics exporter: {}. Continuing without metrics.", e);
            }
        }
    }

    let store = Arc::new(build_store(cli.lighthouse_api_key.as_deref())?);

    match cli.command {
        Command::Donors => list_donors(store).await,
        Command::Watch {
            from_block,
            refresh_secs,
        } => {
            let contract = require_contract(&cli)?;
            let ledger = connect_ledger(&cli).await?;
            watch_total(ledger, contract, from_block, refresh_secs).await
        }
        Command::Donate {
            from,
            ref name,
            ref message,
            amount,
            key_strategy,
        } => {
            let contract = require_contract(&cli)?;
            let ledger = connect_ledger(&cli).await?;
            let draft = DonationDraft::new(name.clone(), message.clone(), amount);
            donate(ledger, store, contract, from, draft, key_strategy.into()).await
        }
    }
}

fn require_contract(cli: &Cli) -> Result<Address> {
    cli.contract
        .context("A contract address is required (--contract or CONTRACT_ADDRESS)")
}

// =============================================================================
// Commands
// =============================================================================

async fn connect_ledger(cli: &Cli) -> Result<Arc<EvmClient>> {
    info!("📡 Connecting to EVM node...");
    debug!(rpc_url = %mask_secret(&cli.rpc_url), "RPC endpoint");

    let config = EvmClientConfig {
        rpc_url: cli.rpc_url.clone(),
        explorer_url: cli.explorer_url.clone(),
        explorer_api_key: cli.explorer_api_key.clone(),
        chain_id: cli.chain_id,
        retry: RetryPolicy::default(),
        ..Default::default()
    };
    let client = EvmClient::connect(config)
        .await
        .context("Failed to connect to EVM node")?;
    let head = client.block_number().await?;

    info!(chain_id = client.chain_id(), head, "🔗 Chain connected");
    Ok(Arc::new(client))
}

async fn watch_total(
    ledger: Arc<EvmClient>,
    contract: Address,
    from_block: u64,
    refresh_secs: u64,
) -> Result<()> {
    info!("🚀 Starting Almoner watcher");

    let session = Session::new();
    let config = ReconcilerConfig {
        scan_range: BlockRange {
            from: from_block,
            to: None,
        },
        balance_refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
        ..ReconcilerConfig::for_contract(contract)
    };
    let reconciler = Arc::new(TotalReconciler::new(config, ledger, &session));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut totals = reconciler.subscribe();
    let mut observer_shutdown_rx = shutdown_tx.subscribe();
    let observer_handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    changed = totals.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let total = *totals.borrow_and_update();
                        debug!(
                            total = %format_ether(total.value),
                            source = ?total.source,
                            as_of = total.as_of,
                            "Total updated"
                        );
                    }
                    _ = observer_shutdown_rx.changed() => break,
                }
            }
        }
        .instrument(info_span!("observer")),
    );

    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.run(shutdown_rx).await }.instrument(info_span!("reconciler"))
    });

    info!("✅ Almoner ready");
    info!("   💰 Contract: {}", contract);
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(10), reconciler_handle).await {
        Ok(_) => debug!("Reconciler stopped"),
        Err(_) => warn!("⚠️  Reconciler shutdown timed out"),
    }
    let _ = observer_handle.await;

    info!(
        total = %format_ether(reconciler.current().value),
        "🛑 Shutdown complete"
    );
    Ok(())
}

async fn donate(
    ledger: Arc<EvmClient>,
    store: Arc<Store>,
    contract: Address,
    from: Address,
    draft: DonationDraft,
    key_strategy: KeyStrategy,
) -> Result<()> {
    let session = Session::new();
    let submitter = Arc::new(ledger.submitter(from));
    let config = PipelineConfig {
        key_strategy,
        ..PipelineConfig::new(contract)
    };
    let pipeline = AnnotationPipeline::new(config, ledger, submitter, store, &session);

    info!(amount = %format_ether(draft.amount), "🎁 Sending donation");
    let outcome = match pipeline.submit(draft).await {
        Ok(tx) => {
            println!("{}", pipeline.state().user_message());
            println!("   Transaction: {}", tx);
            pipeline.await_finality().await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(state) => {
            println!("{}", state.user_message());
            Ok(())
        }
        Err(DonationError::Validation(e)) => bail!("{}", e),
        Err(e) => {
            let state = pipeline.state();
            if e.funds_moved() {
                error!(error = %e, "❌ Donation sent but message not saved");
            } else {
                error!(error = %e, "❌ Donation failed");
            }
            if state.attempt().is_some() {
                println!("{}", state.user_message());
            }
            Err(e.into())
        }
    }
}

async fn list_donors(store: Arc<Store>) -> Result<()> {
    let aggregator = AnnotationAggregator::new(AggregatorConfig::default(), store);
    let records = aggregator
        .list_published()
        .await
        .context("Failed to list donor messages")?;

    if records.is_empty() {
        println!("No donor messages yet.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  ({})",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            record.name,
            record.donor
        );
        println!("    {}", record.message);
    }
    Ok(())
}

// =============================================================================
// Content store selection
// =============================================================================

/// Content store chosen at startup.
enum Store {
    Lighthouse(LighthouseStore),
    Memory(MemoryStore),
}

fn build_store(api_key: Option<&str>) -> Result<Store> {
    match api_key {
        Some(key) if !key.trim().is_empty() => {
            let store = LighthouseStore::new(LighthouseConfig::with_api_key(key))
                .context("Failed to create Lighthouse client")?;
            Ok(Store::Lighthouse(store))
        }
        _ => {
            warn!("⚠️  No LIGHTHOUSE_API_KEY set, donor messages are kept in memory only");
            Ok(Store::Memory(MemoryStore::new()))
        }
    }
}

#[async_trait]
impl ContentStore for Store {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<ContentRef> {
        match self {
            Self::Lighthouse(store) => store.put(key, bytes).await,
            Self::Memory(store) => store.put(key, bytes).await,
        }
    }

    async fn list(&self) -> StoreResult<Vec<StoredObject>> {
        match self {
            Self::Lighthouse(store) => store.list().await,
            Self::Memory(store) => store.list().await,
        }
    }

    async fn get(&self, reference: &ContentRef) -> StoreResult<Vec<u8>> {
        match self {
            Self::Lighthouse(store) => store.get(reference).await,
            Self::Memory(store) => store.get(reference).await,
        }
    }
}

// =============================================================================
// Process plumbing
// =============================================================================

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Mask credentials and API keys in a URL for logging.
fn mask_secret(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            // Hosted RPC providers put the key in the last path segment
            let masked_path = url.path_segments().and_then(|segments| {
                let segments: Vec<&str> = segments.collect();
                let last = segments.last()?;
                (last.len() >= 16).then(|| {
                    let mut masked = segments[..segments.len() - 1].join("/");
                    masked.push_str(if masked.is_empty() { "****" } else { "/****" });
                    masked
                })
            });
            if let Some(path) = masked_path {
                url.set_path(&path);
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "❌ Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "❌ Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
