// Copyright (c) 2024 Botho Foundation

//! Deposit Settlement CLI
//!
//! Runs the settlement monitor and exposes operator commands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deposit_settlement::{
    config::SettlementConfig,
    model::{format_amount, AttemptId, DepositMethod},
    notify::{create_notifier, spawn_dispatcher},
    provision::HttpProvisioner,
    ChainScanner, EngineSettings, EventBus, KeyVault, Monitor, MonitorSettings, RpcChainClient,
    SettlementEngine, SqliteLedger, Sweeper,
};

#[derive(Parser)]
#[command(name = "deposit-settlement")]
#[command(about = "On-chain deposit settlement engine")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "settlement.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the settlement monitor
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Open a payment attempt
    Create {
        /// Owner (customer) identifier
        #[arg(short, long)]
        owner: String,

        /// Tier name
        #[arg(short, long)]
        tier: String,

        /// Duration in units
        #[arg(short, long, default_value = "1")]
        duration: u32,

        /// Use a legacy memo instead of a deposit address
        #[arg(long)]
        memo: Option<String>,
    },

    /// Show an attempt and its transactions
    Status {
        /// Attempt id
        id: String,
    },

    /// Sweep an attempt's deposit address to the treasury
    Sweep {
        /// Attempt id
        id: String,
    },

    /// Expire unpaid attempts past their deadline
    Expire,

    /// Generate a new vault key
    GenerateVaultKey,

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if matches!(cli.command, Commands::GenerateVaultKey) {
        println!("{}", KeyVault::generate_key_hex());
        return Ok(());
    }

    let config = match SettlementConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            anyhow::bail!("Failed to load config from {:?}: {}", cli.config, e);
        }
    };

    match cli.command {
        Commands::ValidateConfig => {
            println!("Configuration is valid.");
            println!("  RPC endpoint: {}", config.rpc_endpoint);
            println!("  Treasury: {}", config.treasury_address);
            println!("  Environment: {:?}", config.environment);
            println!("  Poll interval: {}s", config.poll_interval_secs);
            println!("  Expiry: {} minutes", config.expiry_minutes);
            for tier in &config.tiers {
                println!(
                    "  Tier {}: {} per unit, allocation {}",
                    tier.name,
                    format_amount(tier.price_per_unit),
                    tier.allocation
                );
            }
            Ok(())
        }
        Commands::GenerateVaultKey => Ok(()),
        command => {
            let app = App::build(&config).await?;
            match command {
                Commands::Run { once } => app.run(once).await,
                Commands::Create {
                    owner,
                    tier,
                    duration,
                    memo,
                } => app.create(&owner, &tier, duration, memo.as_deref()).await,
                Commands::Status { id } => app.status(&AttemptId::from(id)).await,
                Commands::Sweep { id } => app.sweep(&AttemptId::from(id)).await,
                Commands::Expire => {
                    let n = app.engine.mark_expired().await?;
                    println!("Expired {} attempts", n);
                    Ok(())
                }
                Commands::ValidateConfig | Commands::GenerateVaultKey => Ok(()),
            }
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Wired-up engine and monitor.
struct App {
    engine: Arc<SettlementEngine>,
    monitor: Arc<Monitor>,
    bus: EventBus,
    webhook_url: Option<String>,
}

impl App {
    async fn build(config: &SettlementConfig) -> Result<Self> {
        let vault = Arc::new(KeyVault::from_config(
            config.vault_key.as_deref(),
            config.environment,
        )?);
        let ledger = Arc::new(SqliteLedger::open(&config.ledger_path)?);
        let timeout = Duration::from_secs(config.rpc_timeout_secs);
        let chain = Arc::new(RpcChainClient::new(&config.rpc_endpoint, timeout)?);
        let bus = EventBus::default();

        let sweeper = Arc::new(Sweeper::new(
            ledger.clone(),
            chain.clone(),
            vault.clone(),
            &config.treasury_address,
            bus.clone(),
        ));

        let mut engine = SettlementEngine::new(
            EngineSettings::from_config(config),
            ledger,
            vault,
            sweeper,
            bus.clone(),
        );
        if let Some(url) = &config.provisioning_url {
            engine = engine.with_provisioner(Arc::new(HttpProvisioner::new(url, timeout)?));
        }
        let engine = Arc::new(engine);

        let scanner = ChainScanner::new(chain, config.tolerance_bps, config.rpc_delay())
            .with_memo_pages(config.memo_scan_pages);
        let monitor = Arc::new(Monitor::new(
            engine.clone(),
            scanner,
            MonitorSettings::from_config(config),
        ));

        Ok(Self {
            engine,
            monitor,
            bus,
            webhook_url: config.webhook_url.clone(),
        })
    }

    async fn run(&self, once: bool) -> Result<()> {
        tracing::info!("Starting deposit settlement");
        let notifier = create_notifier(self.webhook_url.as_deref())?;
        let dispatcher = spawn_dispatcher(&self.bus, notifier);

        if once {
            if let Some(summary) = self.monitor.tick().await {
                tracing::info!("Tick complete: {:?}", summary);
            }
        } else {
            let shutdown = Arc::new(AtomicBool::new(false));
            let shutdown_clone = shutdown.clone();
            ctrlc::set_handler(move || {
                shutdown_clone.store(true, Ordering::SeqCst);
            })?;

            self.monitor.clone().run(shutdown).await;
        }

        // Give queued notifications a moment to drain
        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.abort();
        Ok(())
    }

    async fn create(
        &self,
        owner: &str,
        tier: &str,
        duration: u32,
        memo: Option<&str>,
    ) -> Result<()> {
        let attempt = match memo {
            Some(memo) => {
                self.engine
                    .create_memo_attempt(owner, tier, duration, memo)
                    .await?
            }
            None => self.engine.create_attempt(owner, tier, duration).await?,
        };

        println!("Attempt:   {}", attempt.id);
        match &attempt.deposit {
            DepositMethod::Address(address) => println!("Deposit:   {}", address),
            DepositMethod::Memo(memo) => println!("Memo:      {}", memo),
        }
        println!("Amount:    {}", format_amount(attempt.amount_expected));
        println!("Expires:   {}", attempt.expires_at.to_rfc3339());
        Ok(())
    }

    async fn status(&self, id: &AttemptId) -> Result<()> {
        let attempt = self.engine.get_attempt_by_id(id).await?;
        let transactions = self.engine.transactions_for(id).await?;

        println!("Attempt:   {}", attempt.id);
        println!("Owner:     {}", attempt.owner_id);
        println!("Tier:      {} x{}", attempt.tier, attempt.duration_units);
        println!("Status:    {}", attempt.status);
        println!(
            "Paid:      {} / {}",
            format_amount(attempt.amount_paid),
            format_amount(attempt.amount_expected)
        );
        match &attempt.deposit {
            DepositMethod::Address(address) => println!("Deposit:   {}", address),
            DepositMethod::Memo(memo) => println!("Memo:      {}", memo),
        }
        println!(
            "Key:       {}",
            if attempt.encrypted_private_key.is_some() {
                "held"
            } else {
                "cleared"
            }
        );
        if let Some(credential) = &attempt.credential_ref {
            println!("Credential: {}", credential);
        }
        println!("Expires:   {}", attempt.expires_at.to_rfc3339());

        if !transactions.is_empty() {
            println!("Transactions:");
            for tx in transactions {
                println!(
                    "  {} {} from {} ({} confirmations)",
                    tx.signature,
                    format_amount(tx.amount),
                    tx.sender_address,
                    tx.confirmations
                );
            }
        }
        Ok(())
    }

    async fn sweep(&self, id: &AttemptId) -> Result<()> {
        match self.engine.sweep(id).await? {
            Some(signature) => println!("Swept attempt {} in {}", id, signature),
            None => println!("Nothing swept for attempt {} (see logs)", id),
        }
        Ok(())
    }
}
