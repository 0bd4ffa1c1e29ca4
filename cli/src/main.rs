// veil: command-line front end for the Veil mixing engine
//
// `simulate` runs a complete in-process scenario against the simulated
// ledger with a manual clock. `run` hosts the engine over the on-disk store
// until the duration elapses or Ctrl-C.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use veil_core::adapters::{reference_registry, SimulatedChain};
use veil_core::model::{format_amount, parse_amount};
use veil_core::store::{KvPersistence, MemoryStorage, SledStorage};
use veil_core::{
    AnonymityLevel, Clock, Currency, LifecycleEvent, ManualClock, MixOrchestrator, MixOrder, MixStatus,
    PayoutAddress, Persistence,
};

#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "Veil: mixing coordination engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run an in-memory end-to-end scenario
    Simulate {
        #[arg(short, long, default_value = "3")]
        mixes: usize,
        #[arg(short, long, default_value = "BTC")]
        currency: String,
        /// Amount per mix in whole units, e.g. 1.0
        #[arg(short, long, default_value = "1.0")]
        amount: String,
        /// Request HIGH anonymity (one extra mixing round)
        #[arg(long)]
        high: bool,
        /// Pay finished mixes out together in one coinjoin
        #[arg(long)]
        coinjoin: bool,
    },
    /// Host the engine over the on-disk store
    Run {
        #[arg(short, long, default_value = "60")]
        duration_secs: u64,
    },
    /// Summarize persisted mixes per currency and status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
    Show,
    Get { key: String },
    Set { key: String, value: String },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;
    let log_dir = if settings.log_to_file {
        Some(config::Config::data_dir()?.join("logs"))
    } else {
        None
    };
    let _guard = logging::init(settings.json_logs, log_dir.as_deref())?;

    match cli.command {
        Commands::Config { action } => cmd_config(settings, action),
        Commands::Simulate {
            mixes,
            currency,
            amount,
            high,
            coinjoin,
        } => cmd_simulate(settings, mixes, &currency, &amount, high, coinjoin).await,
        Commands::Run { duration_secs } => cmd_run(settings, duration_secs).await,
        Commands::Status => cmd_status(settings).await,
    }
}

fn cmd_config(mut settings: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let path = config::Config::config_file()?;
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            config::Config::default().save()?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigAction::Get { key } => match settings.get(&key)? {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::Set { key, value } => {
            settings.set(&key, &value)?;
            settings.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}

async fn cmd_simulate(
    settings: config::Config,
    mixes: usize,
    currency: &str,
    amount: &str,
    high: bool,
    coinjoin: bool,
) -> Result<()> {
    let mut engine_config = settings.engine;
    engine_config.orchestrator.coinjoin_payouts = coinjoin;
    engine_config.orchestrator.max_concurrent_mixes =
        engine_config.orchestrator.max_concurrent_mixes.max(mixes);
    let currency = Currency::new(currency);
    let decimals = engine_config.currency(&currency)?.decimals;
    let amount = parse_amount(amount, decimals)?;
    let level = if high {
        AnonymityLevel::High
    } else {
        AnonymityLevel::Medium
    };

    let chain = Arc::new(SimulatedChain::new());
    let clock = Arc::new(ManualClock::new(veil_core::util::time::unix_now_ms()));
    let registry = reference_registry(
        &engine_config,
        chain.clone(),
        Arc::new(KvPersistence::new(MemoryStorage::new())),
    )?;
    let engine = MixOrchestrator::with_clock(engine_config, &registry, clock.clone())
        .context("Failed to build engine")?;

    println!(
        "{} {} mixes of {} {}",
        "Simulating".bold(),
        mixes,
        format_amount(amount, decimals),
        currency
    );

    let mut ids = Vec::with_capacity(mixes);
    for i in 0..mixes {
        let payout = format!("{}1sim{:04}", currency.as_str().to_ascii_lowercase(), i);
        let order =
            MixOrder::new(currency.clone(), amount, vec![PayoutAddress::new(payout, 100)])
                .with_anonymity(level);
        let id = engine
            .process(order)
            .await
            .with_context(|| format!("Mix {} was refused", i + 1))?;
        let deposit = engine
            .mix(&id)
            .await
            .and_then(|m| m.deposit_address)
            .context("Accepted mix has no deposit address")?;
        chain.credit(&currency, &deposit, amount);
        // Deposits closer than the separation window never share a round
        clock.advance(Duration::from_secs(61));
        engine.confirm_deposit(&id).await?;
        println!("  {} {} deposit at {}", "•".bright_green(), id, deposit.dimmed());
        ids.push(id);
    }

    let mut report = engine.tick().await;
    while let Some(due) = engine.scheduler().next_due() {
        clock.set(due.max(clock.now_ms()));
        let next = engine.tick().await;
        report.operations_executed += next.operations_executed;
        report.rounds += next.rounds;
    }
    println!(
        "  {} extra rounds, {} releases broadcast",
        report.rounds, report.operations_executed
    );

    println!();
    println!("{}", "Mixes".bold());
    for (i, id) in ids.iter().enumerate() {
        let Some(mix) = engine.mix(id).await else {
            continue;
        };
        let payout = &mix.payouts[0].address;
        let status = match mix.status {
            MixStatus::Completed => mix.status.to_string().green(),
            MixStatus::Failed => mix.status.to_string().red(),
            _ => mix.status.to_string().yellow(),
        };
        println!(
            "  {:>3}. {} {:<16} received {} {}",
            i + 1,
            id,
            status,
            format_amount(chain.balance(&currency, payout), decimals),
            currency
        );
    }

    let pool = engine.pool_manager().pool_statistics(&currency).await?;
    let stats = engine.statistics().await;
    println!();
    println!("{}", "Pool".bold());
    println!("  Total:        {}", format_amount(pool.total, decimals));
    println!("  Reserved:     {}", format_amount(pool.reserved, decimals));
    println!("  Rounds:       {}", pool.rounds_executed);
    println!("  Mixed volume: {}", format_amount(pool.volume_mixed, decimals));
    println!();
    println!("{}", "Engine".bold());
    println!("  Completed:    {}", stats.completed);
    println!("  Failed:       {}", stats.failed);
    println!("  Waiting:      {}", stats.queue_length);
    println!("  Success rate: {:.1}%", stats.success_rate);
    Ok(())
}

async fn cmd_run(settings: config::Config, duration_secs: u64) -> Result<()> {
    let store = settings.storage_dir()?;
    std::fs::create_dir_all(&store).context("Failed to create store directory")?;
    let persistence = Arc::new(KvPersistence::new(
        SledStorage::open(&store).context("Failed to open store")?,
    ));
    // The simulated ledger is not persisted across runs
    let registry = reference_registry(
        &settings.engine,
        Arc::new(SimulatedChain::new()),
        persistence,
    )?;
    let engine = MixOrchestrator::new(settings.engine, &registry)?;
    let mut events = engine.subscribe();
    engine.start().await?;
    info!("Engine started over {}", store.display());
    println!(
        "{} over {} for {}s (Ctrl-C to stop)",
        "Engine running".bold(),
        store.display(),
        duration_secs
    );

    let deadline = tokio::time::sleep(Duration::from_secs(duration_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged, {} events dropped", n);
                    println!("  {} {} events dropped", "!".yellow(), n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    engine.stop().await;
    info!("Engine stopped");

    let stats = engine.statistics().await;
    println!(
        "{} {} active, {} completed, {} failed, uptime {}s",
        "Stopped:".bold(),
        stats.active_mixes,
        stats.completed,
        stats.failed,
        stats.uptime_ms / 1_000
    );
    Ok(())
}

fn print_event(event: &LifecycleEvent) {
    let detail = match event {
        LifecycleEvent::MixStatusChanged { from, to, .. } => format!("{} -> {}", from, to),
        LifecycleEvent::MixFailed { reason, .. } => reason.clone(),
        LifecycleEvent::MixStarted {
            amount, currency, ..
        } => format!("{} {} units", currency, amount),
        _ => String::new(),
    };
    println!(
        "  {} {:<20} {} {}",
        "•".bright_green(),
        event.name().bright_cyan(),
        event.mix_id(),
        detail.dimmed()
    );
}

async fn cmd_status(settings: config::Config) -> Result<()> {
    let store = settings.storage_dir()?;
    if !store.exists() {
        println!("{}", "No store yet.".dimmed());
        return Ok(());
    }
    let persistence =
        KvPersistence::new(SledStorage::open(&store).context("Failed to open store")?);
    println!("{} {}", "Store".bold(), store.display());
    for currency in settings.engine.currencies.keys() {
        println!();
        println!("{}", currency.to_string().bold());
        for status in [
            MixStatus::PendingDeposit,
            MixStatus::DepositReceived,
            MixStatus::Mixing,
            MixStatus::Distributing,
            MixStatus::Completed,
            MixStatus::Failed,
            MixStatus::Cancelled,
            MixStatus::Expired,
        ] {
            let count = persistence
                .requests_by_status(currency, status)
                .await
                .with_context(|| format!("Failed to read {} mixes", currency))?
                .len();
            if count > 0 {
                println!("  {:<18} {}", status.to_string().bright_cyan(), count);
            }
        }
    }
    Ok(())
}
