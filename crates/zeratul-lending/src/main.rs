//! Zeratul Lending CLI
//!
//! Replays lending scenarios and inspects rate curves and market configs.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeratul_lending::{LedgerConfig, RateModel, Scenario, BPS};

#[derive(Parser)]
#[command(name = "zeratul-lending")]
#[command(about = "Zeratul Lending - collateralized multi-asset lending ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Replay a YAML scenario and print the resulting ledger state
    Simulate {
        /// Scenario file
        path: PathBuf,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,

        /// Exit with an error if any step failed
        #[arg(long)]
        strict: bool,
    },

    /// Print the borrow/deposit rate curve
    Rates {
        /// Ledger config (YAML); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Utilization step in bps
        #[arg(short, long, default_value = "1000")]
        step: u32,

        /// Reserve factor used for the deposit rate column (bps)
        #[arg(short, long, default_value = "1000")]
        reserve_factor: u32,
    },

    /// Show the effective ledger configuration
    Info {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("zeratul_lending=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate { path, json, strict } => simulate(path, json, strict),
        Command::Rates {
            config,
            step,
            reserve_factor,
        } => rates(load_config(config)?.rate_model, step, reserve_factor),
        Command::Info { config } => info(load_config(config)?),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<LedgerConfig> {
    match path {
        Some(path) => LedgerConfig::from_yaml_file(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(LedgerConfig::default()),
    }
}

fn simulate(path: PathBuf, json: bool, strict: bool) -> Result<()> {
    let scenario = Scenario::from_yaml_file(&path)
        .with_context(|| format!("loading scenario {}", path.display()))?;
    let report = scenario.run().context("running scenario")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(name) = &report.name {
            println!("=== {} ===", name);
        }
        for step in &report.steps {
            match (&step.result, &step.error) {
                (_, Some(error)) => println!("[{:>3}] t={} {:?}\n      FAILED: {}", step.index, step.time, step.step, error),
                (Some(result), None) => println!("[{:>3}] t={} {:?}\n      {}", step.index, step.time, step.step, result),
                (None, None) => println!("[{:>3}] t={} {:?}", step.index, step.time, step.step),
            }
        }

        println!("\nMarkets:");
        for (symbol, market) in &report.markets {
            println!(
                "  {:<8} deposits {:>16} borrows {:>16} util {:>5} bps  borrow {:>5} bps  deposit {:>5} bps  reserves {}",
                symbol,
                market.total_deposits,
                market.total_borrows,
                market.utilization_bps,
                market.borrow_rate_bps,
                market.deposit_rate_bps,
                market.reserves,
            );
        }

        println!("\nAccounts:");
        for account in &report.accounts {
            let hf = account
                .health_factor
                .map(|hf| hf.to_string())
                .unwrap_or_else(|| "unknown".into());
            println!("  {:<12} health factor {}", account.user, hf);
            for position in &account.positions {
                println!(
                    "    {} deposit {} debt {}{}",
                    position.asset,
                    position.deposit_balance,
                    position.debt_balance,
                    if position.is_collateral { " (collateral)" } else { "" },
                );
            }
        }

        println!("\nEvents ({}):", report.events.len());
        for event in &report.events {
            println!("  {:?}", event);
        }

        println!(
            "\nTVL {}  borrowed {}",
            report.totals.total_value_locked, report.totals.total_borrowed_value
        );
    }

    let failed = report.failed_steps().count();
    if strict && failed > 0 {
        bail!("{} scenario step(s) failed", failed);
    }
    Ok(())
}

fn rates(model: RateModel, step: u32, reserve_factor: u32) -> Result<()> {
    if step == 0 {
        bail!("utilization step must be non-zero");
    }
    model.validate()?;

    println!("utilization  borrow_bps  deposit_bps");
    let mut utilization = 0u32;
    loop {
        println!(
            "{:>8} bps  {:>10}  {:>11}",
            utilization,
            model.borrow_rate_bps(utilization)?,
            model.deposit_rate_bps(utilization, reserve_factor)?,
        );
        if utilization as u128 >= BPS {
            break;
        }
        utilization = utilization.saturating_add(step).min(BPS as u32);
    }
    Ok(())
}

fn info(config: LedgerConfig) -> Result<()> {
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
