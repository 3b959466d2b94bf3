//! Bidfleet - autobidder for spot GPU marketplaces
//!
//! ## Usage
//!
//! ```bash
//! # Reconcile the fleet and rent offers until the task completes
//! bidfleet --config bidfleet.json
//!
//! # Monitoring only: reconcile bids and blacklist, never rent
//! bidfleet run --no-rent
//!
//! # Show what the current offers are worth
//! bidfleet offers
//!
//! # Rent one offer by hand (at the listed price, or bidding `price`)
//! bidfleet rent 4242424 0.35
//!
//! # Tear the whole fleet down
//! bidfleet destroy-all
//! ```

use anyhow::Context;
use bidfleet_core::{Marketplace, OfferId};
use bidfleet_orchestrator::{
    Autobidder, BidderConfig, HttpEstimator, OfferSelector, VastCli, logging, report,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Offers up to this percentage of their max price are listed by `offers`
const OFFERS_SHOWN_PERCENT: f64 = 200.0;

/// Offers up to this percentage of their max price count as eligible
const OFFERS_ELIGIBLE_PERCENT: f64 = 100.0;

/// Pause between teardown passes of `destroy-all`
const TEARDOWN_INTERVAL: Duration = Duration::from_secs(15);

/// Bidfleet: bidding and fleet reconciliation for spot GPU marketplaces
#[derive(Parser)]
#[command(name = "bidfleet")]
#[command(about = "Autobidder for spot GPU marketplaces", long_about = None)]
struct Cli {
    /// Configuration file (JSON; missing file = defaults)
    #[arg(long, global = true, default_value = "bidfleet.json")]
    config: PathBuf,

    /// Monitoring only: never search or rent new offers
    #[arg(long, global = true)]
    no_rent: bool,

    /// Override the fleet throughput target
    #[arg(long, global = true)]
    target_throughput: Option<f64>,

    /// Override the fleet spend cap ($/h)
    #[arg(long, global = true)]
    max_dph: Option<f64>,

    /// Override the fleet state file
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Do not clear the console between refreshes
    #[arg(long, global = true)]
    no_clear: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the autobidder loop (default)
    Run,

    /// List current offers ranked by price relative to their worth
    Offers,

    /// Rent a single offer
    Rent {
        /// Offer ID
        offer_id: u64,

        /// Bid ($/h); omit to rent at the listed price
        price: Option<f64>,
    },

    /// Destroy every rental
    DestroyAll {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn bidder_config(&self) -> anyhow::Result<BidderConfig> {
        let mut config = BidderConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if self.no_rent {
            config = config.with_rent(false);
        }
        if self.no_clear {
            config = config.with_clear_screen(false);
        }
        if let Some(throughput) = self.target_throughput {
            config = config.with_target_throughput(throughput);
        }
        if let Some(max_dph) = self.max_dph {
            config = config.with_max_dph(max_dph);
        }
        if let Some(path) = &self.state_file {
            config = config.with_state_file(path);
        }

        config.validate()?;
        Ok(config)
    }
}

fn marketplace(config: &BidderConfig) -> VastCli {
    VastCli::new(
        &config.marketplace_cli,
        config.launch.clone(),
        config.retry_policy(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.bidder_config()?;
    let _log_guard = logging::init(&config.log_file)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Offers => show_offers(config).await,
        Commands::Rent { offer_id, price } => rent(config, offer_id, price).await,
        Commands::DestroyAll { force } => destroy_all(config, force).await,
    }
}

async fn run(config: BidderConfig) -> anyhow::Result<()> {
    let estimator = HttpEstimator::new(&config.estimator_url)?;
    let marketplace = marketplace(&config);

    if !config.rent {
        info!("🔍 Monitoring only, no new rentals");
    }

    let mut bidder = Autobidder::new(config, marketplace, estimator)?;
    bidder.run().await?;
    info!("👋 Autobidder stopped, rentals keep running");
    Ok(())
}

async fn show_offers(config: BidderConfig) -> anyhow::Result<()> {
    let estimator = HttpEstimator::new(&config.estimator_url)?;
    let marketplace = marketplace(&config);
    let selector = OfferSelector::new(config.selector_settings());

    let offers = marketplace.list_offers(&config.offer_query).await?;
    info!("Found {} offers", offers.len());

    let ranked: Vec<_> = selector
        .evaluate(&estimator, offers)
        .await
        .into_iter()
        .filter(|r| r.min_price_percent <= OFFERS_SHOWN_PERCENT)
        .collect();
    print!("{}", report::render_offers(&ranked));

    let eligible: Vec<_> = ranked
        .iter()
        .filter(|r| r.min_price_percent <= OFFERS_ELIGIBLE_PERCENT)
        .collect();
    let throughput: f64 = eligible.iter().map(|r| r.throughput).sum();
    let cost: f64 = eligible.iter().map(|r| r.target_price).sum();
    println!();
    println!(
        "{} eligible offers: {:.1} M/s for ${:.3}/h",
        eligible.len(),
        throughput / 1_000_000.0,
        cost
    );
    Ok(())
}

async fn rent(config: BidderConfig, offer_id: u64, price: Option<f64>) -> anyhow::Result<()> {
    let marketplace = marketplace(&config);
    let offer_id = OfferId(offer_id);

    match price {
        Some(price) => info!("Bidding ${:.3}/h on offer {}", price, offer_id),
        None => info!("Renting offer {} at the listed price", offer_id),
    }
    marketplace.create_rental(offer_id, price).await?;
    info!("✅ Rental created");
    Ok(())
}

/// Ask until the answer is exactly `Y` or `n`; false on `n` or end of input
fn confirm(prompt: &str) -> anyhow::Result<bool> {
    loop {
        print!("{} [Y/n]: ", prompt);
        std::io::stdout().flush()?;
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            return Ok(false);
        }
        match input.trim() {
            "Y" => return Ok(true),
            "n" => return Ok(false),
            _ => continue,
        }
    }
}

async fn destroy_all(config: BidderConfig, force: bool) -> anyhow::Result<()> {
    if !force && !confirm("⚠️  Are you SURE you want to destroy all active rentals?")? {
        info!("Aborted");
        std::process::exit(1);
    }

    let marketplace = marketplace(&config);
    loop {
        let rentals = marketplace.list_rentals().await?;
        if rentals.is_empty() {
            info!("✅ No rentals left");
            return Ok(());
        }

        info!("🗑️  Destroying {} rentals", rentals.len());
        for machine in &rentals {
            if let Err(e) = marketplace.destroy_rental(machine.rental_id).await {
                warn!(rental_id = %machine.rental_id, "Destroy failed: {}", e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(TEARDOWN_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                error!("Interrupted, some rentals may still be running");
                return Ok(());
            }
        }
    }
}
