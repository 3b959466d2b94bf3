//! The autobidder control loop
//!
//! Every refresh interval:
//!
//! 1. Ask the estimator whether the task is complete (the kill switch).
//! 2. List our rentals and reconcile them.
//! 3. If renting is enabled, the kill switch is off, the search interval has
//!    elapsed and the fleet is below both its throughput target and its spend
//!    cap, search offers and rent the best ones.
//! 4. Persist the fleet state.
//!
//! Collaborator failures are absorbed inside the cycle. Only a failure to
//! persist the fleet state ends the loop.

use crate::config::{BidderConfig, wall_clock};
use crate::error::Result;
use crate::reconcile::{FleetReconciler, FleetTotals, ReconcileOutcome};
use crate::report;
use crate::select::{OfferSelector, SelectionOutcome};
use crate::state::{FleetState, StateStore};
use bidfleet_core::{Marketplace, ThroughputEstimator};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// What happened in one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub at: DateTime<Utc>,

    /// The task was reported complete; every rental is being destroyed
    pub kill_switch: bool,

    /// Rentals could not be listed; nothing was reconciled or rented
    pub listing_failed: bool,

    pub reconcile: ReconcileOutcome,

    /// Set when an offer search ran this cycle
    pub selection: Option<SelectionOutcome>,

    /// Fleet totals after this cycle's rentals
    pub totals: FleetTotals,
}

/// Reconciles the fleet and rents capacity until the task is done
pub struct Autobidder<M, E> {
    config: BidderConfig,
    marketplace: M,
    estimator: E,
    reconciler: FleetReconciler,
    selector: OfferSelector,
    store: StateStore,
    state: FleetState,
    last_search: Option<DateTime<Utc>>,
}

impl<M, E> Autobidder<M, E>
where
    M: Marketplace,
    E: ThroughputEstimator,
{
    /// Create an autobidder, loading the fleet state from `config.state_file`
    pub fn new(config: BidderConfig, marketplace: M, estimator: E) -> Result<Self> {
        config.validate()?;
        let store = StateStore::new(&config.state_file);
        let state = store.load()?;

        Ok(Self {
            reconciler: FleetReconciler::new(config.reconcile_settings()),
            selector: OfferSelector::new(config.selector_settings()),
            config,
            marketplace,
            estimator,
            store,
            state,
            last_search: None,
        })
    }

    pub fn config(&self) -> &BidderConfig {
        &self.config
    }

    pub fn marketplace(&self) -> &M {
        &self.marketplace
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    pub fn state(&self) -> &FleetState {
        &self.state
    }

    /// Whether the search interval has elapsed at `now`
    fn search_due(&self, now: DateTime<Utc>) -> bool {
        let interval = wall_clock(self.config.offer_search_interval());
        self.last_search.is_none_or(|last| now - last >= interval)
    }

    fn wants_capacity(&self, totals: &FleetTotals) -> bool {
        totals.throughput < self.config.target_throughput && totals.cost < self.config.max_dph
    }

    /// Run one reconcile (and possibly search) cycle
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let kill_switch = self.estimator.task_complete().await.unwrap_or_else(|e| {
            warn!("Kill switch probe failed, assuming task not complete: {}", e);
            false
        });
        if kill_switch {
            warn!("Task complete, destroying every rental");
        }

        let mut report = CycleReport {
            at: now,
            kill_switch,
            listing_failed: false,
            reconcile: ReconcileOutcome::default(),
            selection: None,
            totals: FleetTotals::default(),
        };

        let machines = match self.marketplace.list_rentals().await {
            Ok(machines) => machines,
            Err(e) => {
                error!("Failed to list rentals, skipping this cycle: {}", e);
                report.listing_failed = true;
                self.store.save(&self.state)?;
                return Ok(report);
            }
        };

        report.reconcile = self
            .reconciler
            .reconcile(
                &self.marketplace,
                &self.estimator,
                &machines,
                &mut self.state,
                kill_switch,
                now,
            )
            .await;
        report.totals = report.reconcile.totals;

        if !self.config.rent {
            debug!("Renting disabled, not searching offers");
        } else if kill_switch {
            debug!("Kill switch active, not searching offers");
        } else if !self.search_due(now) {
            debug!("Offer search interval not elapsed");
        } else if !self.wants_capacity(&report.totals) {
            debug!(
                throughput = report.totals.throughput,
                cost = report.totals.cost,
                "Fleet at capacity, not searching offers"
            );
        } else {
            self.last_search = Some(now);
            report.selection = self.search_and_rent(&mut report.totals).await;
        }

        self.store.save(&self.state)?;
        Ok(report)
    }

    async fn search_and_rent(&mut self, totals: &mut FleetTotals) -> Option<SelectionOutcome> {
        let offers = match self.marketplace.list_offers(&self.config.offer_query).await {
            Ok(offers) => offers,
            Err(e) => {
                error!("Offer search failed: {}", e);
                return None;
            }
        };
        info!("Evaluating {} offers", offers.len());

        let ranked = self.selector.evaluate(&self.estimator, offers).await;
        Some(
            self.selector
                .select(&self.marketplace, ranked, totals, &mut self.state)
                .await,
        )
    }

    /// Print the fleet table and summary for `report`
    pub fn render(&self, report: &CycleReport) {
        if self.config.clear_screen {
            report::clear_screen();
        }
        print!("{}", report::render_table(&report.reconcile.rows));
        println!();
        println!(
            "{}  {}",
            report.at.format("%Y-%m-%d %H:%M:%S"),
            report::render_summary(&report.totals, &self.config.pricing())
        );
        if let Some(selection) = &report.selection {
            println!(
                "rented {} machines this cycle: +{:.1} M/s, +${:.3}/h",
                selection.summary.count,
                selection.summary.throughput / 1_000_000.0,
                selection.summary.cost
            );
        }
    }

    /// Loop until Ctrl+C
    pub async fn run(&mut self) -> Result<()> {
        info!(
            target_throughput = self.config.target_throughput,
            max_dph = self.config.max_dph,
            rent = self.config.rent,
            "Starting autobidder"
        );

        loop {
            let report = self.run_cycle(Utc::now()).await?;
            self.render(&report);

            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval()) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, stopping autobidder");
                    self.store.save(&self.state)?;
                    return Ok(());
                }
            }
        }
    }
}
