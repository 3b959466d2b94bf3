//! Fleet reconciliation
//!
//! One pass over the rentals we hold. For each machine:
//!
//! 1. Estimate expected and realized throughput, derive max and target price.
//! 2. Decide whether it counts as active; add its throughput and cost to the
//!    fleet totals (stopped, uncompetitive machines only cost storage).
//! 3. Track how long an active machine has produced nothing and blacklist its
//!    host once that exceeds the idle timeout.
//! 4. Blacklist fixed-price rentals that cost far more than they are worth.
//! 5. Re-arm stalled bids and pull down bids that drifted too high.
//! 6. Destroy blacklisted machines, or every machine once the task is done.
//!
//! Decisions are made by [`FleetReconciler::assess`], which is pure; the
//! async [`FleetReconciler::reconcile`] gathers estimates and issues the
//! resulting commands.

use crate::pricing::{PricingPolicy, price_percent};
use crate::state::FleetState;
use bidfleet_core::{
    Descriptor, EstimateSubject, HostId, Machine, Marketplace, RentalId, SshEndpoint,
    ThroughputEstimator,
};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Thresholds the reconciler applies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    pub pricing: PricingPolicy,

    /// Reduce a bid once it exceeds the minimum bid by this factor
    pub reducebid_factor_minbid: f64,

    /// Reduce a bid once it exceeds the max price by this factor
    pub reducebid_factor_maxprice: f64,

    /// Blacklist fixed-price rentals costing more than max price times this
    pub destroy_factor_maxprice: f64,

    /// A stopped bid whose minimum bid is within this factor of max price is still active
    pub competitive_factor_minbid: f64,

    /// How long an active machine may produce nothing
    pub idle_timeout: chrono::Duration,
}

/// Running totals over the fleet
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FleetTotals {
    /// Expected throughput of active machines
    pub throughput: f64,

    /// Realized throughput of active machines
    pub realized_throughput: f64,

    /// Hourly spend ($/h)
    pub cost: f64,
}

impl FleetTotals {
    /// Add a machine (or a freshly rented offer) to the totals
    pub fn add(&mut self, throughput: f64, realized: f64, cost: f64) {
        self.throughput += throughput;
        self.realized_throughput += realized;
        self.cost += cost;
    }
}

/// Why a rental is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Its host is blacklisted
    Blacklisted,
    /// The workload is complete
    TaskComplete,
}

/// Why a host was blacklisted
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlacklistReason {
    /// Active with zero realized throughput since `since`
    Idle { since: DateTime<Utc> },
    /// Fixed-price rental costing `price` against a max price of `max_price`
    Overpriced { price: f64, max_price: f64 },
}

impl std::fmt::Display for BlacklistReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle { since } => write!(f, "idle since {}", since.format("%Y-%m-%d %H:%M:%S")),
            Self::Overpriced { price, max_price } => {
                write!(f, "fixed price ${:.3} against max ${:.3}", price, max_price)
            }
        }
    }
}

/// Command the reconciler issues against the marketplace
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FleetCommand {
    SetPrice {
        rental_id: RentalId,
        price: f64,
    },
    Destroy {
        rental_id: RentalId,
        reason: DestroyReason,
    },
}

/// Display row for one machine
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRow {
    pub rental_id: RentalId,
    pub host_id: HostId,
    pub location: Option<String>,
    pub ssh: Option<SshEndpoint>,
    pub descriptor: Descriptor,
    pub expected_throughput: f64,
    pub realized_throughput: f64,
    pub age: chrono::Duration,
    pub min_bid: f64,
    pub price: f64,
    pub max_price: f64,
    /// Price as a percentage of max price
    pub price_percent: f64,
    pub is_bid: bool,
    /// Intended state followed by annotations (", bid updated", ...)
    pub status: String,
}

/// Decision for a single machine
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub row: MachineRow,
    pub active: bool,
    pub new_price: Option<f64>,
    pub destroy: Option<DestroyReason>,
    /// Set when this pass newly blacklisted the host
    pub blacklisted: Option<BlacklistReason>,
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub totals: FleetTotals,
    pub rows: Vec<MachineRow>,
    pub commands: Vec<FleetCommand>,
    /// Hosts blacklisted during this pass
    pub blacklisted: Vec<(HostId, BlacklistReason)>,
}

/// Reconciles the rented fleet against the pricing policy
#[derive(Debug, Clone)]
pub struct FleetReconciler {
    settings: ReconcileSettings,
}

impl FleetReconciler {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Decide what to do with `machine`, updating idle timers and the blacklist
    ///
    /// `realized` is `None` when the realized throughput could not be read;
    /// such a machine counts as producing nothing but its idle timer is left
    /// exactly as it was.
    pub fn assess(
        &self,
        machine: &Machine,
        expected: f64,
        realized: Option<f64>,
        state: &mut FleetState,
        kill_switch: bool,
        now: DateTime<Utc>,
    ) -> Assessment {
        let s = &self.settings;
        let host = machine.host_id;
        let max_price = s.pricing.max_price(expected);
        let target_price = if machine.is_bid {
            s.pricing.target_price(expected, machine.min_bid)
        } else {
            max_price.min(machine.dph_total)
        };

        let mut status = machine.intended_state.as_str().to_string();
        let mut shown_price = machine.dph_base;
        let mut blacklisted = None;
        let produced = realized.unwrap_or(0.0);

        let active = !machine.is_fully_stopped()
            || produced > 0.0
            || machine.min_bid <= max_price * s.competitive_factor_minbid;

        if active {
            match realized {
                _ if state.is_blacklisted(host) => state.clear_idle(host),
                Some(r) if r > 0.0 => state.clear_idle(host),
                Some(_) => {
                    let since = state.mark_idle_since(host, now);
                    if now - since > s.idle_timeout {
                        state.blacklist(host);
                        state.clear_idle(host);
                        blacklisted = Some(BlacklistReason::Idle { since });
                    }
                }
                // Unknown is not idle
                None => {}
            }
        } else {
            state.clear_idle(host);
        }

        if !machine.is_bid {
            status.push_str(", fixed$");
            if max_price > 0.0
                && machine.dph_total > max_price * s.destroy_factor_maxprice
                && state.blacklist(host)
            {
                blacklisted = Some(BlacklistReason::Overpriced {
                    price: machine.dph_total,
                    max_price,
                });
            }
        }

        let mut new_price = None;
        // Without an estimate there is no price to move the bid to
        if machine.is_bid && max_price > 0.0 && !kill_switch && !state.is_blacklisted(host) {
            let stalled = machine.is_parked()
                && machine.dph_base < machine.min_bid
                && target_price >= machine.min_bid;
            let above_floor = machine.dph_base > machine.min_bid * s.reducebid_factor_minbid;
            let above_max = machine.dph_base > max_price * s.reducebid_factor_maxprice;

            if stalled || above_floor || above_max {
                new_price = Some(target_price);
                shown_price = target_price;
                status.push_str(", bid updated");
            }
        }

        let destroy = if kill_switch {
            Some(DestroyReason::TaskComplete)
        } else if state.is_blacklisted(host) {
            Some(DestroyReason::Blacklisted)
        } else {
            None
        };
        if destroy.is_some() {
            status.push_str(", destroying");
        }

        Assessment {
            row: MachineRow {
                rental_id: machine.rental_id,
                host_id: host,
                location: machine.location.clone(),
                ssh: machine.ssh.clone(),
                descriptor: machine.descriptor.clone(),
                expected_throughput: expected,
                realized_throughput: produced,
                age: machine.age(now),
                min_bid: machine.min_bid,
                price: shown_price,
                max_price,
                price_percent: price_percent(shown_price, max_price),
                is_bid: machine.is_bid,
                status,
            },
            active,
            new_price,
            destroy,
            blacklisted,
        }
    }

    /// Reconcile `machines`, issuing price changes and destroys
    ///
    /// Estimator failures read as zero throughput, except that an unreadable
    /// realized throughput never advances a host toward the idle blacklist.
    /// Marketplace failures are logged and never abort the pass.
    pub async fn reconcile<M, E>(
        &self,
        marketplace: &M,
        estimator: &E,
        machines: &[Machine],
        state: &mut FleetState,
        kill_switch: bool,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome
    where
        M: Marketplace + ?Sized,
        E: ThroughputEstimator + ?Sized,
    {
        let mut outcome = ReconcileOutcome::default();

        for machine in machines {
            let expected = estimator
                .estimate(EstimateSubject::for_machine(machine))
                .await
                .unwrap_or_else(|e| {
                    warn!(rental_id = %machine.rental_id, "Throughput estimate failed: {}", e);
                    0.0
                });
            let realized = match estimator.realized(machine.rental_id).await {
                Ok(realized) => Some(realized),
                Err(e) => {
                    warn!(rental_id = %machine.rental_id, "Realized throughput unavailable: {}", e);
                    None
                }
            };

            let assessment = self.assess(machine, expected, realized, state, kill_switch, now);

            if assessment.active {
                outcome.totals.add(expected, assessment.row.realized_throughput, machine.dph_total);
            } else {
                outcome.totals.add(0.0, 0.0, machine.storage_cost);
            }

            if let Some(reason) = assessment.blacklisted {
                warn!(
                    host_id = %machine.host_id,
                    rental_id = %machine.rental_id,
                    "Blacklisting host: {}",
                    reason
                );
                outcome.blacklisted.push((machine.host_id, reason));
            }

            if let Some(price) = assessment.new_price {
                info!(
                    rental_id = %machine.rental_id,
                    min_bid = machine.min_bid,
                    old = machine.dph_base,
                    new = price,
                    "Changing bid"
                );
                outcome.commands.push(FleetCommand::SetPrice {
                    rental_id: machine.rental_id,
                    price,
                });
                if let Err(e) = marketplace.set_price(machine.rental_id, price).await {
                    error!(rental_id = %machine.rental_id, "Failed to change bid: {}", e);
                }
            }

            if let Some(reason) = assessment.destroy {
                info!(
                    rental_id = %machine.rental_id,
                    host_id = %machine.host_id,
                    ?reason,
                    "Destroying rental"
                );
                outcome.commands.push(FleetCommand::Destroy {
                    rental_id: machine.rental_id,
                    reason,
                });
                if let Err(e) = marketplace.destroy_rental(machine.rental_id).await {
                    warn!(rental_id = %machine.rental_id, "Destroy failed, will retry next cycle: {}", e);
                }
            }

            outcome.rows.push(assessment.row);
        }

        debug!(
            machines = machines.len(),
            throughput = outcome.totals.throughput,
            cost = outcome.totals.cost,
            "Reconciled fleet"
        );
        outcome
    }
}
