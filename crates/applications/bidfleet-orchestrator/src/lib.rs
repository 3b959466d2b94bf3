//! # Bidfleet Orchestrator
//!
//! Bidding and fleet reconciliation for spot/bid GPU marketplaces.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!                    │  Autobidder  │  control loop (every 15s)
//!                    └──────┬───────┘
//!          ┌────────────────┼─────────────────┐
//!          ▼                ▼                 ▼
//!   FleetReconciler   OfferSelector     StateStore
//!   (price, idle,     (rank, greedy     (host idle timers,
//!    blacklist,        accept under      blacklist; atomic
//!    destroy)          caps)             rewrite per cycle)
//!          │                │
//!          └───────┬────────┘
//!                  ▼
//!     Marketplace + ThroughputEstimator   (bidfleet-core traits)
//!     VastCli       HttpEstimator         (concrete clients)
//! ```
//!
//! The reconciler and selector only see the collaborator traits, so the whole
//! engine runs against in-memory fakes in tests (the `memory` module, built
//! with the `testing` feature).
//!
//! ## Pricing
//!
//! A machine is worth `throughput / max_throughput_per_dollar * 3600` dollars
//! per hour. Bids outbid the current floor by 10% but never exceed that.
//! See [`pricing`].

#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod marketplace;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pricing;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod select;
pub mod state;

// Error handling
pub use error::{BidderError, Result};

// Configuration
pub use config::{BidderConfig, LaunchSpec};

// Decision engine
pub use control::{Autobidder, CycleReport};
pub use pricing::PricingPolicy;
pub use reconcile::{
    BlacklistReason, DestroyReason, FleetCommand, FleetReconciler, FleetTotals, MachineRow,
    ReconcileOutcome, ReconcileSettings,
};
pub use select::{OfferSelector, RankedOffer, SelectionOutcome, SelectionSummary, SelectorSettings};
pub use state::{FleetState, StateStore};

// Collaborators
pub use estimator::HttpEstimator;
pub use marketplace::VastCli;
pub use retry::RetryPolicy;
