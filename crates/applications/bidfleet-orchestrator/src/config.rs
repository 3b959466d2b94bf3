//! Bidder configuration
//!
//! Every knob has a default, so an empty JSON object (or no config file at all)
//! is a valid configuration. The CLI overrides the most common knobs.

use crate::error::{BidderError, Result};
use crate::pricing::PricingPolicy;
use crate::reconcile::ReconcileSettings;
use crate::retry::RetryPolicy;
use crate::select::SelectorSettings;
use bidfleet_core::OfferQuery;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound for every interval knob (one year)
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Convert to a wall-clock span, saturating instead of wrapping
pub(crate) fn wall_clock(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// What to run on a freshly rented machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSpec {
    /// Docker image
    pub image: String,
    /// Disk size (GB)
    pub disk_gb: u32,
    /// Shell command run when the machine starts
    pub onstart_cmd: String,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            image: "nvidia/cuda:11.0.3-base-ubuntu20.04".to_string(),
            disk_gb: 1,
            onstart_cmd: "apt-get update && apt-get install -y curl".to_string(),
        }
    }
}

/// Bidder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidderConfig {
    /// Aggregate throughput the fleet should reach
    #[serde(default = "default_target_throughput")]
    pub target_throughput: f64,

    /// Cap on total fleet spend ($/h)
    #[serde(default = "default_max_dph")]
    pub max_dph: f64,

    /// Dollars we are willing to spend on the whole problem
    #[serde(default = "default_budget_dollars")]
    pub budget_dollars: f64,

    /// Problem size in throughput units (e.g. guesses in the wordlist)
    #[serde(default = "default_problem_size")]
    pub problem_size: f64,

    /// Bid this much above the current minimum bid
    #[serde(default = "default_outbid_factor")]
    pub outbid_factor: f64,

    /// Reduce our bid once it exceeds the minimum bid by this factor
    #[serde(default = "default_reducebid_factor_minbid")]
    pub reducebid_factor_minbid: f64,

    /// Reduce our bid once it exceeds the maximum price by this factor
    #[serde(default = "default_reducebid_factor_maxprice")]
    pub reducebid_factor_maxprice: f64,

    /// Blacklist fixed-price rentals costing more than max price times this
    #[serde(default = "default_destroy_factor_maxprice")]
    pub destroy_factor_maxprice: f64,

    /// Fixed-price offers may cost this much more than the max price
    #[serde(default = "default_fixed_bonus_factor_maxprice")]
    pub fixed_bonus_factor_maxprice: f64,

    /// A stopped bid still counts as active if its min bid is within this factor of max price
    #[serde(default = "default_competitive_factor_minbid")]
    pub competitive_factor_minbid: f64,

    /// Offers priced at or above this percentage of their max price are never rented
    #[serde(default = "default_max_price_percent")]
    pub max_price_percent: f64,

    /// Reconcile cadence (seconds)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Minimum time between offer searches (seconds)
    #[serde(default = "default_offer_search_interval_secs")]
    pub offer_search_interval_secs: u64,

    /// Blacklist a host that stays active without producing results for this long (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Delay between retries of a transient marketplace failure (seconds)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Attempts before a transient marketplace failure is given up on
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Persisted fleet state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Decision log
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Search and rent new offers (false = monitoring only)
    #[serde(default = "default_true")]
    pub rent: bool,

    /// Clear the console before each table render
    #[serde(default = "default_true")]
    pub clear_screen: bool,

    /// Offer search criteria
    #[serde(default)]
    pub offer_query: OfferQuery,

    /// Launch settings for new rentals
    #[serde(default)]
    pub launch: LaunchSpec,

    /// Marketplace CLI executable
    #[serde(default = "default_marketplace_cli")]
    pub marketplace_cli: PathBuf,

    /// Throughput estimator API base URL
    #[serde(default = "default_estimator_url")]
    pub estimator_url: String,
}

fn default_target_throughput() -> f64 {
    200.0 * 1000.0 * 1000.0
}

fn default_max_dph() -> f64 {
    50.0
}

fn default_budget_dollars() -> f64 {
    100.0
}

fn default_problem_size() -> f64 {
    1337.0
}

fn default_outbid_factor() -> f64 {
    1.1
}

fn default_reducebid_factor_minbid() -> f64 {
    1.15
}

fn default_reducebid_factor_maxprice() -> f64 {
    1.3
}

fn default_destroy_factor_maxprice() -> f64 {
    2.0
}

fn default_fixed_bonus_factor_maxprice() -> f64 {
    1.3
}

fn default_competitive_factor_minbid() -> f64 {
    1.02
}

fn default_max_price_percent() -> f64 {
    101.0
}

fn default_refresh_interval_secs() -> u64 {
    15
}

fn default_offer_search_interval_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    4 * 60 * 60
}

fn default_retry_delay_secs() -> u64 {
    3
}

fn default_retry_max_attempts() -> u32 {
    20
}

fn default_state_file() -> PathBuf {
    PathBuf::from("bidfleet-state.json")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("log.bidfleet.txt")
}

fn default_true() -> bool {
    true
}

fn default_marketplace_cli() -> PathBuf {
    PathBuf::from("./vast")
}

fn default_estimator_url() -> String {
    "http://127.0.0.1:45678/jtr-distributed/api".to_string()
}

impl Default for BidderConfig {
    fn default() -> Self {
        Self {
            target_throughput: default_target_throughput(),
            max_dph: default_max_dph(),
            budget_dollars: default_budget_dollars(),
            problem_size: default_problem_size(),
            outbid_factor: default_outbid_factor(),
            reducebid_factor_minbid: default_reducebid_factor_minbid(),
            reducebid_factor_maxprice: default_reducebid_factor_maxprice(),
            destroy_factor_maxprice: default_destroy_factor_maxprice(),
            fixed_bonus_factor_maxprice: default_fixed_bonus_factor_maxprice(),
            competitive_factor_minbid: default_competitive_factor_minbid(),
            max_price_percent: default_max_price_percent(),
            refresh_interval_secs: default_refresh_interval_secs(),
            offer_search_interval_secs: default_offer_search_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            state_file: default_state_file(),
            log_file: default_log_file(),
            rent: true,
            clear_screen: true,
            offer_query: OfferQuery::default(),
            launch: LaunchSpec::default(),
            marketplace_cli: default_marketplace_cli(),
            estimator_url: default_estimator_url(),
        }
    }
}

impl BidderConfig {
    /// Load from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pricing math meaningless
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("target_throughput", self.target_throughput),
            ("max_dph", self.max_dph),
            ("budget_dollars", self.budget_dollars),
            ("problem_size", self.problem_size),
            ("outbid_factor", self.outbid_factor),
            ("reducebid_factor_minbid", self.reducebid_factor_minbid),
            ("reducebid_factor_maxprice", self.reducebid_factor_maxprice),
            ("destroy_factor_maxprice", self.destroy_factor_maxprice),
            ("fixed_bonus_factor_maxprice", self.fixed_bonus_factor_maxprice),
            ("competitive_factor_minbid", self.competitive_factor_minbid),
            ("max_price_percent", self.max_price_percent),
        ];

        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(BidderError::config(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        let intervals = [
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("offer_search_interval_secs", self.offer_search_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("retry_delay_secs", self.retry_delay_secs),
        ];

        for (name, secs) in intervals {
            if secs > MAX_INTERVAL_SECS {
                return Err(BidderError::config(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_INTERVAL_SECS, secs
                )));
            }
        }

        if self.retry_max_attempts == 0 {
            return Err(BidderError::config("retry_max_attempts must be at least 1"));
        }

        Ok(())
    }

    /// Throughput units one dollar has to buy for the budget to cover the problem
    pub fn max_throughput_per_dollar(&self) -> f64 {
        self.problem_size / self.budget_dollars
    }

    /// Pricing policy derived from this configuration
    pub fn pricing(&self) -> PricingPolicy {
        PricingPolicy::new(self.max_throughput_per_dollar(), self.outbid_factor)
    }

    /// Thresholds for the fleet reconciler
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            pricing: self.pricing(),
            reducebid_factor_minbid: self.reducebid_factor_minbid,
            reducebid_factor_maxprice: self.reducebid_factor_maxprice,
            destroy_factor_maxprice: self.destroy_factor_maxprice,
            competitive_factor_minbid: self.competitive_factor_minbid,
            idle_timeout: self.idle_timeout(),
        }
    }

    /// Caps for the offer selector
    pub fn selector_settings(&self) -> SelectorSettings {
        SelectorSettings {
            pricing: self.pricing(),
            fixed_bonus_factor_maxprice: self.fixed_bonus_factor_maxprice,
            max_price_percent: self.max_price_percent,
            target_throughput: self.target_throughput,
            max_dph: self.max_dph,
        }
    }

    /// Retry policy for marketplace calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_delay_secs),
            self.retry_max_attempts,
        )
    }

    /// Reconcile cadence
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Minimum time between offer searches
    pub fn offer_search_interval(&self) -> Duration {
        Duration::from_secs(self.offer_search_interval_secs)
    }

    /// Idle timeout before blacklisting
    pub fn idle_timeout(&self) -> chrono::Duration {
        wall_clock(Duration::from_secs(self.idle_timeout_secs))
    }

    /// Set the throughput target
    pub fn with_target_throughput(mut self, throughput: f64) -> Self {
        self.target_throughput = throughput;
        self
    }

    /// Set the spend cap ($/h)
    pub fn with_max_dph(mut self, max_dph: f64) -> Self {
        self.max_dph = max_dph;
        self
    }

    /// Set budget and problem size
    pub fn with_budget(mut self, dollars: f64, problem_size: f64) -> Self {
        self.budget_dollars = dollars;
        self.problem_size = problem_size;
        self
    }

    /// Enable or disable renting
    pub fn with_rent(mut self, rent: bool) -> Self {
        self.rent = rent;
        self
    }

    /// Set the state file path
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    /// Set the idle timeout (seconds)
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    /// Enable or disable console clearing
    pub fn with_clear_screen(mut self, clear: bool) -> Self {
        self.clear_screen = clear;
        self
    }

    /// Set the offer search interval (seconds)
    pub fn with_offer_search_interval_secs(mut self, secs: u64) -> Self {
        self.offer_search_interval_secs = secs;
        self
    }
}
