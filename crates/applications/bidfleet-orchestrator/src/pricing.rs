//! Pricing policy
//!
//! Translates a throughput figure into the most we are willing to pay for it
//! (`max_price`) and the bid we actually place (`target_price`).
//!
//! ```text
//! max_price    = throughput / max_throughput_per_dollar * 3600
//! target_price = min(max_price, min_bid * outbid_factor)
//! ```
//!
//! Throughput is per second while prices are per hour, hence the 3600.

use serde::{Deserialize, Serialize};

/// Seconds in one billing hour
pub const SECONDS_PER_HOUR: f64 = 60.0 * 60.0;

/// Fixed heuristic pricing policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Throughput units each dollar must buy (problem size / budget)
    pub max_throughput_per_dollar: f64,

    /// Outbid the current minimum bid by this factor
    pub outbid_factor: f64,
}

impl PricingPolicy {
    /// Create a pricing policy
    pub fn new(max_throughput_per_dollar: f64, outbid_factor: f64) -> Self {
        Self {
            max_throughput_per_dollar,
            outbid_factor,
        }
    }

    /// Highest hourly price the budget justifies for `throughput`
    pub fn max_price(&self, throughput: f64) -> f64 {
        if self.max_throughput_per_dollar <= 0.0 {
            return 0.0;
        }
        throughput.max(0.0) / self.max_throughput_per_dollar * SECONDS_PER_HOUR
    }

    /// Bid to place: outbid the floor, but never above `max_price`
    pub fn target_price(&self, throughput: f64, min_bid: f64) -> f64 {
        self.max_price(throughput)
            .min(min_bid.max(0.0) * self.outbid_factor)
    }
}

/// `price` as a percentage of `max_price`; infinite when nothing is affordable
pub fn price_percent(price: f64, max_price: f64) -> f64 {
    if max_price > 0.0 {
        price / max_price * 100.0
    } else {
        f64::INFINITY
    }
}
