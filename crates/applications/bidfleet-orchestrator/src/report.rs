//! Console presentation of the fleet and of offer listings

use crate::pricing::{PricingPolicy, price_percent};
use crate::reconcile::{FleetTotals, MachineRow};
use crate::select::RankedOffer;
use std::fmt::Write as _;
use std::io::Write as _;

/// Throughput is shown in millions per second
const MEGA: f64 = 1_000_000.0;

/// Clear the terminal and move the cursor home
pub fn clear_screen() {
    print!("\x1b[2J\x1b[H");
    let _ = std::io::stdout().flush();
}

fn format_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes().max(0);
    format!("{}h{:02}m", minutes / 60, minutes % 60)
}

fn format_percent(value: f64) -> String {
    if value.is_finite() {
        format!("{:.0}%", value)
    } else {
        "-".to_string()
    }
}

/// One line per rented machine
pub fn render_table(rows: &[MachineRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<9} {:<7} {:<22} {:<24} {:<16} {:>8} {:>8} {:>7} {:>7} {:>7} {:>7} {:>5}  {}",
        "ID", "HOST", "LOCATION", "SSH", "GPUS", "EXP M/s", "REAL M/s", "AGE", "$MIN", "$/H",
        "$MAX", "$H%", "STATUS"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<9} {:<7} {:<22} {:<24} {:<16} {:>8.1} {:>8.1} {:>7} {:>7.3} {:>7.3} {:>7.3} {:>5}  {}",
            row.rental_id,
            row.host_id,
            truncate(row.location.as_deref().unwrap_or("-"), 22),
            row.ssh.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            truncate(&row.descriptor.to_string(), 16),
            row.expected_throughput / MEGA,
            row.realized_throughput / MEGA,
            format_age(row.age),
            row.min_bid,
            row.price,
            row.max_price,
            format_percent(row.price_percent),
            row.status
        );
    }
    out
}

/// Fleet totals with spend as a percentage of what the throughput is worth
pub fn render_summary(totals: &FleetTotals, pricing: &PricingPolicy) -> String {
    let expected_percent = price_percent(totals.cost, pricing.max_price(totals.throughput));
    let realized_percent =
        price_percent(totals.cost, pricing.max_price(totals.realized_throughput));
    format!(
        "active: {:.1} M/s expected, {:.1} M/s realized, ${:.3}/h, e$h% {}, r$h% {}",
        totals.throughput / MEGA,
        totals.realized_throughput / MEGA,
        totals.cost,
        format_percent(expected_percent),
        format_percent(realized_percent)
    )
}

/// Ranked offers, best first
pub fn render_offers(offers: &[RankedOffer]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<9} {:<7} {:<22} {:<16} {:>8} {:>7} {:>7} {:>7} {:>6} {:>6}  {}",
        "OFFER", "HOST", "LOCATION", "GPUS", "EXP M/s", "$MIN", "$TGT", "$MAX", "MIN%", "REAL%",
        "TYPE"
    );
    for ranked in offers {
        let _ = writeln!(
            out,
            "{:<9} {:<7} {:<22} {:<16} {:>8.1} {:>7.3} {:>7.3} {:>7.3} {:>6} {:>6}  {}",
            ranked.offer.offer_id,
            ranked.offer.host_id,
            truncate(ranked.offer.location.as_deref().unwrap_or("-"), 22),
            truncate(&ranked.offer.descriptor.to_string(), 16),
            ranked.throughput / MEGA,
            ranked.min_price,
            ranked.target_price,
            ranked.max_price,
            format_percent(ranked.min_price_percent),
            format_percent(ranked.real_price_percent),
            if ranked.bid { "bid" } else { "fixed" }
        );
    }
    out
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}
