//! Offer selection
//!
//! Every offer is priced two ways. If its listed price is within
//! `fixed_bonus_factor_maxprice` of what its throughput is worth, it is rented
//! at the listed price; otherwise we bid on it. Offers are then ranked by how
//! their cheapest possible price compares to what we would pay at most, and
//! accepted greedily until the throughput target or the spend cap is reached.

use crate::pricing::{PricingPolicy, price_percent};
use crate::reconcile::FleetTotals;
use crate::state::FleetState;
use bidfleet_core::{EstimateSubject, Marketplace, Offer, ThroughputEstimator};
use tracing::{debug, error, info, warn};

/// Caps and thresholds for offer selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorSettings {
    pub pricing: PricingPolicy,

    /// A fixed-price offer may cost this much more than its max price
    pub fixed_bonus_factor_maxprice: f64,

    /// Offers at or above this percentage of their max price are skipped
    pub max_price_percent: f64,

    /// Stop accepting once the fleet delivers this much throughput
    pub target_throughput: f64,

    /// Stop accepting once the fleet costs this much ($/h)
    pub max_dph: f64,
}

/// An offer priced for the path it would be rented on
#[derive(Debug, Clone, PartialEq)]
pub struct RankedOffer {
    pub offer: Offer,

    /// Expected throughput
    pub throughput: f64,

    /// Max price for the selected path (includes the fixed bonus)
    pub max_price: f64,

    /// Max price the throughput justifies on its own
    pub plain_max_price: f64,

    /// Cheapest price we could rent at
    pub min_price: f64,

    /// Price we would rent at
    pub target_price: f64,

    /// Rented as a bid rather than at the listed price
    pub bid: bool,

    /// `min_price` against the selected-path max price; the ranking key
    pub min_price_percent: f64,

    /// `target_price` against the plain max price; reporting only
    pub real_price_percent: f64,
}

/// What one selection pass added
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SelectionSummary {
    pub count: usize,
    pub throughput: f64,
    pub cost: f64,
}

/// Result of a selection pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionOutcome {
    pub accepted: Vec<RankedOffer>,
    pub summary: SelectionSummary,
}

/// Ranks offers and rents the best ones
#[derive(Debug, Clone)]
pub struct OfferSelector {
    settings: SelectorSettings,
}

impl OfferSelector {
    pub fn new(settings: SelectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    /// Price `offer` given its expected throughput
    pub fn rank(&self, offer: Offer, throughput: f64) -> RankedOffer {
        let s = &self.settings;
        let plain_max_price = s.pricing.max_price(throughput);
        let fixed_max_price = plain_max_price * s.fixed_bonus_factor_maxprice;

        let (bid, max_price, min_price, target_price) =
            if !offer.is_bid && offer.dph_total <= fixed_max_price {
                (false, fixed_max_price, offer.dph_total, offer.dph_total)
            } else {
                (
                    true,
                    plain_max_price,
                    offer.min_bid,
                    s.pricing.target_price(throughput, offer.min_bid),
                )
            };

        RankedOffer {
            throughput,
            max_price,
            plain_max_price,
            min_price,
            target_price,
            bid,
            min_price_percent: price_percent(min_price, max_price),
            real_price_percent: price_percent(min_price, plain_max_price),
            offer,
        }
    }

    /// Estimate and price every offer, cheapest relative to its worth first
    pub async fn evaluate<E>(&self, estimator: &E, offers: Vec<Offer>) -> Vec<RankedOffer>
    where
        E: ThroughputEstimator + ?Sized,
    {
        let mut ranked = Vec::with_capacity(offers.len());
        for offer in offers {
            let throughput = estimator
                .estimate(EstimateSubject::for_offer(&offer))
                .await
                .unwrap_or_else(|e| {
                    warn!(offer_id = %offer.offer_id, "Throughput estimate failed: {}", e);
                    0.0
                });
            ranked.push(self.rank(offer, throughput));
        }
        ranked.sort_by(|a, b| a.min_price_percent.total_cmp(&b.min_price_percent));
        ranked
    }

    /// Whether `offer` may be accepted on top of `totals`
    pub fn admits(&self, offer: &RankedOffer, totals: &FleetTotals, state: &FleetState) -> bool {
        let s = &self.settings;
        offer.min_price_percent < s.max_price_percent
            && offer.target_price < s.max_dph - totals.cost
            && totals.throughput < s.target_throughput
            && totals.cost < s.max_dph
            && !state.is_blacklisted(offer.offer.host_id)
    }

    /// Rent ranked offers greedily, updating `totals` as they are accepted
    ///
    /// A failed rental is logged and not counted.
    pub async fn select<M>(
        &self,
        marketplace: &M,
        ranked: Vec<RankedOffer>,
        totals: &mut FleetTotals,
        state: &mut FleetState,
    ) -> SelectionOutcome
    where
        M: Marketplace + ?Sized,
    {
        let mut outcome = SelectionOutcome::default();

        for offer in ranked {
            if !self.admits(&offer, totals, state) {
                debug!(
                    offer_id = %offer.offer.offer_id,
                    min_price_percent = offer.min_price_percent,
                    "Skipping offer"
                );
                continue;
            }

            let price = offer.bid.then_some(offer.target_price);
            info!(
                offer_id = %offer.offer.offer_id,
                host_id = %offer.offer.host_id,
                gpus = %offer.offer.descriptor,
                throughput = offer.throughput,
                price = offer.target_price,
                max_price = offer.max_price,
                bid = offer.bid,
                "Renting offer"
            );

            if let Err(e) = marketplace.create_rental(offer.offer.offer_id, price).await {
                error!(offer_id = %offer.offer.offer_id, "Failed to rent offer: {}", e);
                continue;
            }

            totals.add(offer.throughput, 0.0, offer.target_price);
            state.clear_idle(offer.offer.host_id);
            outcome.summary.count += 1;
            outcome.summary.throughput += offer.throughput;
            outcome.summary.cost += offer.target_price;
            outcome.accepted.push(offer);
        }

        if outcome.summary.count > 0 {
            info!(
                count = outcome.summary.count,
                throughput = outcome.summary.throughput,
                cost = outcome.summary.cost,
                "Rented new machines"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryMarketplace, MarketCall, StaticEstimator};
    use bidfleet_core::{Descriptor, HostId, OfferId};
    use chrono::{TimeZone, Utc};

    /// max_price == throughput (in $/h)
    fn settings() -> SelectorSettings {
        SelectorSettings {
            pricing: PricingPolicy::new(3600.0, 1.1),
            fixed_bonus_factor_maxprice: 1.3,
            max_price_percent: 101.0,
            target_throughput: 100.0,
            max_dph: 50.0,
        }
    }

    fn offer(id: u64, host: u64, dph_total: f64, min_bid: f64) -> Offer {
        Offer {
            offer_id: OfferId(id),
            host_id: HostId(host),
            descriptor: Descriptor::new("RTX 3090", 1, 35.6),
            location: None,
            is_bid: false,
            min_bid,
            dph_total,
        }
    }

    #[test]
    fn test_fixed_offer_uses_bonus_adjusted_max() {
        let selector = OfferSelector::new(settings());
        let ranked = selector.rank(offer(1, 10, 1.00, 0.5), 1.2);

        assert!(!ranked.bid);
        assert!((ranked.max_price - 1.56).abs() < 1e-12);
        assert!((ranked.min_price_percent - 64.102_564).abs() < 1e-3);
        assert!((ranked.real_price_percent - 83.333_333).abs() < 1e-3);
        assert_eq!(ranked.target_price, 1.00);
        assert!(selector.admits(&ranked, &FleetTotals::default(), &FleetState::default()));
    }

    #[test]
    fn test_expensive_offer_takes_bid_path() {
        let selector = OfferSelector::new(settings());
        let ranked = selector.rank(offer(1, 10, 2.0, 0.4), 1.0);

        assert!(ranked.bid);
        assert_eq!(ranked.max_price, 1.0);
        assert_eq!(ranked.min_price, 0.4);
        assert!((ranked.target_price - 0.44).abs() < 1e-12);
        assert!((ranked.min_price_percent - 40.0).abs() < 1e-9);
        // Relative to the plain max price at the floor, not at the outbid target
        assert!((ranked.real_price_percent - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_bid_only_offer_never_rented_fixed() {
        let selector = OfferSelector::new(settings());
        let mut o = offer(1, 10, 0.5, 0.3);
        o.is_bid = true;
        assert!(selector.rank(o, 1.0).bid);
    }

    #[test]
    fn test_admission_caps() {
        let selector = OfferSelector::new(settings());
        let ranked = selector.rank(offer(1, 10, 1.0, 0.5), 1.0);
        let state = FleetState::default();

        let full = FleetTotals {
            throughput: 100.0,
            ..Default::default()
        };
        assert!(!selector.admits(&ranked, &full, &state));

        let broke = FleetTotals {
            cost: 49.5,
            ..Default::default()
        };
        assert!(!selector.admits(&ranked, &broke, &state));

        let mut blacklisted = FleetState::default();
        blacklisted.blacklist(HostId(10));
        assert!(!selector.admits(&ranked, &FleetTotals::default(), &blacklisted));

        let pricey = selector.rank(offer(2, 20, 5.0, 1.2), 1.0);
        assert!(pricey.min_price_percent >= 101.0);
        assert!(!selector.admits(&pricey, &FleetTotals::default(), &state));
    }

    #[tokio::test]
    async fn test_evaluate_sorts_by_min_price_percent() {
        let estimator = StaticEstimator::new()
            .with_expected(HostId(10), 1.0)
            .with_expected(HostId(20), 1.0)
            .with_expected(HostId(30), 1.0);
        let selector = OfferSelector::new(settings());

        let ranked = selector
            .evaluate(
                &estimator,
                vec![offer(1, 10, 1.2, 0.9), offer(2, 20, 0.5, 0.4), offer(3, 30, 3.0, 0.2)],
            )
            .await;

        let ids: Vec<u64> = ranked.iter().map(|r| r.offer.offer_id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_headroom_limits_acceptance() {
        let market = InMemoryMarketplace::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .with_offer(offer(1, 10, 3.0, 3.0))
            .with_offer(offer(2, 20, 4.0, 4.0));
        let estimator = StaticEstimator::new()
            .with_expected(HostId(10), 10.0)
            .with_expected(HostId(20), 10.0);
        let selector = OfferSelector::new(settings());
        let mut totals = FleetTotals {
            cost: 45.0,
            ..Default::default()
        };
        let mut state = FleetState::default();

        let ranked = selector
            .evaluate(&estimator, market.list_offers(&Default::default()).await.unwrap())
            .await;
        assert!(ranked.iter().all(|r| r.min_price_percent < 101.0));

        let outcome = selector.select(&market, ranked, &mut totals, &mut state).await;
        assert_eq!(outcome.summary.count, 1);
        assert_eq!(outcome.summary.cost, 3.0);
        assert_eq!(totals.cost, 48.0);
        assert_eq!(
            market.calls(),
            vec![MarketCall::Create {
                offer_id: OfferId(1),
                price: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_bid_offer_passes_target_price_and_clears_idle_timer() {
        let market = InMemoryMarketplace::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .with_offer(offer(1, 10, 2.0, 0.4));
        let estimator = StaticEstimator::new().with_expected(HostId(10), 1.0);
        let selector = OfferSelector::new(settings());
        let mut totals = FleetTotals::default();
        let mut state = FleetState::default();
        state.mark_idle_since(HostId(10), Utc.timestamp_opt(1_600_000_000, 0).unwrap());

        let ranked = selector
            .evaluate(&estimator, market.list_offers(&Default::default()).await.unwrap())
            .await;
        let outcome = selector.select(&market, ranked, &mut totals, &mut state).await;

        assert_eq!(outcome.accepted.len(), 1);
        match market.calls().as_slice() {
            [MarketCall::Create { offer_id, price: Some(price) }] => {
                assert_eq!(*offer_id, OfferId(1));
                assert!((price - 0.44).abs() < 1e-12);
            }
            other => panic!("unexpected calls: {:?}", other),
        }
        assert_eq!(state.idle_since(HostId(10)), None);
        assert!((totals.throughput - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failed_rental_not_counted() {
        let market = InMemoryMarketplace::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .with_offer(offer(1, 10, 1.0, 0.5));
        market.set_fail_creates(true);
        let estimator = StaticEstimator::new().with_expected(HostId(10), 1.0);
        let selector = OfferSelector::new(settings());
        let mut totals = FleetTotals::default();
        let mut state = FleetState::default();

        let ranked = selector
            .evaluate(&estimator, market.list_offers(&Default::default()).await.unwrap())
            .await;
        let outcome = selector.select(&market, ranked, &mut totals, &mut state).await;

        assert_eq!(outcome.summary, SelectionSummary::default());
        assert_eq!(totals, FleetTotals::default());
        assert_eq!(market.calls().len(), 1);
    }
}
