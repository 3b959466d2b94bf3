//! In-memory marketplace and estimator
//!
//! Deterministic stand-ins for the external collaborators. They record every
//! command issued against them, which is what the reconciler, selector and
//! control-loop tests assert on.

use async_trait::async_trait;
use bidfleet_core::{
    CoreError, EstimateSubject, HostId, Machine, Marketplace, Offer, OfferId, OfferQuery,
    RentalId, RentalState, ThroughputEstimator,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

type CoreResult<T> = std::result::Result<T, CoreError>;

/// A command received by [`InMemoryMarketplace`]
#[derive(Debug, Clone, PartialEq)]
pub enum MarketCall {
    /// `create_rental`
    Create {
        /// Offer rented
        offer_id: OfferId,
        /// Bid, if any
        price: Option<f64>,
    },
    /// `set_price`
    SetPrice {
        /// Rental changed
        rental_id: RentalId,
        /// New bid
        price: f64,
    },
    /// `destroy_rental`
    Destroy {
        /// Rental destroyed
        rental_id: RentalId,
    },
}

#[derive(Debug, Default)]
struct MarketInner {
    rentals: Vec<Machine>,
    offers: Vec<Offer>,
    calls: Vec<MarketCall>,
    next_rental_id: u64,
    fail_listing: bool,
    fail_creates: bool,
}

/// Marketplace that keeps rentals and offers in memory
#[derive(Debug)]
pub struct InMemoryMarketplace {
    inner: Mutex<MarketInner>,
    clock: DateTime<Utc>,
}

impl InMemoryMarketplace {
    /// Empty marketplace; new rentals get `clock` as their start time
    pub fn new(clock: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(MarketInner {
                next_rental_id: 1000,
                ..Default::default()
            }),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MarketInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an existing rental
    pub fn with_rental(self, machine: Machine) -> Self {
        self.lock().rentals.push(machine);
        self
    }

    /// Add a searchable offer
    pub fn with_offer(self, offer: Offer) -> Self {
        self.lock().offers.push(offer);
        self
    }

    /// Make `list_rentals` and `list_offers` fail
    pub fn set_fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    /// Make `create_rental` fail
    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Commands received so far
    pub fn calls(&self) -> Vec<MarketCall> {
        self.lock().calls.clone()
    }

    /// Forget recorded commands
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Current rentals
    pub fn rentals(&self) -> Vec<Machine> {
        self.lock().rentals.clone()
    }
}

#[async_trait]
impl Marketplace for InMemoryMarketplace {
    async fn list_offers(&self, _query: &OfferQuery) -> CoreResult<Vec<Offer>> {
        let inner = self.lock();
        if inner.fail_listing {
            return Err(CoreError::command("search offers unavailable"));
        }
        let rented: Vec<HostId> = inner.rentals.iter().map(|m| m.host_id).collect();
        Ok(inner
            .offers
            .iter()
            .filter(|o| !rented.contains(&o.host_id))
            .cloned()
            .collect())
    }

    async fn list_rentals(&self) -> CoreResult<Vec<Machine>> {
        let inner = self.lock();
        if inner.fail_listing {
            return Err(CoreError::command("show instances unavailable"));
        }
        Ok(inner.rentals.clone())
    }

    async fn create_rental(&self, offer_id: OfferId, price: Option<f64>) -> CoreResult<()> {
        let mut inner = self.lock();
        inner.calls.push(MarketCall::Create { offer_id, price });
        if inner.fail_creates {
            return Err(CoreError::command("offer no longer available"));
        }

        let offer = inner
            .offers
            .iter()
            .find(|o| o.offer_id == offer_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("offer {}", offer_id)))?;

        let rental_id = RentalId(inner.next_rental_id);
        inner.next_rental_id += 1;

        let bid = price.unwrap_or(offer.dph_total);
        inner.rentals.push(Machine {
            rental_id,
            host_id: offer.host_id,
            descriptor: offer.descriptor.clone(),
            location: offer.location.clone(),
            is_bid: price.is_some(),
            min_bid: offer.min_bid,
            dph_base: bid,
            dph_total: bid,
            storage_cost: 0.0,
            start_time: self.clock,
            current_state: RentalState::Loading,
            intended_state: RentalState::Running,
            ssh: None,
        });
        Ok(())
    }

    async fn set_price(&self, rental_id: RentalId, price: f64) -> CoreResult<()> {
        let mut inner = self.lock();
        inner.calls.push(MarketCall::SetPrice { rental_id, price });
        let machine = inner
            .rentals
            .iter_mut()
            .find(|m| m.rental_id == rental_id)
            .ok_or_else(|| CoreError::NotFound(format!("rental {}", rental_id)))?;
        machine.dph_base = price;
        Ok(())
    }

    async fn destroy_rental(&self, rental_id: RentalId) -> CoreResult<()> {
        let mut inner = self.lock();
        inner.calls.push(MarketCall::Destroy { rental_id });
        let before = inner.rentals.len();
        inner.rentals.retain(|m| m.rental_id != rental_id);
        if inner.rentals.len() == before {
            return Err(CoreError::NotFound(format!("rental {}", rental_id)));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EstimatorInner {
    per_host: HashMap<HostId, f64>,
    realized: HashMap<RentalId, f64>,
    task_complete: bool,
    failing: bool,
}

/// Estimator answering from fixed tables
#[derive(Debug, Default)]
pub struct StaticEstimator {
    inner: Mutex<EstimatorInner>,
}

impl StaticEstimator {
    /// Estimator that knows nothing (every estimate is zero)
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EstimatorInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Expected throughput of `host`
    pub fn with_expected(self, host: HostId, throughput: f64) -> Self {
        self.set_expected(host, throughput);
        self
    }

    /// Realized throughput of `rental`
    pub fn with_realized(self, rental: RentalId, throughput: f64) -> Self {
        self.set_realized(rental, throughput);
        self
    }

    /// Change the expected throughput of `host`
    pub fn set_expected(&self, host: HostId, throughput: f64) {
        self.lock().per_host.insert(host, throughput);
    }

    /// Change the realized throughput of `rental`
    pub fn set_realized(&self, rental: RentalId, throughput: f64) {
        self.lock().realized.insert(rental, throughput);
    }

    /// Flip the kill switch
    pub fn set_task_complete(&self, complete: bool) {
        self.lock().task_complete = complete;
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }
}

#[async_trait]
impl ThroughputEstimator for StaticEstimator {
    async fn estimate(&self, subject: EstimateSubject<'_>) -> CoreResult<f64> {
        let inner = self.lock();
        if inner.failing {
            return Err(CoreError::Estimator("estimator unreachable".into()));
        }
        Ok(inner.per_host.get(&subject.host_id).copied().unwrap_or(0.0))
    }

    async fn realized(&self, rental_id: RentalId) -> CoreResult<f64> {
        let inner = self.lock();
        if inner.failing {
            return Err(CoreError::Estimator("estimator unreachable".into()));
        }
        Ok(inner.realized.get(&rental_id).copied().unwrap_or(0.0))
    }

    async fn task_complete(&self) -> CoreResult<bool> {
        let inner = self.lock();
        if inner.failing {
            return Err(CoreError::Estimator("estimator unreachable".into()));
        }
        Ok(inner.task_complete)
    }
}
