//! Core traits for bidfleet
//!
//! The reconciler and the offer selector work through these interfaces ONLY,
//! never through a concrete marketplace or estimator client.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::types::*;

/// Result type for collaborator operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Spot/bid marketplace capability set.
///
/// Every call may fail or be slow. Implementations validate raw responses into
/// typed records before returning them.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Search rentable offers
    async fn list_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>>;

    /// List our active rentals
    async fn list_rentals(&self) -> Result<Vec<Machine>>;

    /// Rent an offer. `price` is the bid; `None` accepts the listed price.
    async fn create_rental(&self, offer_id: OfferId, price: Option<f64>) -> Result<()>;

    /// Change the bid of a rental
    async fn set_price(&self, rental_id: RentalId, price: f64) -> Result<()>;

    /// Destroy a rental
    async fn destroy_rental(&self, rental_id: RentalId) -> Result<()>;
}

/// Which machine a throughput estimate is for
#[derive(Debug, Clone, Copy)]
pub struct EstimateSubject<'a> {
    /// Rental or offer id; lets the estimator match live client telemetry
    pub client_id: Option<u64>,
    pub host_id: HostId,
    pub descriptor: &'a Descriptor,
}

impl<'a> EstimateSubject<'a> {
    pub fn for_machine(machine: &'a Machine) -> Self {
        Self {
            client_id: Some(machine.rental_id.0),
            host_id: machine.host_id,
            descriptor: &machine.descriptor,
        }
    }

    pub fn for_offer(offer: &'a Offer) -> Self {
        Self {
            client_id: Some(offer.offer_id.0),
            host_id: offer.host_id,
            descriptor: &offer.descriptor,
        }
    }
}

/// Throughput estimation service
#[async_trait]
pub trait ThroughputEstimator: Send + Sync {
    /// Expected throughput of a machine, from its static specs
    async fn estimate(&self, subject: EstimateSubject<'_>) -> Result<f64>;

    /// Throughput the rental is actually delivering
    async fn realized(&self, rental_id: RentalId) -> Result<f64>;

    /// Kill switch: the workload is complete and the fleet should be torn down
    async fn task_complete(&self) -> Result<bool>;
}
