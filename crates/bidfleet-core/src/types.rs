//! Core types shared across bidfleet components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Marketplace id of an active rental (instance)
    RentalId
);
numeric_id!(
    /// Marketplace id of the physical host behind a rental or offer
    HostId
);
numeric_id!(
    /// Marketplace id of an offer, usable to create a rental
    OfferId
);

/// Hardware descriptor of a machine or offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// GPU model as reported by the marketplace (e.g. "RTX 3090")
    pub gpu_name: String,

    /// Number of GPUs
    pub num_gpus: u32,

    /// Declared compute capability of all GPUs together (TFLOPS)
    pub total_flops: f64,
}

impl Descriptor {
    pub fn new(gpu_name: impl Into<String>, num_gpus: u32, total_flops: f64) -> Self {
        Self {
            gpu_name: gpu_name.into(),
            num_gpus,
            total_flops,
        }
    }

    /// Declared TFLOPS of a single GPU
    pub fn flops_per_gpu(&self) -> f64 {
        if self.num_gpus == 0 {
            0.0
        } else {
            self.total_flops / self.num_gpus as f64
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} * {}", self.num_gpus, self.gpu_name)
    }
}

/// Lifecycle state of a rental, as reported by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalState {
    Running,
    Loading,
    Created,
    Exited,
    Stopped,
    /// No state reported
    Unset,
    /// Any state this crate does not distinguish
    Other,
}

impl RentalState {
    /// Parse from the marketplace's raw status string
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Unset,
            Some("running") => Self::Running,
            Some("loading") => Self::Loading,
            Some("created") => Self::Created,
            Some("exited") => Self::Exited,
            Some("stopped") => Self::Stopped,
            Some(_) => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Loading => "loading",
            Self::Created => "created",
            Self::Exited => "exited",
            Self::Stopped => "stopped",
            Self::Unset => "?",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for RentalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSH endpoint of a rental
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A currently rented machine
///
/// Read fresh from the marketplace every cycle; never cached across cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub rental_id: RentalId,
    pub host_id: HostId,
    pub descriptor: Descriptor,

    /// Geolocation / hostname string, display only
    pub location: Option<String>,

    /// Bid (interruptible) rental vs. fixed-price rental
    pub is_bid: bool,

    /// Current minimum bid on this host ($/h)
    pub min_bid: f64,

    /// Our current base price / bid ($/h)
    pub dph_base: f64,

    /// Total hourly cost including storage and bandwidth ($/h)
    pub dph_total: f64,

    /// Hourly cost of holding the storage while stopped ($/h)
    pub storage_cost: f64,

    pub start_time: DateTime<Utc>,
    pub current_state: RentalState,
    pub intended_state: RentalState,
    pub ssh: Option<SshEndpoint>,
}

impl Machine {
    /// Both the actual and the intended state are `stopped`
    pub fn is_fully_stopped(&self) -> bool {
        self.current_state == RentalState::Stopped && self.intended_state == RentalState::Stopped
    }

    /// Intended state is stopped or was never set (a parked bid)
    pub fn is_parked(&self) -> bool {
        matches!(self.intended_state, RentalState::Stopped | RentalState::Unset)
    }

    /// Time since the rental started
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.start_time).max(chrono::Duration::zero())
    }
}

/// An offer from a marketplace search, not yet rented
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: OfferId,
    pub host_id: HostId,
    pub descriptor: Descriptor,
    pub location: Option<String>,

    /// Offer is only rentable as an interruptible bid
    pub is_bid: bool,

    /// Minimum bid ($/h)
    pub min_bid: f64,

    /// Listed total price for a fixed-price rental ($/h)
    pub dph_total: f64,
}

/// Offer search criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferQuery {
    /// Maximum upload cost ($/GB)
    pub max_inet_up_cost: f64,
    /// Maximum download cost ($/GB)
    pub max_inet_down_cost: f64,
    /// Maximum storage cost ($/GB/month)
    pub max_storage_cost: f64,
    /// Minimum remaining rental duration (days)
    pub min_duration_days: f64,
    /// Minimum download bandwidth (Mbit/s)
    pub min_inet_down: f64,
    /// Minimum upload bandwidth (Mbit/s)
    pub min_inet_up: f64,
    /// Required disk space (GB)
    pub disk_space_gb: u32,
    /// Minimum CUDA version
    pub min_cuda: f64,
}

impl Default for OfferQuery {
    fn default() -> Self {
        Self {
            max_inet_up_cost: 0.03,
            max_inet_down_cost: 0.03,
            max_storage_cost: 2.0,
            min_duration_days: 0.5,
            min_inet_down: 50.0,
            min_inet_up: 2.0,
            disk_space_gb: 1,
            min_cuda: 11.0,
        }
    }
}
