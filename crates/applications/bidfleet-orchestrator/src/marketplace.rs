//! Marketplace client backed by the `vast` command-line tool
//!
//! Every call shells out to the CLI with `--raw` and decodes the JSON it
//! prints. Raw records are validated here, once; the rest of the crate only
//! ever sees [`Machine`] and [`Offer`].
//!
//! ## Transient failures
//!
//! The marketplace gateway regularly answers with
//!
//! ```text
//! failed with error 502: Bad Gateway
//! ```
//!
//! and occasionally prints truncated JSON. Both are classified as transient
//! and retried under the configured [`RetryPolicy`]; a nonzero exit status is
//! a permanent command failure.

use crate::config::LaunchSpec;
use crate::error::BidderError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bidfleet_core::{
    CoreError, Descriptor, HostId, Machine, Marketplace, Offer, OfferId, OfferQuery, RentalId,
    RentalState, SshEndpoint,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

type CoreResult<T> = std::result::Result<T, CoreError>;

/// Gateway error prefixes the CLI prints on stdout
const TRANSIENT_PREFIXES: [&str; 2] = ["failed with error 502", "failed with error 500"];

/// Sort order for offer searches: most compute per dollar first
const OFFER_ORDER: &str = "flops_usd-";

/// Raw rental record from `show instances --raw`
#[derive(Debug, Deserialize)]
struct RawInstance {
    id: u64,
    machine_id: u64,
    gpu_name: Option<String>,
    num_gpus: Option<u32>,
    total_flops: Option<f64>,
    #[serde(default)]
    is_bid: bool,
    min_bid: Option<f64>,
    dph_base: Option<f64>,
    dph_total: Option<f64>,
    storage_total_cost: Option<f64>,
    start_date: Option<f64>,
    actual_status: Option<String>,
    cur_state: Option<String>,
    intended_status: Option<String>,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    geolocation: Option<String>,
    hostname: Option<String>,
}

/// Raw offer record from `search offers --raw`
#[derive(Debug, Deserialize)]
struct RawOffer {
    id: u64,
    machine_id: u64,
    gpu_name: Option<String>,
    num_gpus: Option<u32>,
    total_flops: Option<f64>,
    #[serde(default)]
    is_bid: bool,
    min_bid: Option<f64>,
    dph_total: Option<f64>,
    geolocation: Option<String>,
}

fn descriptor(
    gpu_name: Option<String>,
    num_gpus: Option<u32>,
    total_flops: Option<f64>,
) -> CoreResult<Descriptor> {
    let gpu_name = gpu_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| CoreError::Parse("missing gpu_name".into()))?;
    let num_gpus = num_gpus
        .filter(|n| *n > 0)
        .ok_or_else(|| CoreError::Parse(format!("{}: missing num_gpus", gpu_name)))?;
    Ok(Descriptor::new(gpu_name, num_gpus, total_flops.unwrap_or(0.0)))
}

fn start_time(epoch_secs: Option<f64>) -> DateTime<Utc> {
    epoch_secs
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .and_then(|secs| {
            let whole = secs.trunc();
            DateTime::from_timestamp(whole as i64, ((secs - whole) * 1e9) as u32)
        })
        .unwrap_or_default()
}

impl TryFrom<RawInstance> for Machine {
    type Error = CoreError;

    fn try_from(raw: RawInstance) -> CoreResult<Self> {
        let descriptor = descriptor(raw.gpu_name, raw.num_gpus, raw.total_flops)?;
        let dph_base = raw.dph_base.unwrap_or(0.0);
        let ssh = match (raw.ssh_host, raw.ssh_port) {
            (Some(host), Some(port)) if !host.is_empty() => Some(SshEndpoint { host, port }),
            _ => None,
        };

        Ok(Machine {
            rental_id: RentalId(raw.id),
            host_id: HostId(raw.machine_id),
            descriptor,
            location: raw.geolocation.or(raw.hostname),
            is_bid: raw.is_bid,
            min_bid: raw.min_bid.unwrap_or(0.0),
            dph_base,
            dph_total: raw.dph_total.unwrap_or(dph_base),
            storage_cost: raw.storage_total_cost.unwrap_or(0.0),
            start_time: start_time(raw.start_date),
            current_state: RentalState::parse(raw.cur_state.or(raw.actual_status).as_deref()),
            intended_state: RentalState::parse(raw.intended_status.as_deref()),
            ssh,
        })
    }
}

impl TryFrom<RawOffer> for Offer {
    type Error = CoreError;

    fn try_from(raw: RawOffer) -> CoreResult<Self> {
        let descriptor = descriptor(raw.gpu_name, raw.num_gpus, raw.total_flops)?;
        let dph_total = raw
            .dph_total
            .ok_or_else(|| CoreError::Parse(format!("offer {}: missing dph_total", raw.id)))?;

        Ok(Offer {
            offer_id: OfferId(raw.id),
            host_id: HostId(raw.machine_id),
            descriptor,
            location: raw.geolocation,
            is_bid: raw.is_bid,
            min_bid: raw.min_bid.unwrap_or(dph_total),
            dph_total,
        })
    }
}

/// Decode a JSON array record by record, skipping records that fail validation
fn decode_records<R, T>(what: &str, stdout: &str) -> CoreResult<Vec<T>>
where
    R: DeserializeOwned,
    T: TryFrom<R, Error = CoreError>,
{
    let values: Vec<serde_json::Value> = serde_json::from_str(stdout)
        .map_err(|e| CoreError::transient(format!("unparseable {} listing: {}", what, e)))?;

    let mut records = Vec::with_capacity(values.len());
    for value in values {
        let decoded = serde_json::from_value::<R>(value)
            .map_err(|e| CoreError::Parse(e.to_string()))
            .and_then(T::try_from);
        match decoded {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping malformed {} record: {}", what, e),
        }
    }
    Ok(records)
}

/// Render the offer filter understood by `search offers`
pub fn render_query(query: &OfferQuery) -> String {
    format!(
        "num_gpus >= 1 cuda_vers >= {} verified = true external = false rentable = true rented = false \
         inet_down >= {} inet_up >= {} inet_down_cost <= {} inet_up_cost <= {} \
         storage_cost <= {} disk_space >= {} duration >= {}",
        query.min_cuda,
        query.min_inet_down,
        query.min_inet_up,
        query.max_inet_down_cost,
        query.max_inet_up_cost,
        query.max_storage_cost,
        query.disk_space_gb,
        query.min_duration_days,
    )
}

/// Classify the outcome of one CLI invocation
fn classify(success: bool, stdout: &str, stderr: &str) -> CoreResult<()> {
    let trimmed = stdout.trim_start();
    if TRANSIENT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return Err(CoreError::transient(trimmed.lines().next().unwrap_or(trimmed)));
    }
    if !success {
        let message = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(CoreError::command(message.trim()));
    }
    Ok(())
}

/// [`Marketplace`] implementation driving the vast CLI
#[derive(Debug, Clone)]
pub struct VastCli {
    /// CLI executable
    program: PathBuf,

    /// What to launch on new rentals
    launch: LaunchSpec,

    /// Retry schedule for transient failures
    retry: RetryPolicy,
}

impl VastCli {
    /// Create a client for the CLI at `program`
    pub fn new(program: impl Into<PathBuf>, launch: LaunchSpec, retry: RetryPolicy) -> Self {
        Self {
            program: program.into(),
            launch,
            retry,
        }
    }

    /// Run the CLI once and return its stdout
    async fn exec(&self, args: &[String]) -> CoreResult<String> {
        debug!("Running {} {}", self.program.display(), args.join(" "));

        let output = AsyncCommand::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                CoreError::command(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        classify(output.status.success(), &stdout, &stderr)?;
        Ok(stdout)
    }

    /// Run `op` under the retry policy, flattening the outcome back to a [`CoreError`]
    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.retry.run(operation, op).await.map_err(|e| match e {
            BidderError::Upstream(inner) => inner,
            other => CoreError::command(other.to_string()),
        })
    }

    fn create_args(&self, offer_id: OfferId, price: Option<f64>) -> Vec<String> {
        let mut args = vec!["create".to_string(), "instance".to_string()];
        if let Some(price) = price {
            args.push("--price".to_string());
            args.push(format!("{:.4}", price));
        }
        args.extend([
            "--disk".to_string(),
            self.launch.disk_gb.to_string(),
            "--image".to_string(),
            self.launch.image.clone(),
            "--onstart-cmd".to_string(),
            self.launch.onstart_cmd.clone(),
            offer_id.to_string(),
        ]);
        args
    }

    fn search_args(query: &OfferQuery) -> Vec<String> {
        vec![
            "search".to_string(),
            "offers".to_string(),
            "--no-default".to_string(),
            "--type".to_string(),
            "ask".to_string(),
            "--storage".to_string(),
            query.disk_space_gb.to_string(),
            "-o".to_string(),
            OFFER_ORDER.to_string(),
            "--raw".to_string(),
            render_query(query),
        ]
    }
}

#[async_trait]
impl Marketplace for VastCli {
    async fn list_offers(&self, query: &OfferQuery) -> CoreResult<Vec<Offer>> {
        let args = &Self::search_args(query);
        let offers = self
            .with_retry("search offers", move || async move {
                let stdout = self.exec(args).await?;
                decode_records::<RawOffer, Offer>("offer", &stdout)
            })
            .await?;
        debug!("Found {} offers", offers.len());
        Ok(offers)
    }

    async fn list_rentals(&self) -> CoreResult<Vec<Machine>> {
        let args = &["show", "instances", "--raw"].map(String::from);
        let machines = self
            .with_retry("show instances", move || async move {
                let stdout = self.exec(args).await?;
                decode_records::<RawInstance, Machine>("instance", &stdout)
            })
            .await?;
        debug!("Listed {} rentals", machines.len());
        Ok(machines)
    }

    async fn create_rental(&self, offer_id: OfferId, price: Option<f64>) -> CoreResult<()> {
        let args = &self.create_args(offer_id, price);
        let stdout = self
            .with_retry("create instance", move || self.exec(args))
            .await?;
        info!(offer_id = %offer_id, "Created rental: {}", stdout.trim());
        Ok(())
    }

    async fn set_price(&self, rental_id: RentalId, price: f64) -> CoreResult<()> {
        let args = &vec![
            "change".to_string(),
            "bid".to_string(),
            rental_id.to_string(),
            "--price".to_string(),
            format!("{:.4}", price),
        ];
        self.with_retry("change bid", move || self.exec(args)).await?;
        Ok(())
    }

    async fn destroy_rental(&self, rental_id: RentalId) -> CoreResult<()> {
        let args = &vec![
            "destroy".to_string(),
            "instance".to_string(),
            rental_id.to_string(),
        ];
        self.with_retry("destroy instance", move || self.exec(args)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const INSTANCES: &str = r#"[
        {
            "id": 501, "machine_id": 77, "gpu_name": "RTX 3090", "num_gpus": 2,
            "total_flops": 71.2, "is_bid": true, "min_bid": 0.12, "dph_base": 0.13,
            "dph_total": 0.151, "storage_total_cost": 0.004, "start_date": 1700000000.5,
            "actual_status": "running", "intended_status": "running",
            "ssh_host": "ssh4.vast.ai", "ssh_port": 20501, "geolocation": "Sweden, SE"
        },
        {
            "id": 502, "machine_id": 78, "gpu_name": "RTX 2080", "num_gpus": 1,
            "total_flops": 13.4, "dph_base": 0.2, "intended_status": null
        },
        { "id": 503, "machine_id": 79, "num_gpus": 1 }
    ]"#;

    #[test]
    fn test_decode_instances() {
        let machines = decode_records::<RawInstance, Machine>("instance", INSTANCES).unwrap();
        assert_eq!(machines.len(), 2);

        let first = &machines[0];
        assert_eq!(first.rental_id, RentalId(501));
        assert_eq!(first.host_id, HostId(77));
        assert_eq!(first.descriptor.num_gpus, 2);
        assert!(first.is_bid);
        assert_eq!(first.current_state, RentalState::Running);
        assert_eq!(first.ssh.as_ref().unwrap().to_string(), "ssh4.vast.ai:20501");
        assert_eq!(first.start_time.timestamp(), 1_700_000_000);
        assert_eq!(first.location.as_deref(), Some("Sweden, SE"));

        let second = &machines[1];
        assert!(!second.is_bid);
        assert_eq!(second.dph_total, 0.2);
        assert_eq!(second.intended_state, RentalState::Unset);
        assert!(second.ssh.is_none());
    }

    #[test]
    fn test_truncated_listing_is_transient() {
        let err = decode_records::<RawInstance, Machine>("instance", "[{\"id\": 5").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_decode_offers() {
        let raw = r#"[
            {"id": 9001, "machine_id": 12, "gpu_name": "A100", "num_gpus": 4,
             "total_flops": 78.0, "min_bid": 1.2, "dph_total": 2.4},
            {"id": 9002, "machine_id": 13, "gpu_name": "A100", "num_gpus": 4}
        ]"#;
        let offers = decode_records::<RawOffer, Offer>("offer", raw).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].offer_id, OfferId(9001));
        assert_eq!(offers[0].min_bid, 1.2);
        assert!(!offers[0].is_bid);
    }

    #[test]
    fn test_classify() {
        assert!(classify(true, "[]", "").is_ok());
        assert!(classify(true, "failed with error 502: Bad Gateway", "").unwrap_err().is_transient());
        assert!(classify(false, "failed with error 500", "").unwrap_err().is_transient());

        let err = classify(false, "", "no such instance\n").unwrap_err();
        assert_eq!(err, CoreError::Command("no such instance".into()));
    }

    #[test]
    fn test_render_query() {
        let query = OfferQuery::default();
        let rendered = render_query(&query);
        assert!(rendered.starts_with("num_gpus >= 1 cuda_vers >= 11 verified = true"));
        assert!(rendered.contains("inet_down >= 50 inet_up >= 2"));
        assert!(rendered.contains("inet_down_cost <= 0.03 inet_up_cost <= 0.03"));
        assert!(rendered.ends_with("storage_cost <= 2 disk_space >= 1 duration >= 0.5"));
    }

    #[test]
    fn test_command_lines() {
        let cli = VastCli::new("./vast", LaunchSpec::default(), RetryPolicy::new(Duration::ZERO, 1));

        let bid = cli.create_args(OfferId(42), Some(0.123));
        assert_eq!(&bid[..4], &["create", "instance", "--price", "0.1230"]);
        assert_eq!(bid.last().map(String::as_str), Some("42"));

        let fixed = cli.create_args(OfferId(42), None);
        assert!(!fixed.contains(&"--price".to_string()));

        let search = VastCli::search_args(&OfferQuery::default());
        assert_eq!(search[..6], ["search", "offers", "--no-default", "--type", "ask", "--storage"]);
        assert!(search.contains(&"flops_usd-".to_string()));
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_command_error() {
        let cli = VastCli::new(
            "/nonexistent/bidfleet-vast",
            LaunchSpec::default(),
            RetryPolicy::new(Duration::ZERO, 3),
        );
        let err = cli.list_rentals().await.unwrap_err();
        assert!(matches!(err, CoreError::Command(_)));
    }
}
