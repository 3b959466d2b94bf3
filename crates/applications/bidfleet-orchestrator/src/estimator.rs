//! Throughput estimator backed by the distributed-job HTTP API
//!
//! ```text
//! GET {base}/estimateGpuHashrate?clientId=..&hostId=..&gpuName=..&tflops=..
//! GET {base}/getClientHashrate?clientId=..
//! GET {base}/isPasswordFound
//! ```
//!
//! All three answer with a bare plain-text value. Estimates are per GPU, so
//! the estimate for a machine is scaled by its GPU count.

use crate::error::Result;
use async_trait::async_trait;
use bidfleet_core::{CoreError, EstimateSubject, RentalId, ThroughputEstimator};
use std::time::Duration;
use tracing::{debug, warn};

type CoreResult<T> = std::result::Result<T, CoreError>;

const ESTIMATE_ENDPOINT: &str = "estimateGpuHashrate";
const REALIZED_ENDPOINT: &str = "getClientHashrate";
const TASK_COMPLETE_ENDPOINT: &str = "isPasswordFound";

/// HTTP client for the throughput service
#[derive(Debug, Clone)]
pub struct HttpEstimator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEstimator {
    /// Create an estimator with a 10 second request timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    /// Create an estimator with a custom request timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// GET `endpoint` and return the trimmed body
    async fn get_text(&self, endpoint: &str, query: &[(&str, String)]) -> CoreResult<String> {
        let url = self.url(endpoint);
        debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| CoreError::Estimator(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Estimator(format!("{}: HTTP {}", endpoint, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CoreError::Estimator(format!("{}: {}", endpoint, e)))?;
        Ok(body.trim().to_string())
    }
}

/// Query parameters for a per-GPU estimate
fn estimate_params(subject: &EstimateSubject<'_>) -> Vec<(&'static str, String)> {
    vec![
        (
            "clientId",
            subject.client_id.map(|id| id.to_string()).unwrap_or_default(),
        ),
        ("hostId", subject.host_id.to_string()),
        ("gpuName", subject.descriptor.gpu_name.clone()),
        (
            "tflops",
            format!("{:.0}", subject.descriptor.flops_per_gpu()),
        ),
    ]
}

fn parse_throughput(endpoint: &str, body: &str) -> CoreResult<f64> {
    let value: f64 = body
        .parse()
        .map_err(|_| CoreError::Parse(format!("{}: not a number: {:?}", endpoint, body)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::Parse(format!("{}: invalid throughput {}", endpoint, value)));
    }
    Ok(value)
}

/// `"true"`/`"false"`; anything else is logged and read as not complete
fn parse_task_complete(body: &str) -> bool {
    match body {
        "true" => true,
        "false" => false,
        other => {
            warn!("Unexpected {} answer {:?}, assuming not complete", TASK_COMPLETE_ENDPOINT, other);
            false
        }
    }
}

#[async_trait]
impl ThroughputEstimator for HttpEstimator {
    async fn estimate(&self, subject: EstimateSubject<'_>) -> CoreResult<f64> {
        let body = self
            .get_text(ESTIMATE_ENDPOINT, &estimate_params(&subject))
            .await?;
        let per_gpu = parse_throughput(ESTIMATE_ENDPOINT, &body)?;
        Ok(per_gpu * subject.descriptor.num_gpus as f64)
    }

    async fn realized(&self, rental_id: RentalId) -> CoreResult<f64> {
        let body = self
            .get_text(REALIZED_ENDPOINT, &[("clientId", rental_id.to_string())])
            .await?;
        parse_throughput(REALIZED_ENDPOINT, &body)
    }

    async fn task_complete(&self) -> CoreResult<bool> {
        let body = self.get_text(TASK_COMPLETE_ENDPOINT, &[]).await?;
        Ok(parse_task_complete(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidfleet_core::{Descriptor, HostId};

    #[test]
    fn test_estimate_params_are_per_gpu() {
        let descriptor = Descriptor::new("RTX 3090", 4, 142.4);
        let subject = EstimateSubject {
            client_id: Some(501),
            host_id: HostId(77),
            descriptor: &descriptor,
        };
        let params = estimate_params(&subject);
        assert_eq!(params[0], ("clientId", "501".to_string()));
        assert_eq!(params[1], ("hostId", "77".to_string()));
        assert_eq!(params[2], ("gpuName", "RTX 3090".to_string()));
        assert_eq!(params[3], ("tflops", "36".to_string()));
    }

    #[test]
    fn test_parse_throughput() {
        assert_eq!(parse_throughput("x", "1234.5").unwrap(), 1234.5);
        assert_eq!(parse_throughput("x", "0").unwrap(), 0.0);
        assert!(matches!(parse_throughput("x", "<html>"), Err(CoreError::Parse(_))));
        assert!(parse_throughput("x", "-3").is_err());
        assert!(parse_throughput("x", "NaN").is_err());
    }

    #[test]
    fn test_parse_task_complete() {
        assert!(parse_task_complete("true"));
        assert!(!parse_task_complete("false"));
        assert!(!parse_task_complete("maybe"));
        assert!(!parse_task_complete(""));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let estimator = HttpEstimator::new("http://127.0.0.1:45678/api/").unwrap();
        assert_eq!(
            estimator.url(REALIZED_ENDPOINT),
            "http://127.0.0.1:45678/api/getClientHashrate"
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_estimator_error() {
        let estimator =
            HttpEstimator::with_timeout("http://127.0.0.1:9/api", Duration::from_millis(200))
                .unwrap();
        let err = estimator.realized(RentalId(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::Estimator(_)));
    }
}
