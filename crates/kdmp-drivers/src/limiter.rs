//! Per-driver concurrency limit

use tracing::info;

use kdmp_common::config::KdmpConfig;
use kdmp_common::metrics;

use crate::kube_client::JobKubeClient;
use crate::{DriverError, DriverName};

/// Fail with [`DriverError::RateLimited`] when `driver` already runs as many
/// jobs as its limit allows. A limit of 0 disables the check.
pub async fn check_job_limit(
    kube: &dyn JobKubeClient,
    config: &KdmpConfig,
    driver: DriverName,
) -> Result<(), DriverError> {
    let limit = config.max_jobs(driver.as_str(), driver.default_max_jobs());
    if limit == 0 {
        return Ok(());
    }
    let active = kube.count_active_jobs(driver.as_str()).await?;
    if active >= limit {
        info!(driver = %driver, active, limit, "job limit reached");
        metrics::record_job_rate_limited(driver.as_str());
        return Err(DriverError::RateLimited {
            driver: driver.to_string(),
            active,
            limit,
        });
    }
    Ok(())
}
