//! Compactor Configuration
//!
//! - **interval**: Time between compactor cycles (default: 5m)
//! - **lease_ttl**: Lifetime of the compactor lease record (default: 30s)
//! - **lease_renew_interval**: How often the lease holder renews (default: 10s)
//! - **day_grace_period**: A UTC day is closed this long after midnight (default: 1h)
//! - **orphan_grace_period**: Uncommitted block objects older than this are swept (default: 6h)
//! - **max_output_series**: Series per compaction output block (default: 100k)
//! - **compression**: Chunk compression for output blocks (default: lz4)
//! - **retention**: Per-resolution retention (defaults: raw 30d, 5m 90d, 1h 365d)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{Compression, RetentionPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactorConfig {
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    #[serde(with = "humantime_serde", default = "default_lease_ttl")]
    pub lease_ttl: Duration,

    #[serde(with = "humantime_serde", default = "default_lease_renew_interval")]
    pub lease_renew_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_day_grace_period")]
    pub day_grace_period: Duration,

    #[serde(with = "humantime_serde", default = "default_orphan_grace_period")]
    pub orphan_grace_period: Duration,

    #[serde(default = "default_max_output_series")]
    pub max_output_series: usize,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            lease_ttl: default_lease_ttl(),
            lease_renew_interval: default_lease_renew_interval(),
            day_grace_period: default_day_grace_period(),
            orphan_grace_period: default_orphan_grace_period(),
            max_output_series: default_max_output_series(),
            compression: Compression::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_lease_renew_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_day_grace_period() -> Duration {
    Duration::from_secs(3600)
}

fn default_orphan_grace_period() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_max_output_series() -> usize {
    100_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Resolution;

    #[test]
    fn test_defaults() {
        let config = CompactorConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert!(config.lease_renew_interval < config.lease_ttl);
        assert_eq!(
            config.retention.for_resolution(Resolution::OneHour),
            Duration::from_secs(365 * 24 * 3600)
        );
    }

    #[test]
    fn test_from_toml() {
        let config: CompactorConfig = toml::from_str(
            r#"
            interval = "1m"
            max_output_series = 10

            [retention]
            raw = "7d"
            "5m" = "30d"
            "#,
        )
        .unwrap();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.max_output_series, 10);
        assert_eq!(
            config.retention.for_resolution(Resolution::Raw),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(
            config.retention.for_resolution(Resolution::FiveMinutes),
            Duration::from_secs(30 * 24 * 3600)
        );
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
    }
}
