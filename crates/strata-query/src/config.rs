//! Query Configuration
//!
//! - **timeout**: Deadline shared by the local and archive sub-queries (default: 30s)
//! - **resolution**: Range thresholds for picking a tier (defaults: raw < 7d, 5m < 90d)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::ResolutionPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub resolution: ResolutionPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            resolution: ResolutionPolicy::default(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let config: QueryConfig = toml::from_str(
            r#"
            timeout = "5s"

            [resolution]
            raw_max_range = "2d"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.resolution.raw_max_range, Duration::from_secs(2 * 86_400));
        assert_eq!(
            config.resolution.five_minute_max_range,
            ResolutionPolicy::default().five_minute_max_range
        );
    }
}
