//! Resolutions, resolution selection and retention
//!
//! Three tiers exist. Raw blocks carry every sample; the 5m and 1h tiers carry
//! one [`Aggregate`](crate::series::Aggregate) per series per aligned window.
//!
//! Which tier answers a query depends only on the query range (and optionally the
//! step), never on what happens to be present locally. That keeps the choice
//! deterministic: the same range always yields the same tier.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FIVE_MINUTES_MS: i64 = 5 * 60 * 1000;
const ONE_HOUR_MS: i64 = 60 * 60 * 1000;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum Resolution {
    #[serde(rename = "raw")]
    Raw = 0,
    #[serde(rename = "5m")]
    FiveMinutes = 1,
    #[serde(rename = "1h")]
    OneHour = 2,
}

impl Resolution {
    /// Finest to coarsest
    pub const ALL: [Resolution; 3] = [
        Resolution::Raw,
        Resolution::FiveMinutes,
        Resolution::OneHour,
    ];

    /// Window length in milliseconds; 0 for raw
    pub fn window_ms(self) -> i64 {
        match self {
            Resolution::Raw => 0,
            Resolution::FiveMinutes => FIVE_MINUTES_MS,
            Resolution::OneHour => ONE_HOUR_MS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Raw => "raw",
            Resolution::FiveMinutes => "5m",
            Resolution::OneHour => "1h",
        }
    }

    pub fn is_raw(self) -> bool {
        self == Resolution::Raw
    }

    pub fn coarser(self) -> Option<Resolution> {
        match self {
            Resolution::Raw => Some(Resolution::FiveMinutes),
            Resolution::FiveMinutes => Some(Resolution::OneHour),
            Resolution::OneHour => None,
        }
    }

    pub fn finer(self) -> Option<Resolution> {
        match self {
            Resolution::Raw => None,
            Resolution::FiveMinutes => Some(Resolution::Raw),
            Resolution::OneHour => Some(Resolution::FiveMinutes),
        }
    }

    /// Start of the window containing `ts`
    pub fn align(self, ts: i64) -> i64 {
        let window = self.window_ms();
        if window == 0 {
            ts
        } else {
            ts.div_euclid(window) * window
        }
    }

    /// Smallest window start that is `>= ts`
    pub fn align_up(self, ts: i64) -> i64 {
        let start = self.align(ts);
        if start == ts {
            ts
        } else {
            start + self.window_ms()
        }
    }

    /// Tiers to try, in order, when `self` has no data: finer ones first, then coarser
    pub fn fallback_order(self) -> Vec<Resolution> {
        let mut order = vec![self];
        let mut finer = self.finer();
        while let Some(r) = finer {
            order.push(r);
            finer = r.finer();
        }
        let mut coarser = self.coarser();
        while let Some(r) = coarser {
            order.push(r);
            coarser = r.coarser();
        }
        order
    }
}

impl TryFrom<u16> for Resolution {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Resolution::Raw),
            1 => Ok(Resolution::FiveMinutes),
            2 => Ok(Resolution::OneHour),
            _ => Err(Error::InvalidResolution(value.to_string())),
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Resolution::Raw),
            "5m" | "5m_downsample" => Ok(Resolution::FiveMinutes),
            "1h" | "1h_downsample" => Ok(Resolution::OneHour),
            other => Err(Error::InvalidResolution(other.to_string())),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range thresholds for picking a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPolicy {
    /// Ranges shorter than this read raw data
    #[serde(with = "humantime_serde", default = "default_raw_max_range")]
    pub raw_max_range: Duration,

    /// Ranges shorter than this (and not raw) read 5m data; longer ones read 1h
    #[serde(with = "humantime_serde", default = "default_five_minute_max_range")]
    pub five_minute_max_range: Duration,
}

fn default_raw_max_range() -> Duration {
    7 * DAY
}

fn default_five_minute_max_range() -> Duration {
    90 * DAY
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            raw_max_range: default_raw_max_range(),
            five_minute_max_range: default_five_minute_max_range(),
        }
    }
}

impl ResolutionPolicy {
    pub fn select(&self, range: Duration) -> Resolution {
        if range < self.raw_max_range {
            Resolution::Raw
        } else if range < self.five_minute_max_range {
            Resolution::FiveMinutes
        } else {
            Resolution::OneHour
        }
    }

    /// Like [`select`](Self::select), but never returns a tier whose window is
    /// wider than the requested step.
    pub fn select_for_step(&self, range: Duration, step: Option<Duration>) -> Resolution {
        let mut resolution = self.select(range);
        let Some(step) = step else {
            return resolution;
        };
        let step_ms = step.as_millis().min(i64::MAX as u128) as i64;
        while resolution.window_ms() > step_ms {
            match resolution.finer() {
                Some(finer) => resolution = finer,
                None => break,
            }
        }
        resolution
    }
}

/// Tier for a query range under the default thresholds
pub fn select_resolution(range: Duration) -> Resolution {
    ResolutionPolicy::default().select(range)
}

/// Maximum block age per resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(with = "humantime_serde", default = "default_raw_retention")]
    pub raw: Duration,

    #[serde(
        rename = "5m",
        alias = "five_minutes",
        with = "humantime_serde",
        default = "default_five_minute_retention"
    )]
    pub five_minutes: Duration,

    #[serde(
        rename = "1h",
        alias = "one_hour",
        with = "humantime_serde",
        default = "default_one_hour_retention"
    )]
    pub one_hour: Duration,
}

fn default_raw_retention() -> Duration {
    30 * DAY
}

fn default_five_minute_retention() -> Duration {
    90 * DAY
}

fn default_one_hour_retention() -> Duration {
    365 * DAY
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw: default_raw_retention(),
            five_minutes: default_five_minute_retention(),
            one_hour: default_one_hour_retention(),
        }
    }
}

impl RetentionPolicy {
    pub fn for_resolution(&self, resolution: Resolution) -> Duration {
        match resolution {
            Resolution::Raw => self.raw,
            Resolution::FiveMinutes => self.five_minutes,
            Resolution::OneHour => self.one_hour,
        }
    }

    /// Oldest `max_time` a block of `resolution` may have and still be kept
    pub fn cutoff(&self, resolution: Resolution, now_ms: i64) -> i64 {
        let retention = self.for_resolution(resolution).as_millis().min(i64::MAX as u128) as i64;
        now_ms.saturating_sub(retention)
    }

    /// A block expires once its newest sample falls out of the window
    pub fn is_expired(&self, resolution: Resolution, max_time: i64, now_ms: i64) -> bool {
        max_time < self.cutoff(resolution, now_ms)
    }
}
