//! Records that travel through the pipeline: targets and regions read from
//! the store, check requests on the check stream, ticks on the tick stream.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Frequency tiers ─────────────────────────────────────────────

/// The closed set of check frequencies a target can be scheduled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "30s")]
    ThirtySeconds,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
}

impl Frequency {
    pub const ALL: [Frequency; 4] = [
        Frequency::ThirtySeconds,
        Frequency::OneMinute,
        Frequency::ThreeMinutes,
        Frequency::FiveMinutes,
    ];

    /// Label used in the store's `frequency` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::ThirtySeconds => "30s",
            Frequency::OneMinute => "1m",
            Frequency::ThreeMinutes => "3m",
            Frequency::FiveMinutes => "5m",
        }
    }

    pub fn period(self) -> Duration {
        match self {
            Frequency::ThirtySeconds => Duration::from_secs(30),
            Frequency::OneMinute => Duration::from_secs(60),
            Frequency::ThreeMinutes => Duration::from_secs(180),
            Frequency::FiveMinutes => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frequency::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown frequency tier `{s}`"))
    }
}

// ─── Store records ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    /// Stable external identifier (e.g. `IND`); doubles as consumer group.
    pub name: String,
}

/// A URL registered for monitoring. Owned by the registration layer; the
/// pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredTarget {
    pub id: String,
    pub url: String,
    pub frequency: Frequency,
    pub regions: Vec<Region>,
}

impl MonitoredTarget {
    /// The slim message the scheduler puts on the check stream.
    pub fn check_request(&self) -> CheckRequest {
        CheckRequest {
            id: self.id.clone(),
            url: self.url.clone(),
            regions: self.regions.iter().map(|r| r.name.clone()).collect(),
        }
    }
}

// ─── Stream payloads ─────────────────────────────────────────────

/// Payload of the check stream: `{"id", "url", "regions": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub id: String,
    pub url: String,
    pub regions: Vec<String>,
}

impl CheckRequest {
    pub fn targets_region(&self, region_name: &str) -> bool {
        self.regions.iter().any(|r| r == region_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickStatus {
    Up,
    Down,
    Unknown,
}

impl TickStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TickStatus::Up => "up",
            TickStatus::Down => "down",
            TickStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(TickStatus::Up),
            "down" => Ok(TickStatus::Down),
            "unknown" => Ok(TickStatus::Unknown),
            other => Err(format!("invalid tick status `{other}`")),
        }
    }
}

/// One probe outcome for a website from a region. Payload of the tick stream
/// and row of the tick series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    #[serde(rename = "responseTime")]
    pub response_time_ms: Option<i64>,
    pub status: TickStatus,
    pub region_id: String,
    pub website_id: String,
}
