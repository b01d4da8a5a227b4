//! Core records shared by the grid, orchestrator, store and insight layers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CrawlerError;

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CrawlerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(CrawlerError::InvalidInput(format!(
                        "unknown {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// One vantage point of a scan. The id stays stable so a point can be
/// repositioned individually later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SamplePoint {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
}

impl SamplePoint {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lng,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GridShape {
    Lattice,
    ConcentricRing,
    /// Four jittered angular sectors ("zip" style).
    SectorJitter,
    /// Seven fixed rings, denser near the center ("smart" style).
    VariableDensityRing,
}

text_enum!(GridShape {
    Lattice => "LATTICE",
    ConcentricRing => "CONCENTRIC_RING",
    SectorJitter => "SECTOR_JITTER",
    VariableDensityRing => "VARIABLE_DENSITY_RING",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
}

text_enum!(Recurrence {
    None => "NONE",
    Daily => "DAILY",
    Weekly => "WEEKLY",
});

impl Recurrence {
    pub fn next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => Some(from + Duration::hours(24)),
            Recurrence::Weekly => Some(from + Duration::days(7)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

text_enum!(ScanStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Stopped => "STOPPED",
});

impl ScanStatus {
    /// A run that observes one of these between points must exit without writing.
    pub fn supersedes_run(&self) -> bool {
        matches!(self, ScanStatus::Stopped | ScanStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Scan {
    pub id: Uuid,
    pub keyword: String,
    pub business_name: Option<String>,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_km: f64,
    pub grid_size: u32,
    pub shape: GridShape,
    /// Caller-supplied points that replace the generated grid.
    pub custom_points: Option<Vec<SamplePoint>>,
    pub recurrence: Recurrence,
    pub status: ScanStatus,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Scan {
    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.center_lat, self.center_lng)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewScan {
    pub keyword: String,
    pub business_name: Option<String>,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_km: f64,
    pub grid_size: u32,
    pub shape: GridShape,
    pub custom_points: Option<Vec<SamplePoint>>,
    #[serde(default)]
    pub recurrence: Recurrence,
}

/// One visited sample point. Written once per point per run and never edited.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScanResult {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub point_id: String,
    pub lat: f64,
    pub lng: f64,
    pub top_results: Vec<BusinessEntry>,
    pub rank: Option<u32>,
    pub matched_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewResult {
    pub scan_id: Uuid,
    pub point: SamplePoint,
    pub top_results: Vec<BusinessEntry>,
    pub rank: Option<u32>,
    pub matched_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

text_enum!(ProxyProtocol {
    Http => "HTTP",
    Https => "HTTPS",
    Socks5 => "SOCKS5",
});

impl Default for ProxyProtocol {
    fn default() -> Self {
        ProxyProtocol::Http
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Residential,
    Datacenter,
}

text_enum!(ProxyKind {
    Residential => "RESIDENTIAL",
    Datacenter => "DATACENTER",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyStatus {
    Untested,
    Active,
    Dead,
}

text_enum!(ProxyStatus {
    Untested => "UNTESTED",
    Active => "ACTIVE",
    Dead => "DEAD",
});

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProxyRecord {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
    pub kind: ProxyKind,
    pub enabled: bool,
    pub status: ProxyStatus,
    pub last_tested: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    RankUp,
    RankDown,
    ScanError,
}

text_enum!(AlertKind {
    RankUp => "RANK_UP",
    RankDown => "RANK_DOWN",
    ScanError => "SCAN_ERROR",
});

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub kind: AlertKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub scan_id: Uuid,
    pub kind: AlertKind,
    pub message: String,
}

/// Number of fields checked by [`BusinessEntry::completeness_score`].
const COMPLETENESS_CHECKS: u32 = 7;

/// One listing as it appeared on one results page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, Default)]
#[serde(default)]
pub struct BusinessEntry {
    pub name: String,
    pub rank: u32,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub address: Option<String>,
    pub category: Option<String>,
    pub secondary_categories: Vec<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    /// Numeric customer id, kept as text since it overflows i64 on some listings.
    pub cid: Option<String>,
    pub place_id: Option<String>,
    /// Service-area business: serves a region without a public storefront.
    pub is_sab: bool,
    pub profile_completeness: u8,
}

impl BusinessEntry {
    pub fn new(name: impl Into<String>, rank: u32) -> Self {
        Self {
            name: name.into(),
            rank,
            ..Default::default()
        }
    }

    /// Percentage of the optional listing fields that are populated.
    /// A service-area business satisfies the address check without one.
    pub fn completeness_score(&self) -> u8 {
        let present = |o: &Option<String>| o.as_deref().is_some_and(|s| !s.trim().is_empty());
        let checks = [
            !self.name.trim().is_empty(),
            present(&self.address) || self.is_sab,
            present(&self.phone),
            present(&self.website),
            present(&self.category),
            self.rating.is_some(),
            self.review_count.unwrap_or(0) > 0,
        ];
        let hits = checks.iter().filter(|c| **c).count() as u32;
        ((hits * 100) as f64 / COMPLETENESS_CHECKS as f64).round() as u8
    }

    pub fn with_completeness(mut self) -> Self {
        self.profile_completeness = self.completeness_score();
        self
    }

    /// Primary category followed by the secondary ones, without duplicates.
    pub fn all_categories(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in self.category.iter().chain(self.secondary_categories.iter()) {
            let c = c.trim();
            if !c.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(c)) {
                out.push(c.to_string());
            }
        }
        out
    }
}

/// Fields read off a single business page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, Default)]
pub struct BusinessDetail {
    pub name: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}
