//! Place-name lookups against a Nominatim-compatible geocoder.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{CrawlerError, Result};
use crate::models::{Coordinate, SamplePoint};

const USER_AGENT: &str = concat!("geo-rank-crawler/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    boundingbox: Vec<String>,
}

impl NominatimPlace {
    fn coordinate(&self) -> Option<Coordinate> {
        let lat = self.lat.trim().parse().ok()?;
        let lng = self.lon.trim().parse().ok()?;
        Some(Coordinate::new(lat, lng))
    }

    /// Rough radius of the bounding box, half its larger side.
    fn extent_km(&self) -> Option<f64> {
        let b: Vec<f64> = self.boundingbox.iter().filter_map(|v| v.parse().ok()).collect();
        let [min_lat, max_lat, min_lng, max_lng] = b[..] else {
            return None;
        };
        let mid_lat = ((min_lat + max_lat) / 2.0).to_radians();
        let height = (max_lat - min_lat) * crate::grid::KM_PER_DEGREE;
        let width = (max_lng - min_lng) * crate::grid::KM_PER_DEGREE * mid_lat.cos();
        Some(height.max(width) / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct GeoMatch {
    pub display_name: String,
    pub center: Coordinate,
    pub extent_km: Option<f64>,
}

pub struct Geocoder {
    client: reqwest::Client,
    base_url: String,
}

impl Geocoder {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<NominatimPlace>> {
        let resp = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json"), ("limit", &limit.to_string())])
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Best match for a free-text place name.
    pub async fn lookup(&self, place: &str) -> Result<GeoMatch> {
        let place = place.trim();
        if place.is_empty() {
            return Err(CrawlerError::InvalidInput("place name is empty".into()));
        }
        let best = self
            .search(place, 1)
            .await?
            .into_iter()
            .find_map(|p| {
                let center = p.coordinate()?;
                Some(GeoMatch {
                    extent_km: p.extent_km(),
                    display_name: p.display_name,
                    center,
                })
            })
            .ok_or_else(|| CrawlerError::not_found("place", place))?;
        tracing::debug!("geocoded {:?} -> {:?}", place, best.center);
        Ok(best)
    }

    /// Centres of the suburbs inside `place`, as sample points `city-0..`.
    pub async fn sub_region_points(&self, place: &str, limit: usize) -> Result<Vec<SamplePoint>> {
        let places = self.search(&format!("suburbs in {}", place.trim()), limit).await?;
        let mut points: Vec<SamplePoint> = Vec::new();
        for coord in places.iter().filter_map(NominatimPlace::coordinate) {
            let duplicate = points
                .iter()
                .any(|p| (p.lat - coord.lat).abs() < 1e-6 && (p.lng - coord.lng).abs() < 1e-6);
            if !duplicate {
                points.push(SamplePoint::new(format!("city-{}", points.len()), coord.lat, coord.lng));
            }
        }
        Ok(points)
    }
}
