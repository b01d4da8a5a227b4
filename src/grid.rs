//! Sample-point generation for a scan area.
//!
//! Distances are converted with an equirectangular approximation
//! (`111.111 km` per degree of latitude, scaled by `cos(lat)` for longitude),
//! which is accurate enough at city scale.

use std::f64::consts::PI;

use rand::Rng;

use crate::models::{Coordinate, GridShape, SamplePoint, Scan};

pub const KM_PER_DEGREE: f64 = 111.111;

/// Ring distances (km) of the variable-density layout at its 3 km reference radius.
const SMART_RING_DISTANCES: [f64; 7] = [0.15, 0.4, 0.8, 1.5, 3.0, 6.0, 12.0];
/// Spacing (km) between neighbouring points on each of those rings.
const SMART_RING_SPACINGS: [f64; 7] = [0.1, 0.2, 0.35, 0.6, 1.0, 2.0, 4.0];
const SMART_REFERENCE_RADIUS_KM: f64 = 3.0;

const SECTOR_COUNT: usize = 4;
const SECTOR_OFFSET_RATIO: f64 = 0.6;
const SECTOR_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub center: Coordinate,
    pub radius_km: f64,
    /// Density N. Lattice yields N×N points; ring layouts use N/2 rings.
    pub size: u32,
    pub shape: GridShape,
}

impl GridSpec {
    pub fn for_scan(scan: &Scan) -> Self {
        Self {
            center: scan.center(),
            radius_km: scan.radius_km,
            size: scan.grid_size,
            shape: scan.shape,
        }
    }
}

/// Points the orchestrator visits for `scan`: the caller's explicit list when
/// one was supplied, otherwise a generated grid.
pub fn points_for_scan<R: Rng + ?Sized>(scan: &Scan, rng: &mut R) -> Vec<SamplePoint> {
    match &scan.custom_points {
        Some(points) if !points.is_empty() => points.clone(),
        _ => generate(&GridSpec::for_scan(scan), rng),
    }
}

/// Generate the ordered point list for `spec`. Never returns an empty list.
///
/// Only [`GridShape::SectorJitter`] draws from `rng`.
pub fn generate<R: Rng + ?Sized>(spec: &GridSpec, rng: &mut R) -> Vec<SamplePoint> {
    let size = spec.size.max(1);
    let radius = spec.radius_km.max(0.0);
    match spec.shape {
        GridShape::Lattice => lattice(spec.center, radius, size),
        GridShape::ConcentricRing => concentric_rings(spec.center, radius, size),
        GridShape::SectorJitter => sector_jitter(spec.center, radius, size, rng),
        GridShape::VariableDensityRing => variable_density_rings(spec.center, radius),
    }
}

/// Shift `origin` by `east_km` / `north_km`.
pub fn offset_km(origin: Coordinate, east_km: f64, north_km: f64) -> Coordinate {
    let dlat = north_km / KM_PER_DEGREE;
    let dlng = east_km / (KM_PER_DEGREE * origin.lat.to_radians().cos());
    Coordinate::new(origin.lat + dlat, origin.lng + dlng)
}

/// Point at `distance_km` from `origin` along `bearing` (radians, 0 = north, clockwise).
fn polar_offset(origin: Coordinate, distance_km: f64, bearing: f64) -> Coordinate {
    offset_km(origin, distance_km * bearing.sin(), distance_km * bearing.cos())
}

fn lattice(center: Coordinate, radius: f64, size: u32) -> Vec<SamplePoint> {
    if size == 1 {
        return vec![SamplePoint::new("grid-0-0", center.lat, center.lng)];
    }
    let lat_span = radius / KM_PER_DEGREE;
    let lng_span = radius / (KM_PER_DEGREE * center.lat.to_radians().cos());
    let steps = (size - 1) as f64;

    let mut points = Vec::with_capacity((size * size) as usize);
    for row in 0..size {
        // north to south
        let lat = center.lat + lat_span - 2.0 * lat_span * row as f64 / steps;
        for col in 0..size {
            let lng = center.lng - lng_span + 2.0 * lng_span * col as f64 / steps;
            points.push(SamplePoint::new(format!("grid-{row}-{col}"), lat, lng));
        }
    }
    points
}

fn concentric_rings(center: Coordinate, radius: f64, size: u32) -> Vec<SamplePoint> {
    let rings = size / 2;
    let mut points = vec![SamplePoint::new("ring-center", center.lat, center.lng)];
    for r in 1..=rings {
        let ring_radius = radius * r as f64 / rings as f64;
        let count = 6 * r;
        for i in 0..count {
            let bearing = 2.0 * PI * i as f64 / count as f64;
            let c = polar_offset(center, ring_radius, bearing);
            points.push(SamplePoint::new(format!("ring-{r}-{i}"), c.lat, c.lng));
        }
    }
    points
}

fn sector_jitter<R: Rng + ?Sized>(center: Coordinate, radius: f64, size: u32, rng: &mut R) -> Vec<SamplePoint> {
    let per_sector = ((size * size) as f64 / SECTOR_COUNT as f64).ceil() as usize;
    let jitter = radius * SECTOR_JITTER_RATIO;

    let mut points = Vec::with_capacity(per_sector * SECTOR_COUNT);
    for sector in 0..SECTOR_COUNT {
        let bearing = (PI / 4.0) + (PI / 2.0) * sector as f64;
        let sector_center = polar_offset(center, radius * SECTOR_OFFSET_RATIO, bearing);
        for i in 0..per_sector {
            let (east, north) = if jitter > 0.0 {
                (rng.gen_range(-jitter..=jitter), rng.gen_range(-jitter..=jitter))
            } else {
                (0.0, 0.0)
            };
            let c = offset_km(sector_center, east, north);
            points.push(SamplePoint::new(format!("zip-{sector}-{i}"), c.lat, c.lng));
        }
    }
    points
}

fn variable_density_rings(center: Coordinate, radius: f64) -> Vec<SamplePoint> {
    let scale = radius / SMART_REFERENCE_RADIUS_KM;
    let mut points = vec![SamplePoint::new("smart-center", center.lat, center.lng)];

    for (ring, (&distance, &spacing)) in SMART_RING_DISTANCES
        .iter()
        .zip(SMART_RING_SPACINGS.iter())
        .enumerate()
    {
        let distance = distance * scale;
        let spacing = spacing * scale;
        if ring >= 2 && distance > radius + 1e-9 {
            continue;
        }
        let count = if spacing > 0.0 {
            ((2.0 * PI * distance / spacing).floor() as usize).max(3)
        } else {
            3
        };
        for i in 0..count {
            let bearing = 2.0 * PI * i as f64 / count as f64;
            let c = polar_offset(center, distance, bearing);
            points.push(SamplePoint::new(format!("smart-{ring}-{i}"), c.lat, c.lng));
        }
    }
    points
}
