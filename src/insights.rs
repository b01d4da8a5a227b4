//! Competitive intelligence derived from a scan's stored snapshots.
//!
//! Everything here is a pure function of the results passed in. Snapshots are
//! only read; profiles are rebuilt from scratch on every call, so the same
//! input always yields the same output.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{BusinessEntry, Scan, ScanResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    High,
    Medium,
    Low,
}

impl ThreatLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            70.. => ThreatLevel::High,
            40.. => ThreatLevel::Medium,
            _ => ThreatLevel::Low,
        }
    }
}

/// Everything known about one competitor across a scan.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CompetitorProfile {
    pub name: String,
    pub appearances: u32,
    pub avg_rank: f64,
    pub best_rank: u32,
    pub worst_rank: u32,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub address: Option<String>,
    pub category: Option<String>,
    pub secondary_categories: Vec<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub cid: Option<String>,
    pub place_id: Option<String>,
    pub is_sab: bool,
    pub profile_completeness: u8,
    pub threat_score: u8,
    pub threat_level: ThreatLevel,
}

fn overwrite(slot: &mut Option<String>, seen: &Option<String>) {
    if let Some(v) = seen.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        *slot = Some(v.to_string());
    }
}

impl CompetitorProfile {
    fn first_seen(entry: &BusinessEntry) -> Self {
        let mut profile = Self {
            name: entry.name.trim().to_string(),
            appearances: 0,
            avg_rank: 0.0,
            best_rank: entry.rank,
            worst_rank: entry.rank,
            rating: None,
            review_count: None,
            address: None,
            category: None,
            secondary_categories: Vec::new(),
            phone: None,
            website: None,
            cid: None,
            place_id: None,
            is_sab: entry.is_sab,
            profile_completeness: 0,
            threat_score: 0,
            threat_level: ThreatLevel::Low,
        };
        profile.observe(entry);
        profile
    }

    fn observe(&mut self, entry: &BusinessEntry) {
        self.appearances += 1;
        let n = self.appearances as f64;
        self.avg_rank = (self.avg_rank * (n - 1.0) + entry.rank as f64) / n;
        self.best_rank = self.best_rank.min(entry.rank);
        self.worst_rank = self.worst_rank.max(entry.rank);

        if entry.rating.is_some() {
            self.rating = entry.rating;
        }
        if entry.review_count.is_some() {
            self.review_count = entry.review_count;
        }
        overwrite(&mut self.address, &entry.address);
        overwrite(&mut self.category, &entry.category);
        overwrite(&mut self.phone, &entry.phone);
        overwrite(&mut self.website, &entry.website);
        overwrite(&mut self.cid, &entry.cid);
        overwrite(&mut self.place_id, &entry.place_id);
        if !entry.secondary_categories.is_empty() {
            self.secondary_categories = entry.secondary_categories.clone();
        }
        self.is_sab = self.address.is_none() && entry.is_sab;
        self.profile_completeness = self.as_entry().completeness_score();
    }

    fn as_entry(&self) -> BusinessEntry {
        BusinessEntry {
            name: self.name.clone(),
            rank: self.best_rank,
            rating: self.rating,
            review_count: self.review_count,
            address: self.address.clone(),
            category: self.category.clone(),
            secondary_categories: self.secondary_categories.clone(),
            phone: self.phone.clone(),
            website: self.website.clone(),
            cid: self.cid.clone(),
            place_id: self.place_id.clone(),
            is_sab: self.is_sab,
            profile_completeness: self.profile_completeness,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CategoryStat {
    pub category: String,
    /// Listing appearances carrying this category.
    pub appearances: u32,
    /// Distinct businesses carrying this category.
    pub businesses: u32,
    pub avg_rating: Option<f64>,
    pub avg_reviews: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RatingBucket {
    /// Lower bound of the bucket: ratings in `[floor, floor + 1)`, 5 holds exactly 5.0.
    pub floor: u8,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RatingHistogram {
    pub buckets: Vec<RatingBucket>,
    pub no_rating: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema, Default)]
pub struct ReviewStats {
    pub total: u64,
    pub max: u32,
    pub min: u32,
    pub average: f64,
    pub zero_reviews: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema, Default)]
pub struct ProfileMetrics {
    pub unique_businesses: u32,
    pub avg_completeness: f64,
    pub with_phone: u32,
    pub with_website: u32,
    pub with_address: u32,
    pub physical_locations: u32,
    pub service_area: u32,
}

/// How the configured target fared across the scan.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TargetSummary {
    pub name: String,
    pub found_points: u32,
    pub total_points: u32,
    pub avg_rank: Option<f64>,
    pub best_rank: Option<u32>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub profile_completeness: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Recommendation {
    pub code: String,
    pub priority: Priority,
    pub title: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MarketInsights {
    pub total_points: u32,
    pub points_with_results: u32,
    pub avg_competitors_per_point: f64,
    pub market_saturation: u8,
    pub competitors: Vec<CompetitorProfile>,
    pub categories: Vec<CategoryStat>,
    pub rating_histogram: RatingHistogram,
    pub review_stats: ReviewStats,
    pub profile_metrics: ProfileMetrics,
    pub target: Option<TargetSummary>,
    pub recommendations: Vec<Recommendation>,
}

/// Case-insensitive containment of the target name in a listing name.
pub fn matches_target(name: &str, target: &str) -> bool {
    let target = target.trim();
    !target.is_empty() && name.to_lowercase().contains(&target.to_lowercase())
}

fn identity(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Mean target rank over all points, charging `penalty` where it was absent.
/// `None` when there are no points.
pub fn average_rank(results: &[ScanResult], penalty: f64) -> Option<f64> {
    if results.is_empty() {
        return None;
    }
    let sum: f64 = results
        .iter()
        .map(|r| r.rank.map(f64::from).unwrap_or(penalty))
        .sum();
    Some(sum / results.len() as f64)
}

fn rank_weight(avg_rank: f64) -> f64 {
    match avg_rank {
        r if r <= 3.0 => 1.0,
        r if r <= 5.0 => 0.75,
        r if r <= 10.0 => 0.5,
        r if r <= 15.0 => 0.25,
        _ => 0.0,
    }
}

fn review_weight(reviews: Option<u32>) -> f64 {
    match reviews.unwrap_or(0) {
        500.. => 1.0,
        200.. => 0.75,
        100.. => 0.5,
        50.. => 0.25,
        _ => 0.0,
    }
}

fn rating_weight(rating: Option<f64>) -> f64 {
    match rating {
        Some(r) if r >= 4.8 => 1.0,
        Some(r) if r >= 4.5 => 0.75,
        Some(r) if r >= 4.0 => 0.5,
        Some(r) if r >= 3.5 => 0.25,
        _ => 0.0,
    }
}

/// 0-100 danger score of one competitor.
pub fn threat_score(
    avg_rank: f64,
    review_count: Option<u32>,
    rating: Option<f64>,
    appearances: u32,
    total_points: u32,
) -> u8 {
    let presence = if total_points == 0 {
        0.0
    } else {
        (appearances as f64 / total_points as f64).min(1.0)
    };
    let score = 40.0 * rank_weight(avg_rank)
        + 25.0 * review_weight(review_count)
        + 15.0 * rating_weight(rating)
        + 20.0 * presence;
    score.round().clamp(0.0, 100.0) as u8
}

/// 0-100 crowding score from the number of distinct competitors.
pub fn market_saturation(unique_competitors: usize, avg_competitors_per_point: f64) -> u8 {
    let base: u32 = match unique_competitors {
        50.. => 90,
        30.. => 70,
        15.. => 50,
        8.. => 30,
        _ => 15,
    };
    let bumped = if avg_competitors_per_point > 15.0 { base + 10 } else { base };
    bumped.min(100) as u8
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0u32), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn by_float(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[derive(Default)]
struct CategoryAcc {
    label: String,
    appearances: u32,
    businesses: BTreeSet<String>,
}

/// Build competitor profiles and market metrics for one scan.
pub fn analyze(results: &[ScanResult], target: Option<&str>, missing_rank_penalty: f64) -> MarketInsights {
    let target = target.map(str::trim).filter(|t| !t.is_empty());
    let is_target = |name: &str| target.is_some_and(|t| matches_target(name, t));

    let total_points = results.len() as u32;
    let mut profiles: HashMap<String, CompetitorProfile> = HashMap::new();
    let mut categories: BTreeMap<String, CategoryAcc> = BTreeMap::new();
    let mut competitors_per_point = Vec::with_capacity(results.len());
    let mut target_entry: Option<BusinessEntry> = None;

    for result in results {
        let mut on_point = 0u32;
        for entry in &result.top_results {
            if entry.name.trim().is_empty() {
                continue;
            }
            if is_target(&entry.name) {
                target_entry = Some(entry.clone());
                continue;
            }
            on_point += 1;

            let key = identity(&entry.name);
            profiles
                .entry(key.clone())
                .and_modify(|p| p.observe(entry))
                .or_insert_with(|| CompetitorProfile::first_seen(entry));

            for category in entry.all_categories() {
                let acc = categories.entry(category.to_lowercase()).or_insert_with(|| CategoryAcc {
                    label: category.clone(),
                    ..Default::default()
                });
                acc.appearances += 1;
                acc.businesses.insert(key.clone());
            }
        }
        competitors_per_point.push(on_point as f64);
    }

    for profile in profiles.values_mut() {
        profile.threat_score = threat_score(
            profile.avg_rank,
            profile.review_count,
            profile.rating,
            profile.appearances,
            total_points,
        );
        profile.threat_level = ThreatLevel::from_score(profile.threat_score);
    }

    let mut competitors: Vec<CompetitorProfile> = profiles.into_values().collect();
    competitors.sort_by(|a, b| {
        b.appearances
            .cmp(&a.appearances)
            .then_with(|| by_float(a.avg_rank, b.avg_rank))
            .then_with(|| a.name.cmp(&b.name))
    });

    let lookup: HashMap<String, &CompetitorProfile> =
        competitors.iter().map(|p| (identity(&p.name), p)).collect();

    let mut category_stats: Vec<CategoryStat> = categories
        .into_values()
        .map(|acc| {
            let members: Vec<&CompetitorProfile> =
                acc.businesses.iter().filter_map(|k| lookup.get(k).copied()).collect();
            CategoryStat {
                category: acc.label,
                appearances: acc.appearances,
                businesses: acc.businesses.len() as u32,
                avg_rating: mean(members.iter().filter_map(|p| p.rating)),
                avg_reviews: mean(members.iter().filter_map(|p| p.review_count.map(f64::from))),
            }
        })
        .collect();
    category_stats.sort_by(|a, b| {
        b.businesses
            .cmp(&a.businesses)
            .then_with(|| b.appearances.cmp(&a.appearances))
            .then_with(|| a.category.cmp(&b.category))
    });

    let avg_per_point = mean(competitors_per_point.into_iter()).unwrap_or(0.0);
    let saturation = market_saturation(competitors.len(), avg_per_point);
    let target_summary = target.map(|name| summarize_target(name, results, target_entry.as_ref(), missing_rank_penalty));
    let review_stats = review_stats(&competitors);
    let recommendations = recommend(target_summary.as_ref(), &competitors, saturation);

    MarketInsights {
        total_points,
        points_with_results: results.iter().filter(|r| !r.top_results.is_empty()).count() as u32,
        avg_competitors_per_point: avg_per_point,
        market_saturation: saturation,
        rating_histogram: rating_histogram(&competitors),
        profile_metrics: profile_metrics(&competitors),
        review_stats,
        categories: category_stats,
        competitors,
        target: target_summary,
        recommendations,
    }
}

fn rating_histogram(profiles: &[CompetitorProfile]) -> RatingHistogram {
    let mut counts = [0u32; 6];
    let mut no_rating = 0;
    for p in profiles {
        match p.rating {
            Some(r) => counts[(r.floor().clamp(0.0, 5.0)) as usize] += 1,
            None => no_rating += 1,
        }
    }
    RatingHistogram {
        buckets: counts
            .iter()
            .enumerate()
            .map(|(floor, count)| RatingBucket {
                floor: floor as u8,
                count: *count,
            })
            .collect(),
        no_rating,
    }
}

fn review_stats(profiles: &[CompetitorProfile]) -> ReviewStats {
    if profiles.is_empty() {
        return ReviewStats::default();
    }
    let counts: Vec<u32> = profiles.iter().map(|p| p.review_count.unwrap_or(0)).collect();
    let total: u64 = counts.iter().map(|c| *c as u64).sum();
    ReviewStats {
        total,
        max: counts.iter().copied().max().unwrap_or(0),
        min: counts.iter().copied().min().unwrap_or(0),
        average: total as f64 / counts.len() as f64,
        zero_reviews: counts.iter().filter(|c| **c == 0).count() as u32,
    }
}

fn profile_metrics(profiles: &[CompetitorProfile]) -> ProfileMetrics {
    let count = |f: &dyn Fn(&CompetitorProfile) -> bool| profiles.iter().filter(|p| f(p)).count() as u32;
    ProfileMetrics {
        unique_businesses: profiles.len() as u32,
        avg_completeness: mean(profiles.iter().map(|p| p.profile_completeness as f64)).unwrap_or(0.0),
        with_phone: count(&|p| p.phone.is_some()),
        with_website: count(&|p| p.website.is_some()),
        with_address: count(&|p| p.address.is_some()),
        physical_locations: count(&|p| !p.is_sab),
        service_area: count(&|p| p.is_sab),
    }
}

fn summarize_target(
    name: &str,
    results: &[ScanResult],
    latest: Option<&BusinessEntry>,
    penalty: f64,
) -> TargetSummary {
    let found: Vec<u32> = results.iter().filter_map(|r| r.rank).collect();
    TargetSummary {
        name: latest.map(|e| e.name.clone()).unwrap_or_else(|| name.to_string()),
        found_points: found.len() as u32,
        total_points: results.len() as u32,
        avg_rank: average_rank(results, penalty),
        best_rank: found.iter().copied().min(),
        rating: latest.and_then(|e| e.rating),
        review_count: latest.and_then(|e| e.review_count),
        profile_completeness: latest.map(|e| e.completeness_score()),
    }
}

fn recommend(
    target: Option<&TargetSummary>,
    competitors: &[CompetitorProfile],
    saturation: u8,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let mut push = |code: &str, priority: Priority, title: &str, detail: String| {
        out.push(Recommendation {
            code: code.to_string(),
            priority,
            title: title.to_string(),
            detail,
        })
    };

    if let Some(t) = target {
        if t.found_points == 0 {
            push(
                "not_ranking",
                Priority::High,
                "Not ranking in the scanned area",
                format!("{} did not appear in the top results at any of {} points", t.name, t.total_points),
            );
        }
        if let Some(completeness) = t.profile_completeness.filter(|c| *c < 70) {
            push(
                "complete_profile",
                Priority::High,
                "Complete your business profile",
                format!("Profile is {completeness}% complete; add phone, website, category and hours"),
            );
        }
        let competitor_reviews = mean(competitors.iter().filter_map(|c| c.review_count.map(f64::from)));
        if let (Some(own), Some(avg)) = (t.review_count, competitor_reviews) {
            if (own as f64) < avg * 0.5 {
                push(
                    "increase_reviews",
                    Priority::High,
                    "Increase review volume",
                    format!("{own} reviews against a competitor average of {avg:.0}"),
                );
            }
        }
        if let Some(rating) = t.rating.filter(|r| *r < 4.5) {
            push(
                "improve_rating",
                Priority::Medium,
                "Improve your rating",
                format!("Rating {rating:.1} is below the 4.5 that top listings typically hold"),
            );
        }
    }

    if saturation > 70 {
        push(
            "hyper_local_targeting",
            Priority::Medium,
            "Use hyper-local targeting",
            format!("Market saturation is {saturation}; focus on neighbourhood-level keywords and pages"),
        );
    }

    let high_threats = competitors.iter().filter(|c| c.threat_level == ThreatLevel::High).count();
    if high_threats > 0 {
        push(
            "watch_top_competitors",
            Priority::Low,
            "Watch the strongest competitors",
            format!("{high_threats} competitors carry a HIGH threat level"),
        );
    }

    out.sort_by_key(|r| r.priority);
    out
}

/// Per-scan summary of the target's rank over time.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RankHistoryPoint {
    pub scan_id: Uuid,
    pub scanned_at: DateTime<Utc>,
    pub avg_rank: Option<f64>,
    pub found_points: u32,
    pub total_points: u32,
    /// Share of points where the target ranked in the top 3.
    pub top3_share: f64,
}

/// One entry per scan, in the order given (oldest first from the store).
pub fn rank_history(series: &[(Scan, Vec<ScanResult>)], penalty: f64) -> Vec<RankHistoryPoint> {
    series
        .iter()
        .map(|(scan, results)| {
            let total = results.len() as u32;
            let found = results.iter().filter(|r| r.rank.is_some()).count() as u32;
            let top3 = results.iter().filter(|r| r.rank.is_some_and(|k| k <= 3)).count();
            RankHistoryPoint {
                scan_id: scan.id,
                scanned_at: scan.created_at,
                avg_rank: average_rank(results, penalty),
                found_points: found,
                total_points: total,
                top3_share: if total == 0 { 0.0 } else { top3 as f64 / total as f64 },
            }
        })
        .collect()
}
