//! Turns rendered results pages into structured listings.
//!
//! Listing extraction works on the page HTML: a primary container selector,
//! then a link-based fallback. When the DOM yields nothing, the embedded data
//! blob can be read through the path candidates in `config/listing_paths.json`.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{CrawlerError, Result};
use crate::json_path::{self, JsonPath};
use crate::models::{BusinessDetail, BusinessEntry};

pub const MAX_LISTINGS: usize = 20;

static PRIMARY_CONTAINER: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"div[role="feed"] div[role="article"], div[role="article"]"#).unwrap());
static PLACE_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"a[href*="/maps/place/"]"#).unwrap());
static HEADING: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#".fontHeadlineSmall, [role="heading"], h1, h2, h3, .qBF1Pd"#).unwrap()
});
static LABELLED: Lazy<Selector> = Lazy::new(|| Selector::parse("[aria-label]").unwrap());
static WEBSITE_LINK: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"a[data-value="Website"], a[aria-label*="ebsite"], a[href^="http"]"#).unwrap()
});
static DETAIL_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static PAGE_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static DETAIL_ADDRESS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"button[data-item-id="address"], [data-item-id="address"], [aria-label^="Address"]"#).unwrap()
});

static STARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*stars?").unwrap());
static REVIEWS_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d[\d,.\s]*)\s*reviews?").unwrap());
static REVIEWS_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d[\d,.]*)\)").unwrap());
static RATING_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d(?:[.,]\d)?(?:\s*\(\d[\d,.]*\))?$").unwrap());
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[\d\s().-]{7,20}$").unwrap());
static STREET_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(st|street|ave|avenue|rd|road|blvd|boulevard|dr|drive|ln|lane|way|ct|court|pl|place|pkwy|parkway|hwy|highway|suite|ste|unit|sq|square|ter|terrace|cir|circle|plaza|route|rte)\b\.?",
    )
    .unwrap()
});
static STREET_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[A-Za-z]?\s+\p{L}").unwrap());
static HOURS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(open|opens|closed|closes|hours|am|pm)\b").unwrap()
});
static SERVICE_AREA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(serves|serving|service area|service-area business)\b").unwrap());
static COORDS_IN_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"@(-?\d+(?:\.\d+)?),(-?\d+(?:\.\d+)?)").unwrap());
static PLACE_ID_IN_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"!19s(ChIJ[\w-]+)").unwrap());
static FEATURE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+:0x([0-9a-fA-F]+)").unwrap());

/// Segments shown between listing fields on one line ("Plumber · 12 Main St").
const FIELD_SEPARATORS: &[char] = &['·', '•', '|'];

/// Extract up to [`MAX_LISTINGS`] listings from a rendered results page.
/// A page without listings yields an empty list.
pub fn extract_listings(html: &str) -> Vec<BusinessEntry> {
    let document = Html::parse_document(html);

    let mut containers: Vec<ElementRef> = document.select(&PRIMARY_CONTAINER).collect();
    if containers.is_empty() {
        containers = document
            .select(&PLACE_LINK)
            .filter_map(|link| link.parent().and_then(ElementRef::wrap))
            .collect();
    }

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for container in containers {
        if entries.len() >= MAX_LISTINGS {
            break;
        }
        let Some(mut entry) = parse_container(container) else {
            continue;
        };
        if !seen.insert(entry.name.to_lowercase()) {
            continue;
        }
        entry.rank = entries.len() as u32 + 1;
        entries.push(entry.with_completeness());
    }
    entries
}

fn clean(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn container_name(container: ElementRef) -> Option<String> {
    let from_label = container
        .value()
        .attr("aria-label")
        .or_else(|| {
            container
                .select(&PLACE_LINK)
                .next()
                .and_then(|a| a.value().attr("aria-label"))
        })
        .map(clean)
        .filter(|s| !s.is_empty() && !STARS.is_match(s));

    from_label.or_else(|| {
        container
            .select(&HEADING)
            .map(|h| clean(&h.text().collect::<String>()))
            .find(|s| !s.is_empty())
    })
}

fn parse_number(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Text fragments of the container, split on the in-line field separators.
fn text_segments(container: ElementRef) -> Vec<String> {
    container
        .text()
        .flat_map(|t| t.split(FIELD_SEPARATORS))
        .map(clean)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn looks_like_address(segment: &str, name: &str) -> bool {
    if segment.eq_ignore_ascii_case(name) || !segment.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    if PHONE.is_match(segment) || RATING_TEXT.is_match(segment) || HOURS.is_match(segment) {
        return false;
    }
    if STARS.is_match(segment) || REVIEWS_WORD.is_match(segment) {
        return false;
    }
    STREET_WORD.is_match(segment) || STREET_NUMBER.is_match(segment) || segment.contains(',')
}

/// Cards of service-area businesses say so ("Serves Springfield") where a
/// street address would go.
fn is_service_area_marker(segment: &str) -> bool {
    SERVICE_AREA.is_match(segment)
}

fn looks_like_category(segment: &str, name: &str) -> bool {
    segment.len() <= 40
        && !is_service_area_marker(segment)
        && !segment.eq_ignore_ascii_case(name)
        && segment.chars().all(|c| c.is_alphabetic() || c == ' ' || c == '&' || c == '-' || c == '\'')
        && !HOURS.is_match(segment)
        && !matches!(
            segment.to_lowercase().as_str(),
            "website" | "directions" | "call" | "share" | "save" | "sponsored" | "ad"
        )
}

fn parse_container(container: ElementRef) -> Option<BusinessEntry> {
    let name = container_name(container)?;

    let labels: Vec<String> = std::iter::once(container)
        .chain(container.select(&LABELLED))
        .filter_map(|el| el.value().attr("aria-label").map(clean))
        .collect();
    let segments = text_segments(container);

    let rating = labels
        .iter()
        .chain(segments.iter())
        .find_map(|s| STARS.captures(s))
        .and_then(|c| c[1].replace(',', ".").parse::<f64>().ok())
        .or_else(|| {
            segments
                .iter()
                .filter(|s| RATING_TEXT.is_match(s))
                .find_map(|s| s.get(..3).and_then(|r| r.replace(',', ".").parse::<f64>().ok()))
        })
        .filter(|r| (0.0..=5.0).contains(r));

    let review_count = labels
        .iter()
        .chain(segments.iter())
        .find_map(|s| REVIEWS_WORD.captures(s).and_then(|c| parse_number(&c[1])))
        .or_else(|| {
            segments
                .iter()
                .find_map(|s| REVIEWS_PAREN.captures(s).and_then(|c| parse_number(&c[1])))
        });

    let address = segments
        .iter()
        .find(|s| looks_like_address(s, &name))
        .cloned();

    let phone = segments
        .iter()
        .find(|s| PHONE.is_match(s) && s.chars().filter(|c| c.is_ascii_digit()).count() >= 7)
        .cloned();

    let mut categories: Vec<String> = segments
        .iter()
        .filter(|s| looks_like_category(s, &name))
        .cloned()
        .collect();
    categories.dedup();
    let category = if categories.is_empty() {
        None
    } else {
        Some(categories.remove(0))
    };

    let place_href = container
        .select(&PLACE_LINK)
        .next()
        .and_then(|a| a.value().attr("href"))
        .or_else(|| {
            container
                .value()
                .attr("href")
                .filter(|h| h.contains("/maps/place/"))
        });

    let website = container
        .select(&WEBSITE_LINK)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.starts_with("http") && !href.contains("google."))
        .map(str::to_string);

    let is_sab = address.is_none()
        && labels
            .iter()
            .chain(segments.iter())
            .any(|s| is_service_area_marker(s));
    Some(BusinessEntry {
        name,
        rank: 0,
        rating,
        review_count,
        address,
        category,
        secondary_categories: categories,
        phone,
        website,
        cid: place_href.and_then(cid_from_url),
        place_id: place_href.and_then(place_id_from_url),
        is_sab,
        profile_completeness: 0,
    })
}

/// Decimal customer id from the `0x…:0x…` feature id in a place URL or blob.
pub fn cid_from_url(url: &str) -> Option<String> {
    FEATURE_ID
        .captures(url)
        .and_then(|c| u64::from_str_radix(&c[1], 16).ok())
        .map(|v| v.to_string())
}

pub fn place_id_from_url(url: &str) -> Option<String> {
    PLACE_ID_IN_URL.captures(url).map(|c| c[1].to_string())
}

/// `@lat,lng` embedded in a page URL.
pub fn coordinates_from_url(url: &str) -> Option<(f64, f64)> {
    let caps = COORDS_IN_URL.captures(url)?;
    let lat: f64 = caps[1].parse().ok()?;
    let lng: f64 = caps[2].parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)).then_some((lat, lng))
}

/// Extract name, address and coordinates from a single business page.
pub fn extract_detail(html: &str, page_url: &str) -> BusinessDetail {
    let document = Html::parse_document(html);

    let name = document
        .select(&DETAIL_TITLE)
        .map(|h| clean(&h.text().collect::<String>()))
        .find(|s| !s.is_empty())
        .or_else(|| {
            document.select(&PAGE_TITLE).next().and_then(|t| {
                let title = clean(&t.text().collect::<String>());
                let title = title
                    .split(" - Google Maps")
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                (!title.is_empty()).then_some(title)
            })
        });

    let address = document.select(&DETAIL_ADDRESS).find_map(|el| {
        let text = el
            .value()
            .attr("aria-label")
            .map(|l| l.trim_start_matches("Address:").to_string())
            .unwrap_or_else(|| el.text().collect::<String>());
        let text = clean(&text);
        (!text.is_empty()).then_some(text)
    });

    let (lat, lng) = match coordinates_from_url(page_url) {
        Some((lat, lng)) => (Some(lat), Some(lng)),
        None => (None, None),
    };

    BusinessDetail {
        name,
        address,
        lat,
        lng,
    }
}

/// Versioned path candidates for the embedded results blob.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingPaths {
    pub version: String,
    pub listings: Vec<JsonPath>,
    pub record: Vec<JsonPath>,
    pub name: Vec<JsonPath>,
    pub rating: Vec<JsonPath>,
    pub review_count: Vec<JsonPath>,
    pub address: Vec<JsonPath>,
    pub category: Vec<JsonPath>,
    pub categories: Vec<JsonPath>,
    pub phone: Vec<JsonPath>,
    pub website: Vec<JsonPath>,
    pub place_id: Vec<JsonPath>,
    pub cid: Vec<JsonPath>,
    /// Non-empty when the record describes a service area instead of a storefront.
    #[serde(default)]
    pub service_area: Vec<JsonPath>,
}

static BUILTIN_PATHS: Lazy<std::result::Result<ListingPaths, String>> = Lazy::new(|| {
    serde_json::from_str(include_str!("../config/listing_paths.json")).map_err(|e| e.to_string())
});

impl ListingPaths {
    pub fn builtin() -> Result<&'static ListingPaths> {
        BUILTIN_PATHS
            .as_ref()
            .map_err(|e| CrawlerError::Extraction(format!("listing path config: {e}")))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Parse the raw blob text, tolerating the `)]}'` anti-hijacking prefix.
pub fn parse_blob(raw: &str) -> Result<Value> {
    let trimmed = raw.trim_start();
    let body = trimmed.strip_prefix(")]}'").unwrap_or(trimmed);
    Ok(serde_json::from_str(body.trim_start())?)
}

/// Listings read from the embedded data blob.
pub fn extract_from_blob(blob: &Value, paths: &ListingPaths) -> Vec<BusinessEntry> {
    let Some(items) = json_path::first_non_empty(blob, &paths.listings).and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for item in items {
        if entries.len() >= MAX_LISTINGS {
            break;
        }
        let Some(record) = json_path::first_non_empty(item, &paths.record) else {
            continue;
        };
        let Some(name) = json_path::first_str(record, &paths.name) else {
            continue;
        };
        if !seen.insert(name.to_lowercase()) {
            continue;
        }

        let mut categories = json_path::first_str_list(record, &paths.categories);
        let category = json_path::first_str(record, &paths.category).or_else(|| {
            (!categories.is_empty()).then(|| categories[0].clone())
        });
        if let Some(primary) = &category {
            categories.retain(|c| !c.eq_ignore_ascii_case(primary));
        }

        let address = json_path::first_str(record, &paths.address);
        let cid = json_path::first_str(record, &paths.cid)
            .map(|raw| cid_from_url(&raw).unwrap_or(raw));

        let entry = BusinessEntry {
            rank: entries.len() as u32 + 1,
            rating: json_path::first_f64(record, &paths.rating).filter(|r| (0.0..=5.0).contains(r)),
            review_count: json_path::first_u64(record, &paths.review_count).map(|n| n.min(u32::MAX as u64) as u32),
            is_sab: address.is_none() && json_path::first_non_empty(record, &paths.service_area).is_some(),
            address,
            category,
            secondary_categories: categories,
            phone: json_path::first_str(record, &paths.phone),
            website: json_path::first_str(record, &paths.website),
            place_id: json_path::first_str(record, &paths.place_id),
            cid,
            name,
            profile_completeness: 0,
        };
        entries.push(entry.with_completeness());
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RESULTS_PAGE: &str = r#"
    <html><body>
      <div role="feed">
        <div role="article" aria-label="Joe's Plumbing">
          <a href="https://www.google.com/maps/place/Joe's+Plumbing/data=!4m7!3m6!1s0x89c25a:0x1a2b!8m2!3d40.7!4d-74.0!19sChIJabc123"></a>
          <div class="fontHeadlineSmall">Joe's Plumbing</div>
          <span role="img" aria-label="4.8 stars 120 Reviews"></span>
          <div><span>Plumber</span> · <span>123 Main St, Springfield</span></div>
          <div><span>Open 24 hours</span> · <span>(555) 123-4567</span></div>
          <a data-value="Website" href="https://joesplumbing.test/"></a>
        </div>
        <div role="article" aria-label="Ace Drain Co">
          <span role="img" aria-label="4.1 stars"></span><span>(37)</span>
          <div>Drainage service · Serves Springfield · Closed · Opens 8 AM</div>
        </div>
        <div role="article" aria-label="JOE'S PLUMBING">
          <span>duplicate by case</span>
        </div>
        <div role="article">
          <div class="fontHeadlineSmall">Heading Only Heating</div>
          <div>HVAC contractor · 45 Elm Avenue</div>
        </div>
      </div>
    </body></html>"#;

    #[test]
    fn primary_containers_yield_ranked_deduplicated_listings() {
        let entries = extract_listings(RESULTS_PAGE);
        assert_eq!(entries.len(), 3);

        let joe = &entries[0];
        assert_eq!(joe.name, "Joe's Plumbing");
        assert_eq!(joe.rank, 1);
        assert_eq!(joe.rating, Some(4.8));
        assert_eq!(joe.review_count, Some(120));
        assert_eq!(joe.address.as_deref(), Some("123 Main St, Springfield"));
        assert_eq!(joe.category.as_deref(), Some("Plumber"));
        assert_eq!(joe.phone.as_deref(), Some("(555) 123-4567"));
        assert_eq!(joe.website.as_deref(), Some("https://joesplumbing.test/"));
        assert_eq!(joe.place_id.as_deref(), Some("ChIJabc123"));
        assert_eq!(joe.cid.as_deref(), Some("6699"));
        assert!(!joe.is_sab);
        assert_eq!(joe.profile_completeness, 100);

        let ace = &entries[1];
        assert_eq!(ace.rank, 2);
        assert_eq!(ace.rating, Some(4.1));
        assert_eq!(ace.review_count, Some(37));
        assert_eq!(ace.address, None);
        assert!(ace.is_sab);
        assert_eq!(ace.category.as_deref(), Some("Drainage service"));
        assert!(ace.secondary_categories.is_empty());

        let heading = &entries[2];
        assert_eq!(heading.name, "Heading Only Heating");
        assert!(!heading.is_sab);
        assert_eq!(heading.rank, 3);
        assert_eq!(heading.address.as_deref(), Some("45 Elm Avenue"));
    }

    #[test]
    fn link_fallback_is_used_when_no_articles() {
        let html = r#"<div>
            <div><a href="/maps/place/Blue+Bakery/@1,2" aria-label="Blue Bakery"></a><span>Bakery</span><span>9 Baker St</span></div>
            <div><a href="/maps/place/Red+Cafe/@1,2" aria-label="Red Cafe"></a><span>4.5 stars</span></div>
        </div>"#;
        let entries = extract_listings(html);
        assert_eq!(entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["Blue Bakery", "Red Cafe"]);
        assert_eq!(entries[0].address.as_deref(), Some("9 Baker St"));
        assert_eq!(entries[1].rating, Some(4.5));
    }

    #[test]
    fn missing_address_alone_is_not_a_service_area() {
        let html = r#"<div role="feed">
            <div role="article" aria-label="Pipe Pros">
              <div>Plumber · (555) 222-0101</div>
            </div>
        </div>"#;
        let entries = extract_listings(html);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, None);
        assert!(!entries[0].is_sab);
        // name, phone, category of seven
        assert_eq!(entries[0].profile_completeness, 43);
    }

    #[test]
    fn empty_page_yields_no_listings() {
        assert!(extract_listings("<html><body><p>No results</p></body></html>").is_empty());
        assert!(extract_listings("").is_empty());
    }

    #[test]
    fn listing_cap_is_twenty() {
        let mut html = String::from(r#"<div role="feed">"#);
        for i in 0..30 {
            html.push_str(&format!(r#"<div role="article" aria-label="Biz {i}"></div>"#));
        }
        html.push_str("</div>");
        let entries = extract_listings(&html);
        assert_eq!(entries.len(), MAX_LISTINGS);
        assert_eq!(entries.last().unwrap().rank, 20);
    }

    #[test]
    fn address_heuristic_rejects_name_phone_and_hours() {
        assert!(looks_like_address("1600 Amphitheatre Pkwy", "Google"));
        assert!(looks_like_address("Unit 4, 22 Harbour Rd", "X"));
        assert!(!looks_like_address("7-Eleven", "7-Eleven"));
        assert!(!looks_like_address("(555) 123-4567", "X"));
        assert!(!looks_like_address("Closes 9 PM", "X"));
        assert!(!looks_like_address("4.5(210)", "X"));
        assert!(!looks_like_address("Main Street Diner", "X"));
    }

    #[test]
    fn detail_page_uses_url_coordinates_and_title_fallback() {
        let html = r#"<html><head><title>Blue Bakery - Google Maps</title></head>
            <body><button data-item-id="address" aria-label="Address: 9 Baker St, London"></button></body></html>"#;
        let detail = extract_detail(html, "https://www.google.com/maps/place/Blue+Bakery/@51.5237,-0.1585,17z");
        assert_eq!(detail.name.as_deref(), Some("Blue Bakery"));
        assert_eq!(detail.address.as_deref(), Some("9 Baker St, London"));
        assert_eq!(detail.lat, Some(51.5237));
        assert_eq!(detail.lng, Some(-0.1585));

        let none = extract_detail("<h1>Only Name</h1>", "https://example.test/no-coords");
        assert_eq!(none.name.as_deref(), Some("Only Name"));
        assert_eq!(none.lat, None);
    }

    #[test]
    fn blob_extraction_follows_path_candidates() {
        let mut record = vec![Value::Null; 80];
        record[11] = json!("River Dental");
        record[4] = json!([null, null, null, null, null, null, null, 4.9, 610]);
        record[13] = json!(["Dentist", "Cosmetic dentist"]);
        record[18] = json!("8 River Rd, Austin");
        record[10] = json!("0x8644:0xff");
        record[78] = json!("ChIJriver");
        let mut item = vec![Value::Null; 15];
        item[14] = Value::Array(record);

        let blob = json!([[null, [Value::Array(item.clone()), Value::Array(item), [null]]]]);
        let paths = ListingPaths::builtin().unwrap();
        let entries = extract_from_blob(&blob, paths);

        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "River Dental");
        assert_eq!(e.rating, Some(4.9));
        assert_eq!(e.review_count, Some(610));
        assert_eq!(e.address.as_deref(), Some("8 River Rd, Austin"));
        assert_eq!(e.category.as_deref(), Some("Dentist"));
        assert_eq!(e.secondary_categories, vec!["Cosmetic dentist".to_string()]);
        assert_eq!(e.cid.as_deref(), Some("255"));
        assert_eq!(e.place_id.as_deref(), Some("ChIJriver"));
        assert!(!e.is_sab);
    }

    #[test]
    fn blob_service_area_needs_an_explicit_marker() {
        let paths = ListingPaths::from_json(
            r#"{"version":"t","listings":[["results"]],"record":[[]],"name":[["name"]],"rating":[],
                "review_count":[],"address":[["address"]],"category":[],"categories":[],"phone":[],
                "website":[],"place_id":[],"cid":[],"service_area":[["service_area"]]}"#,
        )
        .unwrap();
        let blob = json!({"results": [
            {"name": "Mobile Locksmith", "service_area": ["Austin", "Round Rock"]},
            {"name": "No Address Cafe"},
            {"name": "Corner Shop", "address": "1 Main St", "service_area": ["Austin"]}
        ]});
        let entries = extract_from_blob(&blob, &paths);
        let sab: Vec<bool> = entries.iter().map(|e| e.is_sab).collect();
        assert_eq!(sab, vec![true, false, false]);
    }

    #[test]
    fn blob_prefix_is_stripped() {
        let v = parse_blob(")]}'\n[1,2]").unwrap();
        assert_eq!(v, json!([1, 2]));
        assert!(parse_blob("not json").is_err());
    }
}
