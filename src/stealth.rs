//! Browser persona & fingerprint alignment
//!
//! This module provides:
//! - Randomised device personas (user agent, platform, viewport)
//! - Locale / timezone derived from the scan region
//! - The init script injected before any page script runs
//! - CDP overrides for timezone, locale, user agent and geolocation

use std::sync::Arc;

use headless_chrome::protocol::cdp::Browser::{GrantPermissions, PermissionType};
use headless_chrome::protocol::cdp::Emulation::{
    SetGeolocationOverride, SetLocaleOverride, SetTimezoneOverride,
};
use headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument;
use headless_chrome::Tab;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{CrawlerError, Result};
use crate::models::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Persona {
    pub user_agent: &'static str,
    pub platform: &'static str,
    pub viewport: (u32, u32),
}

const PERSONAS: &[Persona] = &[
    Persona {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        platform: "Win32",
        viewport: (1920, 1080),
    },
    Persona {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
        platform: "Win32",
        viewport: (1536, 864),
    },
    Persona {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        platform: "MacIntel",
        viewport: (1440, 900),
    },
    Persona {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        platform: "MacIntel",
        viewport: (1680, 1050),
    },
    Persona {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        platform: "Linux x86_64",
        viewport: (1366, 768),
    },
];

pub fn random_persona<R: Rng + ?Sized>(rng: &mut R) -> Persona {
    *PERSONAS.choose(rng).unwrap_or(&PERSONAS[0])
}

/// Locale + IANA timezone presented by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionProfile {
    pub locale: &'static str,
    pub timezone: &'static str,
}

impl RegionProfile {
    const fn new(locale: &'static str, timezone: &'static str) -> Self {
        Self { locale, timezone }
    }

    /// `Accept-Language` header value for this locale.
    pub fn accept_language(&self) -> String {
        match self.locale.split_once('-') {
            Some((lang, _)) => format!("{},{};q=0.9", self.locale, lang),
            None => self.locale.to_string(),
        }
    }
}

pub const DEFAULT_REGION: RegionProfile = RegionProfile::new("en-US", "UTC");

struct BoundingBox {
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
    profile: RegionProfile,
}

impl BoundingBox {
    fn contains(&self, c: Coordinate) -> bool {
        c.lat >= self.min_lat && c.lat <= self.max_lat && c.lng >= self.min_lng && c.lng <= self.max_lng
    }
}

/// Checked in order; the first containing box wins.
const REGION_BOXES: &[BoundingBox] = &[
    // United Kingdom & Ireland, before the wider EU box
    BoundingBox { min_lat: 49.8, max_lat: 60.9, min_lng: -10.7, max_lng: 1.8, profile: RegionProfile::new("en-GB", "Europe/London") },
    BoundingBox { min_lat: 35.0, max_lat: 71.2, min_lng: -10.0, max_lng: 40.0, profile: RegionProfile::new("en-GB", "Europe/Berlin") },
    BoundingBox { min_lat: -44.0, max_lat: -10.0, min_lng: 112.0, max_lng: 154.0, profile: RegionProfile::new("en-AU", "Australia/Sydney") },
    BoundingBox { min_lat: 6.0, max_lat: 35.7, min_lng: 68.0, max_lng: 97.5, profile: RegionProfile::new("en-IN", "Asia/Kolkata") },
    BoundingBox { min_lat: 12.0, max_lat: 42.0, min_lng: 34.0, max_lng: 63.5, profile: RegionProfile::new("en-AE", "Asia/Dubai") },
    BoundingBox { min_lat: 49.0, max_lat: 83.5, min_lng: -141.0, max_lng: -52.0, profile: RegionProfile::new("en-CA", "America/Toronto") },
];

/// Derive locale/timezone from coordinates with static bounding boxes.
/// Continental US is split into timezone bands by longitude.
pub fn region_for(coord: Coordinate) -> RegionProfile {
    let in_conus = (24.0..49.0).contains(&coord.lat) && (-125.0..=-66.0).contains(&coord.lng);
    if in_conus {
        let timezone = if coord.lng < -115.0 {
            "America/Los_Angeles"
        } else if coord.lng < -101.0 {
            "America/Denver"
        } else if coord.lng < -87.0 {
            "America/Chicago"
        } else {
            "America/New_York"
        };
        return RegionProfile::new("en-US", timezone);
    }

    REGION_BOXES
        .iter()
        .find(|b| b.contains(coord))
        .map(|b| b.profile)
        .unwrap_or(DEFAULT_REGION)
}

/// Init script injected with `Page.addScriptToEvaluateOnNewDocument`.
pub fn init_script(persona: &Persona) -> String {
    format!(
        r#"
        Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
        Object.defineProperty(navigator, 'platform', {{ get: () => '{platform}' }});
        Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {cores} }});
        Object.defineProperty(navigator, 'deviceMemory', {{ get: () => 8 }});
        window.chrome = window.chrome || {{ runtime: {{}}, app: {{ isInstalled: false }} }};
        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications'
                ? Promise.resolve({{ state: Notification.permission }})
                : originalQuery(parameters)
        );
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {{
            if (parameter === 37445) return 'Intel Inc.';
            if (parameter === 37446) return 'Intel Iris OpenGL Engine';
            return getParameter.apply(this, [parameter]);
        }};
        "#,
        platform = persona.platform,
        cores = if persona.viewport.0 >= 1600 { 8 } else { 4 },
    )
}

fn cdp_err(context: &str, e: impl std::fmt::Display) -> CrawlerError {
    CrawlerError::Launch(format!("{context}: {e}"))
}

/// Apply persona and region overrides to a freshly opened tab.
pub fn apply_persona(tab: &Arc<Tab>, persona: &Persona, region: &RegionProfile) -> Result<()> {
    tab.call_method(AddScriptToEvaluateOnNewDocument {
        source: init_script(persona),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })
    .map_err(|e| cdp_err("init script", e))?;

    tab.set_user_agent(persona.user_agent, Some(&region.accept_language()), Some(persona.platform))
        .map_err(|e| cdp_err("user agent override", e))?;

    tab.call_method(SetTimezoneOverride {
        timezone_id: region.timezone.to_string(),
    })
    .map_err(|e| cdp_err("timezone override", e))?;

    tab.call_method(SetLocaleOverride {
        locale: Some(region.locale.to_string()),
    })
    .map_err(|e| cdp_err("locale override", e))?;

    tab.call_method(GrantPermissions {
        permissions: vec![PermissionType::Geolocation],
        origin: None,
        browser_context_id: None,
    })
    .map_err(|e| cdp_err("geolocation permission", e))?;

    Ok(())
}

/// Move the virtual geolocation without relaunching the browser.
pub fn set_geolocation(tab: &Arc<Tab>, coord: Coordinate) -> Result<()> {
    tab.call_method(SetGeolocationOverride {
        latitude: Some(coord.lat),
        longitude: Some(coord.lng),
        accuracy: Some(25.0),
        altitude: None,
        altitude_accuracy: None,
        heading: None,
        speed: None,
    })
    .map_err(|e| CrawlerError::Navigation(format!("geolocation override: {e}")))?;
    Ok(())
}
