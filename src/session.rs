//! Browser session lifecycle for one scan.
//!
//! A scan opens a single session and moves it between sample points with a
//! geolocation override. The controller owns the live session, falls back to a
//! direct connection when the proxied launch fails, and can be closed any
//! number of times.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use uuid::Uuid;

use crate::config::BrowserSettings;
use crate::error::{CrawlerError, Result};
use crate::extractor::{self, ListingPaths};
use crate::models::{BusinessDetail, BusinessEntry, Coordinate, ProxyRecord};
use crate::proxy::{chrome_proxy_arg, generate_proxy_auth_extension, requires_auth};
use crate::stealth::{self, random_persona, region_for, Persona, RegionProfile};

/// A live browser that can be pointed at a location and queried.
#[async_trait]
pub trait SearchSession: Send + 'static {
    async fn reposition(&mut self, point: Coordinate) -> Result<()>;
    async fn search(&mut self, keyword: &str, point: Coordinate) -> Result<Vec<BusinessEntry>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync + 'static {
    type Session: SearchSession;

    async fn launch(
        &self,
        proxy: Option<&ProxyRecord>,
        persona: Persona,
        region: RegionProfile,
    ) -> Result<Self::Session>;
}

/// How the current session was opened.
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    /// Endpoint the live session routes through, if any.
    pub proxy: Option<ProxyRecord>,
    /// Endpoint whose launch failed before the session fell back to direct.
    pub failed_proxy: Option<Uuid>,
    pub proxy_error: Option<String>,
}

pub struct SessionController<L: BrowserLauncher> {
    launcher: Arc<L>,
    session: Option<L::Session>,
    report: LaunchReport,
}

impl<L: BrowserLauncher> SessionController<L> {
    pub fn new(launcher: Arc<L>) -> Self {
        Self {
            launcher,
            session: None,
            report: LaunchReport::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Endpoint used by the live session.
    pub fn proxy(&self) -> Option<&ProxyRecord> {
        self.report.proxy.as_ref()
    }

    /// Launch a session for a scan centred on `center`, replacing any open one.
    ///
    /// A failed proxied launch is retried once without the proxy. Only a
    /// failure of the direct launch is returned as an error.
    pub async fn open(&mut self, proxy: Option<ProxyRecord>, center: Coordinate) -> Result<LaunchReport> {
        self.close().await;

        let persona = random_persona(&mut rand::thread_rng());
        let region = region_for(center);
        tracing::debug!(
            "opening session: ua={} tz={} proxy={:?}",
            persona.user_agent,
            region.timezone,
            proxy.as_ref().map(|p| format!("{}:{}", p.host, p.port))
        );

        let mut report = LaunchReport::default();
        if let Some(endpoint) = proxy {
            match self.launcher.launch(Some(&endpoint), persona, region).await {
                Ok(session) => {
                    report.proxy = Some(endpoint);
                    self.session = Some(session);
                    self.report = report.clone();
                    return Ok(report);
                }
                Err(e) => {
                    tracing::warn!(
                        "launch through proxy {}:{} failed, falling back to direct: {}",
                        endpoint.host,
                        endpoint.port,
                        e
                    );
                    report.failed_proxy = Some(endpoint.id);
                    report.proxy_error = Some(e.to_string());
                }
            }
        }

        let session = self.launcher.launch(None, persona, region).await?;
        self.session = Some(session);
        self.report = report.clone();
        Ok(report)
    }

    pub async fn reposition(&mut self, point: Coordinate) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.reposition(point).await,
            None => Err(CrawlerError::SessionClosed),
        }
    }

    pub async fn search(&mut self, keyword: &str, point: Coordinate) -> Result<Vec<BusinessEntry>> {
        match self.session.as_mut() {
            Some(session) => session.search(keyword, point).await,
            None => Err(CrawlerError::SessionClosed),
        }
    }

    /// Safe to call when nothing is open.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.report = LaunchReport::default();
    }
}

/// Results URL for `keyword` centred on `point`.
pub fn search_url(base: &str, keyword: &str, point: Coordinate) -> String {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    format!(
        "{}{}/@{:.6},{:.6},14z?hl=en",
        base,
        urlencoding::encode(keyword.trim()),
        point.lat,
        point.lng
    )
}

const FEED_SELECTOR: &str = r#"div[role="feed"]"#;
const FEED_SCROLLS: usize = 4;

/// Reads the initialization blob; empty string when the page has none.
const BLOB_SCRIPT: &str = r#"
(() => {
    try {
        const s = window.APP_INITIALIZATION_STATE;
        if (s && s[3] && s[3][2]) return String(s[3][2]);
    } catch (e) {}
    return '';
})()
"#;

const SCROLL_FEED_SCRIPT: &str = r#"
(() => {
    const feed = document.querySelector('div[role="feed"]');
    if (!feed) return false;
    feed.scrollBy(0, feed.clientHeight * 0.9);
    return true;
})()
"#;

/// Launches headless Chrome with the persona and proxy applied.
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

/// Wrap a Chrome error. Waits that expire are reported as "timed out" so the
/// proxy behind the session is held responsible.
fn chrome_err(context: &str) -> impl Fn(anyhow::Error) -> CrawlerError + '_ {
    move |e| {
        if e.downcast_ref::<headless_chrome::util::Timeout>().is_some() {
            CrawlerError::Navigation(format!("{context}: timed out"))
        } else {
            CrawlerError::Navigation(format!("{context}: {e}"))
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CrawlerError::Launch(format!("browser task aborted: {e}")))?
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    type Session = ChromeSession;

    async fn launch(
        &self,
        proxy: Option<&ProxyRecord>,
        persona: Persona,
        region: RegionProfile,
    ) -> Result<ChromeSession> {
        let proxy_arg = proxy.map(|p| format!("--proxy-server={}", chrome_proxy_arg(p)));
        let ext_arg = match proxy.filter(|p| requires_auth(p)) {
            Some(p) => {
                let path = generate_proxy_auth_extension(
                    p.id,
                    p.username.as_deref().unwrap_or_default(),
                    p.password.as_deref().unwrap_or_default(),
                )?;
                Some(format!("--load-extension={path}"))
            }
            None => None,
        };
        let headless = self.settings.headless;
        let timeout = self.settings.navigation_timeout;

        let (browser, tab) = blocking(move || {
            let ua_arg = format!("--user-agent={}", persona.user_agent);
            let lang_arg = format!("--lang={}", region.locale);
            let mut args: Vec<&OsStr> = vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--window-position=0,0"),
                OsStr::new("--ignore-certificate-errors"),
                OsStr::new("--incognito"),
                OsStr::new(&ua_arg),
                OsStr::new(&lang_arg),
            ];
            if headless {
                args.push(OsStr::new("--headless=new"));
            }
            if let Some(arg) = &proxy_arg {
                args.push(OsStr::new(arg));
            }
            if let Some(arg) = &ext_arg {
                args.push(OsStr::new(arg));
            }

            let browser = Browser::new(LaunchOptions {
                headless: false,
                window_size: Some(persona.viewport),
                idle_browser_timeout: Duration::from_secs(600),
                args,
                ..Default::default()
            })
            .map_err(|e| CrawlerError::Launch(e.to_string()))?;

            let tab = browser.new_tab().map_err(|e| CrawlerError::Launch(e.to_string()))?;
            tab.set_default_timeout(timeout);
            stealth::apply_persona(&tab, &persona, &region)?;
            Ok((browser, tab))
        })
        .await?;

        Ok(ChromeSession {
            browser: Some(browser),
            tab,
            search_base_url: self.settings.search_base_url.clone(),
            navigation_timeout: timeout,
        })
    }
}

pub struct ChromeSession {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    search_base_url: String,
    navigation_timeout: Duration,
}

/// Captcha and consent walls mean the egress IP was flagged.
fn check_for_block(tab: &Tab) -> Result<()> {
    let url = tab.get_url();
    if url.contains("/sorry/") || url.contains("consent.") {
        return Err(CrawlerError::Navigation(format!("blocked by interstitial (proxy flagged): {url}")));
    }
    if let Ok(html) = tab.get_content() {
        if html.contains("unusual traffic") || html.contains("not a robot") {
            return Err(CrawlerError::Navigation("captcha served (proxy flagged)".into()));
        }
    }
    Ok(())
}

fn read_listings(tab: &Tab) -> Result<Vec<BusinessEntry>> {
    let html = tab.get_content().map_err(chrome_err("page content"))?;
    let listings = extractor::extract_listings(&html);
    if !listings.is_empty() {
        return Ok(listings);
    }

    let raw = tab
        .evaluate(BLOB_SCRIPT, false)
        .ok()
        .and_then(|obj| obj.value)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    match extractor::parse_blob(&raw) {
        Ok(blob) => Ok(extractor::extract_from_blob(&blob, ListingPaths::builtin()?)),
        Err(e) => {
            tracing::debug!("unreadable data blob: {}", e);
            Ok(Vec::new())
        }
    }
}

impl ChromeSession {
    /// Open a business page and read its name, address and coordinates.
    pub async fn fetch_detail(&self, url: &str) -> Result<BusinessDetail> {
        let tab = self.tab.clone();
        let url = url.to_string();
        let timeout = self.navigation_timeout;
        blocking(move || {
            tab.navigate_to(&url).map_err(chrome_err("navigate"))?;
            tab.wait_until_navigated().map_err(chrome_err("wait for navigation"))?;
            if tab.wait_for_element_with_custom_timeout("h1", timeout).is_err() {
                tracing::debug!("no heading on {}", url);
            }
            check_for_block(&tab)?;
            let html = tab.get_content().map_err(chrome_err("page content"))?;
            Ok(extractor::extract_detail(&html, &tab.get_url()))
        })
        .await
    }
}

#[async_trait]
impl SearchSession for ChromeSession {
    async fn reposition(&mut self, point: Coordinate) -> Result<()> {
        let tab = self.tab.clone();
        blocking(move || stealth::set_geolocation(&tab, point)).await
    }

    async fn search(&mut self, keyword: &str, point: Coordinate) -> Result<Vec<BusinessEntry>> {
        let tab = self.tab.clone();
        let url = search_url(&self.search_base_url, keyword, point);
        let timeout = self.navigation_timeout;

        blocking(move || {
            tab.navigate_to(&url).map_err(chrome_err("navigate"))?;
            tab.wait_until_navigated().map_err(chrome_err("wait for navigation"))?;
            check_for_block(&tab)?;

            // Zero results and single-place pages render without a feed.
            if tab.wait_for_element_with_custom_timeout(FEED_SELECTOR, timeout).is_ok() {
                for _ in 0..FEED_SCROLLS {
                    let scrolled = tab
                        .evaluate(SCROLL_FEED_SCRIPT, false)
                        .ok()
                        .and_then(|obj| obj.value)
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if !scrolled {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(700 + rand::random::<u64>() % 800));
                }
            }

            read_listings(&tab)
        })
        .await
    }

    async fn close(&mut self) {
        let Some(browser) = self.browser.take() else {
            return;
        };
        let tab = self.tab.clone();
        let closed = blocking(move || {
            if let Err(e) = tab.close(false) {
                tracing::debug!("tab close failed: {}", e);
            }
            drop(browser);
            Ok(())
        })
        .await;
        if let Err(e) = closed {
            tracing::warn!("browser shutdown: {}", e);
        }
    }
}
