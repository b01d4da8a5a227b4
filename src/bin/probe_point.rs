//! Run one search from one coordinate and print what the extractor sees.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

use geo_rank_crawler::config::BrowserSettings;
use geo_rank_crawler::models::{Coordinate, ProxyKind, ProxyRecord, ProxyStatus};
use geo_rank_crawler::proxy::parse_proxy;
use geo_rank_crawler::session::{BrowserLauncher, ChromeLauncher, SearchSession};
use geo_rank_crawler::stealth::{random_persona, region_for};

#[derive(Debug, Parser)]
#[command(name = "probe_point")]
#[command(about = "Search Maps from one coordinate and dump the extracted listings")]
#[command(allow_negative_numbers = true)]
struct Args {
    lat: f64,
    lng: f64,
    /// Search phrase; remaining words are joined with spaces.
    #[arg(required = true)]
    keyword: Vec<String>,
    /// Route the session through this proxy (host:port, user:pass@host:port or a URL).
    #[arg(long, value_parser = proxy_arg)]
    proxy: Option<ProxyRecord>,
    /// Also open the first listing with a place id and print its detail page.
    #[arg(long)]
    detail: bool,
    #[arg(long, env = "CHROME_HEADLESS", default_value_t = true, action = clap::ArgAction::Set)]
    headless: bool,
}

impl Args {
    fn point(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    fn keyword(&self) -> String {
        self.keyword.join(" ")
    }
}

fn proxy_arg(raw: &str) -> std::result::Result<ProxyRecord, String> {
    let parsed = parse_proxy(raw, ProxyKind::Residential).map_err(|e| e.to_string())?;
    Ok(ProxyRecord {
        id: Uuid::new_v4(),
        host: parsed.host,
        port: parsed.port,
        username: parsed.username,
        password: parsed.password,
        protocol: parsed.protocol,
        kind: parsed.kind,
        enabled: true,
        status: ProxyStatus::Untested,
        last_tested: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let args = Args::parse();
    let settings = BrowserSettings {
        headless: args.headless,
        ..Default::default()
    };
    let launcher = Arc::new(ChromeLauncher::new(settings));

    let point = args.point();
    let keyword = args.keyword();
    let persona = random_persona(&mut rand::thread_rng());
    let region = region_for(point);
    println!("persona: {} ({}x{})", persona.user_agent, persona.viewport.0, persona.viewport.1);
    println!("region: {} / {}", region.locale, region.timezone);

    let mut session = launcher
        .launch(args.proxy.as_ref(), persona, region)
        .await
        .context("launching browser")?;

    let outcome = async {
        session.reposition(point).await?;
        let listings = session.search(&keyword, point).await?;
        println!("{}", serde_json::to_string_pretty(&listings)?);

        if args.detail {
            if let Some(place_id) = listings.iter().find_map(|l| l.place_id.clone()) {
                let url = format!("https://www.google.com/maps/place/?q=place_id:{place_id}");
                let detail = session.fetch_detail(&url).await?;
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                println!("no place id among the listings, skipping detail");
            }
        }
        anyhow::Ok(())
    }
    .await;

    session.close().await;
    outcome
}
