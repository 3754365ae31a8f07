// src/prices.rs
use crate::config::QuoteConfig;
use crate::error::QuoteError;
use crate::models::Quotes;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Anything that can report the latest daily close for a ticker.
pub trait QuoteSource: Send + Sync {
    /// `Ok(None)` means the source answered but has no data for the ticker.
    fn latest_close<'a>(&'a self, ticker: &'a str) -> BoxFuture<'a, Result<Option<f64>, QuoteError>>;
}

#[derive(Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
}

#[derive(Deserialize)]
struct ChartResult {
    indicators: Indicators,
}

#[derive(Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

/// Last non-null close in a Yahoo chart payload.
fn last_close(body: &str) -> Result<Option<f64>, serde_json::Error> {
    let response: ChartResponse = serde_json::from_str(body)?;
    Ok(response
        .chart
        .result
        .unwrap_or_default()
        .into_iter()
        .flat_map(|result| result.indicators.quote)
        .flat_map(|series| series.close)
        .flatten()
        .filter(|price| price.is_finite())
        .last())
}

/// Yahoo Finance chart API client.
pub struct YahooQuotes {
    client: Client,
    base_url: String,
}

impl YahooQuotes {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QuoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coin_tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_close(&self, ticker: &str) -> Result<Option<f64>, QuoteError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range=1d&interval=1d",
            self.base_url, ticker
        );
        debug!("Requesting {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(QuoteError::Status {
                ticker: ticker.to_string(),
                status: response.status().as_u16(),
            });
        }
        let body = response.text().await?;
        last_close(&body)
            .map_err(|e| QuoteError::Source(format!("unreadable response for {}: {}", ticker, e)))
    }
}

impl QuoteSource for YahooQuotes {
    fn latest_close<'a>(&'a self, ticker: &'a str) -> BoxFuture<'a, Result<Option<f64>, QuoteError>> {
        self.fetch_close(ticker).boxed()
    }
}

/// Fans price lookups out over a bounded number of workers. A worker keeps its
/// slot for `request_delay` after each lookup so the source sees paced traffic.
pub struct PriceFetcher {
    source: Arc<dyn QuoteSource>,
    quote_currency: String,
    request_delay: Duration,
    max_concurrent: usize,
}

impl PriceFetcher {
    pub fn new(source: Arc<dyn QuoteSource>, config: &QuoteConfig) -> Self {
        Self {
            source,
            quote_currency: config.quote_currency.clone(),
            request_delay: config.request_delay,
            max_concurrent: config.max_concurrent.max(1),
        }
    }

    fn ticker(&self, symbol: &str) -> String {
        format!("{}-{}", symbol, self.quote_currency)
    }

    /// Never fails: symbols that error or have no data are left out and
    /// reported in `warnings`.
    pub async fn fetch(&self, symbols: &BTreeSet<String>) -> Quotes {
        let semaphore = Semaphore::new(self.max_concurrent);

        let lookups = symbols.iter().map(|symbol| {
            let semaphore = &semaphore;
            async move {
                let ticker = self.ticker(symbol);
                let _permit = semaphore.acquire().await.ok();
                let outcome = self.source.latest_close(&ticker).await;
                if !self.request_delay.is_zero() {
                    tokio::time::sleep(self.request_delay).await;
                }
                (symbol, ticker, outcome)
            }
        });

        let mut quotes = Quotes::default();
        for (symbol, ticker, outcome) in join_all(lookups).await {
            match outcome {
                Ok(Some(price)) => {
                    quotes.prices.insert(symbol.clone(), price);
                }
                Ok(None) => {
                    let message = format!("No data available for {}", ticker);
                    warn!("{}", message);
                    quotes.warnings.push(message);
                }
                Err(e) => {
                    let message = format!("Failed to get data for {}: {}", ticker, e);
                    warn!("{}", message);
                    quotes.warnings.push(message);
                }
            }
        }
        info!(
            "Fetched {} of {} prices",
            quotes.prices.len(),
            symbols.len()
        );
        quotes
    }
}
