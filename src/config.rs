// src/config.rs
//! Runtime configuration, read from `COIN_TRACKER_*` environment variables.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WATCHLIST: &[&str] = &[
    "BTC", "ETH", "BNB", "ADA", "SOL", "XRP", "DOT", "DOGE", "LTC", "TON11419", "AVAX",
    "SUI20947", "ARB11841",
];

#[derive(Debug, Clone)]
pub struct QuoteConfig {
    pub base_url: String,
    /// Appended to each symbol to form the ticker, e.g. `BTC-USD`.
    pub quote_currency: String,
    pub request_delay: Duration,
    pub max_concurrent: usize,
    pub timeout: Duration,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://query1.finance.yahoo.com".to_string(),
            quote_currency: "USD".to_string(),
            request_delay: Duration::from_millis(500),
            max_concurrent: 1,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// `None` means a random secret is generated at startup.
    pub jwt_secret: Option<String>,
    pub token_ttl_secs: i64,
    pub quotes: QuoteConfig,
    pub watchlist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("user_data"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3030)),
            jwt_secret: None,
            token_ttl_secs: 24 * 60 * 60,
            quotes: QuoteConfig::default(),
            watchlist: DEFAULT_WATCHLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let get = |key: &str| vars.get(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("COIN_TRACKER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = get("COIN_TRACKER_BIND") {
            config.bind_addr = parse("COIN_TRACKER_BIND", addr)?;
        }
        if let Some(secret) = get("COIN_TRACKER_JWT_SECRET") {
            config.jwt_secret = Some(secret.clone());
        }
        if let Some(ttl) = get("COIN_TRACKER_TOKEN_TTL_SECS") {
            config.token_ttl_secs = parse("COIN_TRACKER_TOKEN_TTL_SECS", ttl)?;
        }
        if let Some(url) = get("COIN_TRACKER_QUOTE_URL") {
            config.quotes.base_url = url.trim().to_string();
        }
        if let Some(ms) = get("COIN_TRACKER_QUOTE_DELAY_MS") {
            config.quotes.request_delay =
                Duration::from_millis(parse("COIN_TRACKER_QUOTE_DELAY_MS", ms)?);
        }
        if let Some(n) = get("COIN_TRACKER_QUOTE_CONCURRENCY") {
            let n: usize = parse("COIN_TRACKER_QUOTE_CONCURRENCY", n)?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    key: "COIN_TRACKER_QUOTE_CONCURRENCY",
                    value: n.to_string(),
                });
            }
            config.quotes.max_concurrent = n;
        }
        if let Some(secs) = get("COIN_TRACKER_QUOTE_TIMEOUT_SECS") {
            config.quotes.timeout =
                Duration::from_secs(parse("COIN_TRACKER_QUOTE_TIMEOUT_SECS", secs)?);
        }
        if let Some(list) = get("COIN_TRACKER_WATCHLIST") {
            config.watchlist = list
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("user_data"));
        assert_eq!(config.quotes.request_delay, Duration::from_millis(500));
        assert_eq!(config.quotes.max_concurrent, 1);
        assert_eq!(config.watchlist.len(), 13);
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_vars(&vars(&[
            ("COIN_TRACKER_DATA_DIR", "/tmp/coins"),
            ("COIN_TRACKER_BIND", "0.0.0.0:8080"),
            ("COIN_TRACKER_QUOTE_DELAY_MS", "250"),
            ("COIN_TRACKER_QUOTE_CONCURRENCY", "4"),
            ("COIN_TRACKER_WATCHLIST", "btc, eth,,sol"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/coins"));
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.quotes.request_delay, Duration::from_millis(250));
        assert_eq!(config.quotes.max_concurrent, 4);
        assert_eq!(config.watchlist, vec!["BTC", "ETH", "SOL"]);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = Config::from_vars(&vars(&[("COIN_TRACKER_QUOTE_DELAY_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("COIN_TRACKER_QUOTE_DELAY_MS"));

        assert!(Config::from_vars(&vars(&[("COIN_TRACKER_QUOTE_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = Config::from_vars(&vars(&[("COIN_TRACKER_DATA_DIR", "  ")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("user_data"));
    }
}
