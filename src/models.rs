// src/models.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coin symbol to amount held.
pub type Holdings = BTreeMap<String, f64>;

/// Symbol to latest close price in USD.
pub type Prices = BTreeMap<String, f64>;

/// One user's persisted portfolio file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PortfolioRecord {
    // Files written by the first version of the app use "portfolio".
    #[serde(default, alias = "portfolio")]
    pub holdings: Holdings,
    #[serde(default)]
    pub last_updated: String,
}

/// Result of a price fetch: whatever succeeded, plus one warning per omitted symbol.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Quotes {
    pub prices: Prices,
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValuationRow {
    pub coin: String,
    pub amount: f64,
    pub price: f64,
    pub value: f64,
    /// Percentage of the portfolio total.
    pub share: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Valuation {
    pub rows: Vec<ValuationRow>,
    pub total: f64,
}

impl Valuation {
    /// Values every held coin that has a price. Coins without one are left out
    /// of both the rows and the total.
    pub fn compute(holdings: &Holdings, prices: &Prices) -> Self {
        let mut rows: Vec<ValuationRow> = holdings
            .iter()
            .filter_map(|(coin, &amount)| {
                prices.get(coin).map(|&price| ValuationRow {
                    coin: coin.clone(),
                    amount,
                    price,
                    value: amount * price,
                    share: 0.0,
                })
            })
            .collect();

        let total: f64 = rows.iter().map(|row| row.value).sum();
        if total > 0.0 {
            for row in &mut rows {
                row.share = row.value / total * 100.0;
            }
        }
        rows.sort_by(|a, b| b.value.total_cmp(&a.value));

        Valuation { rows, total }
    }
}

#[derive(Deserialize, Debug)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub token: String,
    pub username: String,
    pub last_updated: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UpdatePortfolioRequest {
    pub holdings: Holdings,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PortfolioView {
    pub username: String,
    pub holdings: Holdings,
    pub last_updated: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ValuationResponse {
    #[serde(flatten)]
    pub valuation: Valuation,
    pub warnings: Vec<String>,
    pub last_updated: String,
}
