// src/session.rs
use crate::auth;
use crate::db::{validate_username, CredentialStore, PortfolioStore};
use crate::error::SessionError;
use crate::models::{Holdings, PortfolioRecord, Prices, Quotes, Valuation};
use crate::prices::PriceFetcher;
use log::{error, info, warn};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct Authenticated {
    pub username: String,
    pub holdings: Holdings,
    pub last_updated: String,
}

/// Per-connection user context. Starts anonymous; only the controller
/// moves it between states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    user: Option<Authenticated>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn user(&self) -> Option<&Authenticated> {
        self.user.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }

    /// Values the session's holdings; an anonymous session values to nothing.
    pub fn compute_valuation(&self, prices: &Prices) -> Valuation {
        match &self.user {
            Some(user) => Valuation::compute(&user.holdings, prices),
            None => Valuation::default(),
        }
    }
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Overlays `edits` on `current` and drops anything that is not a positive amount.
pub fn apply_edits(current: &Holdings, edits: &Holdings) -> Result<Holdings, SessionError> {
    let mut merged = current.clone();
    for (symbol, &amount) in edits {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(SessionError::InvalidInput("Coin symbol cannot be empty".into()));
        }
        merged.insert(symbol, amount);
    }
    merged.retain(|_, amount| amount.is_finite() && *amount > 0.0);
    Ok(merged)
}

pub struct SessionController {
    credentials: CredentialStore,
    portfolios: PortfolioStore,
    fetcher: PriceFetcher,
    watchlist: BTreeSet<String>,
}

impl SessionController {
    pub fn new(
        credentials: CredentialStore,
        portfolios: PortfolioStore,
        fetcher: PriceFetcher,
        watchlist: &[String],
    ) -> Self {
        Self {
            credentials,
            portfolios,
            fetcher,
            watchlist: watchlist.iter().map(|s| normalize_symbol(s)).collect(),
        }
    }

    /// On success the session holds the user's stored portfolio. A bad
    /// password or unknown user returns false and leaves the session as it was.
    pub async fn login(
        &self,
        session: &mut Session,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError> {
        if validate_username(username).is_err()
            || !self.credentials.check(username, password).await?
        {
            warn!("Rejected login for {:?}", username);
            return Ok(false);
        }

        let PortfolioRecord {
            holdings,
            last_updated,
        } = self.portfolios.load(username).await?;
        session.user = Some(Authenticated {
            username: username.to_string(),
            holdings,
            last_updated,
        });
        info!("{} logged in", username);
        Ok(true)
    }

    /// Creates the account and an empty portfolio. False if the name is taken,
    /// either by a credential or by a portfolio record left without one.
    pub async fn register(&self, username: &str, password: &str) -> Result<bool, SessionError> {
        if username.is_empty() || password.is_empty() {
            return Err(SessionError::InvalidInput(
                "Username and password cannot be empty".into(),
            ));
        }
        if validate_username(username).is_err() {
            return Err(SessionError::InvalidInput(format!(
                "Username {:?} may only contain letters, digits, '_', '-' and '.'",
                username
            )));
        }

        if self.portfolios.exists(username).await? {
            warn!(
                "Registration refused, a portfolio record for {} already exists",
                username
            );
            return Ok(false);
        }
        let digest = auth::derive_blocking(password).await?;
        if !self.credentials.insert_new(username, &digest).await? {
            info!("Registration refused, {} already exists", username);
            return Ok(false);
        }
        if let Err(e) = self.portfolios.save(username, &Holdings::new()).await {
            if let Err(undo) = self.credentials.remove(username).await {
                error!("Failed to roll back credential for {}: {}", username, undo);
            }
            return Err(e.into());
        }
        info!("Registered {}", username);
        Ok(true)
    }

    pub fn logout(&self, session: &mut Session) {
        if let Some(user) = session.user.take() {
            info!("{} logged out", user.username);
        }
    }

    pub async fn update_portfolio(
        &self,
        session: &mut Session,
        edits: &Holdings,
    ) -> Result<(), SessionError> {
        let user = session.user.as_mut().ok_or(SessionError::NotAuthenticated)?;
        let holdings = apply_edits(&user.holdings, edits)?;
        let last_updated = self.portfolios.save(&user.username, &holdings).await?;
        user.holdings = holdings;
        user.last_updated = last_updated;
        Ok(())
    }

    pub fn compute_valuation(&self, session: &Session, prices: &Prices) -> Valuation {
        session.compute_valuation(prices)
    }

    /// Prices the held coins and values them.
    pub async fn valuation(&self, session: &Session) -> Result<(Valuation, Vec<String>), SessionError> {
        let user = session.user().ok_or(SessionError::NotAuthenticated)?;
        let symbols: BTreeSet<String> = user.holdings.keys().cloned().collect();
        let quotes = self.fetcher.fetch(&symbols).await;
        Ok((session.compute_valuation(&quotes.prices), quotes.warnings))
    }

    pub async fn watchlist_prices(&self) -> Quotes {
        self.fetcher.fetch(&self.watchlist).await
    }
}
