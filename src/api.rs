// src/api.rs
use crate::auth::{create_token, decode_token, expiry, random_id};
use crate::error::CustomError;
use crate::models::{
    LoginRequest, LoginResponse, PortfolioView, RegisterRequest, UpdatePortfolioRequest,
    ValuationResponse,
};
use crate::session::{Session, SessionController};
use chrono::Utc;
use log::{debug, error, info};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Live sessions keyed by the `sid` claim of their token.
pub type SessionRegistry = RwLock<HashMap<String, SessionEntry>>;

pub struct SessionEntry {
    /// Same instant as the token's `exp` claim.
    pub expires_at: i64,
    pub session: Arc<Mutex<Session>>,
}

/// Drops every session whose token can no longer be decoded.
fn prune_expired(sessions: &mut HashMap<String, SessionEntry>) {
    let now = Utc::now().timestamp();
    let before = sessions.len();
    sessions.retain(|_, entry| entry.expires_at > now);
    let evicted = before - sessions.len();
    if evicted > 0 {
        debug!("Evicted {} expired sessions", evicted);
    }
}

pub struct AppState {
    pub controller: SessionController,
    pub sessions: SessionRegistry,
    pub jwt_secret: String,
    pub token_ttl_secs: i64,
}

impl AppState {
    pub fn new(controller: SessionController, jwt_secret: String, token_ttl_secs: i64) -> Self {
        Self {
            controller,
            sessions: RwLock::new(HashMap::new()),
            jwt_secret,
            token_ttl_secs,
        }
    }

    async fn resolve(&self, header: Option<String>) -> Result<SessionHandle, Rejection> {
        let token = header
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| {
                warp::reject::custom(CustomError::unauthorized("Missing bearer token"))
            })?;
        let claims = decode_token(token, &self.jwt_secret).map_err(|e| {
            debug!("Token rejected: {}", e);
            warp::reject::custom(CustomError::unauthorized("Invalid or expired token"))
        })?;

        let session = self
            .sessions
            .read()
            .await
            .get(&claims.sid)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| warp::reject::custom(CustomError::unauthorized("Session ended")))?;
        if session.lock().await.username() != Some(claims.sub.as_str()) {
            return Err(warp::reject::custom(CustomError::unauthorized(
                "Session ended",
            )));
        }
        Ok(SessionHandle {
            sid: claims.sid,
            session,
        })
    }
}

pub struct SessionHandle {
    sid: String,
    session: Arc<Mutex<Session>>,
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let register = warp::path("register")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(register_handler);

    let login = warp::path("login")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(login_handler);

    let logout = warp::path("logout")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(authenticated(state.clone()))
        .and_then(logout_handler);

    let get_portfolio = warp::path("portfolio")
        .and(warp::path::end())
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and_then(get_portfolio_handler);

    let update_portfolio = warp::path("portfolio")
        .and(warp::path::end())
        .and(warp::put())
        .and(with_state(state.clone()))
        .and(authenticated(state.clone()))
        .and(json_body())
        .and_then(update_portfolio_handler);

    let valuation = warp::path("valuation")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(authenticated(state.clone()))
        .and_then(valuation_handler);

    let prices = warp::path("prices")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(prices_handler);

    register
        .or(login)
        .or(logout)
        .or(get_portfolio)
        .or(update_portfolio)
        .or(valuation)
        .or(prices)
        .recover(handle_rejection)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn authenticated(
    state: Arc<AppState>,
) -> impl Filter<Extract = (SessionHandle,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_state(state))
        .and_then(|header: Option<String>, state: Arc<AppState>| async move {
            state.resolve(header).await
        })
}

fn portfolio_view(session: &Session) -> Result<PortfolioView, Rejection> {
    let user = session
        .user()
        .ok_or_else(|| warp::reject::custom(CustomError::unauthorized("Session ended")))?;
    Ok(PortfolioView {
        username: user.username.clone(),
        holdings: user.holdings.clone(),
        last_updated: user.last_updated.clone(),
    })
}

async fn register_handler(
    state: Arc<AppState>,
    request: RegisterRequest,
) -> Result<impl Reply, Rejection> {
    if request.password != request.confirm_password {
        return Err(warp::reject::custom(CustomError::bad_request(
            "Passwords do not match",
        )));
    }
    match state
        .controller
        .register(&request.username, &request.password)
        .await
    {
        Ok(true) => Ok(warp::reply::with_status(
            warp::reply::json(&json!({"message": "Registration successful! You can now login."})),
            StatusCode::CREATED,
        )),
        Ok(false) => Err(warp::reject::custom(CustomError::new(
            StatusCode::CONFLICT,
            "User with this username already exists",
        ))),
        Err(e) => {
            error!("Failed to register {:?}: {}", request.username, e);
            Err(warp::reject::custom(CustomError::from(e)))
        }
    }
}

async fn login_handler(
    state: Arc<AppState>,
    request: LoginRequest,
) -> Result<impl Reply, Rejection> {
    let mut session = Session::new();
    match state
        .controller
        .login(&mut session, &request.username, &request.password)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return Err(warp::reject::custom(CustomError::unauthorized(
                "Incorrect username or password",
            )))
        }
        Err(e) => {
            error!("Failed to log in {:?}: {}", request.username, e);
            return Err(warp::reject::custom(CustomError::from(e)));
        }
    }

    let sid = random_id();
    let expires_at = expiry(state.token_ttl_secs);
    let token =
        create_token(&request.username, &sid, &state.jwt_secret, expires_at).map_err(|e| {
            error!("Failed to sign token: {}", e);
            warp::reject::custom(CustomError::internal("Failed to create session"))
        })?;

    let last_updated = session
        .user()
        .map(|user| user.last_updated.clone())
        .unwrap_or_default();
    let mut sessions = state.sessions.write().await;
    prune_expired(&mut sessions);
    sessions.insert(
        sid,
        SessionEntry {
            expires_at,
            session: Arc::new(Mutex::new(session)),
        },
    );
    drop(sessions);

    Ok(warp::reply::json(&LoginResponse {
        token,
        username: request.username,
        last_updated,
    }))
}

async fn logout_handler(
    state: Arc<AppState>,
    handle: SessionHandle,
) -> Result<impl Reply, Rejection> {
    let mut session = handle.session.lock().await;
    state.controller.logout(&mut session);
    let mut sessions = state.sessions.write().await;
    sessions.remove(&handle.sid);
    prune_expired(&mut sessions);
    Ok(warp::reply::json(&json!({"message": "Logged out"})))
}

async fn get_portfolio_handler(handle: SessionHandle) -> Result<impl Reply, Rejection> {
    let session = handle.session.lock().await;
    Ok(warp::reply::json(&portfolio_view(&session)?))
}

async fn update_portfolio_handler(
    state: Arc<AppState>,
    handle: SessionHandle,
    request: UpdatePortfolioRequest,
) -> Result<impl Reply, Rejection> {
    let mut session = handle.session.lock().await;
    match state
        .controller
        .update_portfolio(&mut session, &request.holdings)
        .await
    {
        Ok(()) => {
            info!("Portfolio updated successfully.");
            Ok(warp::reply::json(&portfolio_view(&session)?))
        }
        Err(e) => {
            error!("Failed to update portfolio: {}", e);
            Err(warp::reject::custom(CustomError::from(e)))
        }
    }
}

async fn valuation_handler(
    state: Arc<AppState>,
    handle: SessionHandle,
) -> Result<impl Reply, Rejection> {
    // The lock is released before the price lookups start.
    let session = handle.session.lock().await.clone();
    match state.controller.valuation(&session).await {
        Ok((valuation, warnings)) => {
            let last_updated = session
                .user()
                .map(|user| user.last_updated.clone())
                .unwrap_or_default();
            Ok(warp::reply::json(&ValuationResponse {
                valuation,
                warnings,
                last_updated,
            }))
        }
        Err(e) => Err(warp::reject::custom(CustomError::from(e))),
    }
}

async fn prices_handler(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let quotes = state.controller.watchlist_prices().await;
    Ok(warp::reply::json(&quotes))
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(e) = err.find::<CustomError>() {
        (e.status, e.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuoteConfig;
    use crate::db;
    use crate::error::QuoteError;
    use crate::prices::{PriceFetcher, QuoteSource};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoQuotes;

    impl QuoteSource for NoQuotes {
        fn latest_close<'a>(
            &'a self,
            _ticker: &'a str,
        ) -> BoxFuture<'a, Result<Option<f64>, QuoteError>> {
            futures::future::ready(Ok(None)).boxed()
        }
    }

    async fn state(token_ttl_secs: i64) -> (TempDir, Arc<AppState>) {
        let dir = TempDir::new().unwrap();
        let (credentials, portfolios) = db::init(dir.path()).await.unwrap();
        let config = QuoteConfig {
            request_delay: Duration::ZERO,
            ..QuoteConfig::default()
        };
        let fetcher = PriceFetcher::new(Arc::new(NoQuotes), &config);
        let controller = SessionController::new(credentials, portfolios, fetcher, &[]);
        controller.register("bob", "pw").await.unwrap();
        let state = Arc::new(AppState::new(
            controller,
            "test-secret".to_string(),
            token_ttl_secs,
        ));
        (dir, state)
    }

    async fn login<F>(filter: &F) -> StatusCode
    where
        F: Filter + Clone + Send + Sync + 'static,
        F::Extract: Reply + Send,
    {
        warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({"username": "bob", "password": "pw"}))
            .reply(filter)
            .await
            .status()
    }

    #[tokio::test]
    async fn expired_sessions_are_evicted_on_login() {
        let (_dir, state) = state(-3600).await;
        let filter = routes(state.clone());

        for _ in 0..5 {
            assert_eq!(login(&filter).await, StatusCode::OK);
        }

        // only the session created by the latest login survives
        assert_eq!(state.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn live_sessions_are_kept() {
        let (_dir, state) = state(3600).await;
        let filter = routes(state.clone());

        for _ in 0..3 {
            assert_eq!(login(&filter).await, StatusCode::OK);
        }

        assert_eq!(state.sessions.read().await.len(), 3);
    }
}
