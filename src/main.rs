// src/main.rs
use coin_tracker::api::{self, AppState};
use coin_tracker::auth::random_id;
use coin_tracker::config::Config;
use coin_tracker::db;
use coin_tracker::prices::{PriceFetcher, YahooQuotes};
use coin_tracker::session::SessionController;
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };

    let (credentials, portfolios) = match db::init(&config.data_dir).await {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let source = match YahooQuotes::new(&config.quotes.base_url, config.quotes.timeout) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("Failed to create quote client: {}", e);
            std::process::exit(1);
        }
    };
    let fetcher = PriceFetcher::new(source, &config.quotes);
    let controller = SessionController::new(credentials, portfolios, fetcher, &config.watchlist);

    let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
        warn!("COIN_TRACKER_JWT_SECRET not set, signing tokens with a per-process secret");
        random_id()
    });
    let state = Arc::new(AppState::new(controller, jwt_secret, config.token_ttl_secs));

    info!("Starting the coin tracker application...");
    info!("Server running on http://{}", config.bind_addr);
    warp::serve(api::routes(state)).run(config.bind_addr).await;
}
