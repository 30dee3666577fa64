//!
//! src/main.rs
//!
//! Entry point of the track metadata service: resolves configuration,
//! opens the store, builds the spotify client and serves http until
//! ctrl-c. Live testbenches against the real upstream sit at the bottom
//!

mod config;
mod errors;
mod logging;
mod types;

mod fetch;
mod persistent;
mod server;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::ServiceError;

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let cfgs = config::load_config()?;
    let _logger = logging::init_logging(&cfgs.logging)?;

    info!(
        service="track-store",
        version=%env!("CARGO_PKG_VERSION"),
        "starting"
    );

    // no store means nothing to serve, so this is fatal
    let db = match persistent::Persistent::init(&cfgs.persistence).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, db = %cfgs.persistence.db_url, "store.init failed");
            return Err(e);
        }
    };
    info!(tracks = db.count_tracks().await?, "store.loaded");

    let spotify = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;
    let state   = server::AppState::new(db, spotify);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(msg = "shutting server down", "server.signal");
            trigger.cancel();
        }
    });

    server::run_server(&cfgs.server, state, shutdown).await
}

/// Live Tests
/// Spotify + store round trip, only with LIVE_HTTP=1 and real credentials
#[cfg(test)]
mod tests {
    use crate::ServiceError;
    use crate::fetch::CatalogSource;
    use super::*;

    fn live() -> bool {
        std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
    }

    #[tokio::test]
    async fn spotify_token_testbench() -> Result<(), ServiceError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let spotify = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;

        let first = spotify.bearer().await?;
        let second = spotify.bearer().await?;
        assert!(!first.is_empty());
        assert_eq!(first, second);

        Ok(())
    }

    #[tokio::test]
    async fn spotify_fetch_and_upsert_testbench() -> Result<(), ServiceError> {
        dotenvy::dotenv().ok();
        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let spotify = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;
        let db = persistent::Persistent::init(&config::PersistenceConfig {
            db_url: "sqlite::memory:".to_string(),
            ..config::PersistenceConfig::default()
        }).await?;

        // Breathe Deeper -  Tame Impala, Lil Yachty
        let isrc = types::Isrc::parse("AUUM71900929")?;
        let candidate = spotify.fetch_by_isrc(&isrc).await?;
        println!("candidate: {}", serde_json::to_string_pretty(&candidate)?);

        let stored = db.upsert_track(&candidate).await?;
        let fetched = db.find_by_isrc(&isrc).await?
            .expect("track should exist");
        assert_eq!(stored, fetched);
        assert!(!fetched.artists.is_empty());

        println!("row: \n{}", serde_json::to_string_pretty(&fetched)?);

        Ok(())
    }
}
