//!
//! src/server.rs
//!
//! Http surface of the service. One write route that resolves an isrc
//! against the catalog and upserts it, two read routes over the store
//!

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{FromRef, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServiceError;
use crate::fetch::CatalogSource;
use crate::persistent::Persistent;
use crate::types::{Artist, Isrc, Track};

pub type SharedStore = Arc<Persistent>;
pub type SharedCatalog = Arc<dyn CatalogSource>;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub catalog: SharedCatalog
}

impl AppState {
    pub fn new(store: Persistent, catalog: impl CatalogSource + 'static) -> Self {
        Self {
            store: Arc::new(store),
            catalog: Arc::new(catalog)
        }
    }
}

impl FromRef<AppState> for SharedStore {
    fn from_ref(input: &AppState) -> Self {
        input.store.clone()
    }
}

#[derive(Serialize)]
struct ArtistBody {
    id: i64,
    name: String
}

impl From<Artist> for ArtistBody {
    fn from(a: Artist) -> Self {
        Self { id: a.id, name: a.name }
    }
}

/// Shape returned by the read routes
#[derive(Serialize)]
struct TrackBody {
    id: i64,
    image_uri: Option<String>,
    title: String,
    artists: Vec<ArtistBody>,
    popularity: i64
}

impl From<Track> for TrackBody {
    fn from(t: Track) -> Self {
        Self {
            id: t.id,
            image_uri: t.image_uri,
            title: t.title,
            artists: t.artists.into_iter().map(ArtistBody::from).collect(),
            popularity: t.popularity
        }
    }
}

/// Shape returned by fetch-and-store
#[derive(Serialize)]
struct StoredBody {
    image_uri: Option<String>,
    title: String,
    artists: Vec<ArtistBody>,
    popularity: i64
}

impl From<Track> for StoredBody {
    fn from(t: Track) -> Self {
        Self {
            image_uri: t.image_uri,
            title: t.title,
            artists: t.artists.into_iter().map(ArtistBody::from).collect(),
            popularity: t.popularity
        }
    }
}

#[derive(Deserialize)]
struct FetchParams {
    isrc: Option<String>
}

async fn fetch_and_store(
    State(state): State<AppState>,
    Query(params): Query<FetchParams>,
) -> Result<Json<StoredBody>, ServiceError> {
    let isrc = Isrc::parse(params.isrc.as_deref().unwrap_or_default())?;

    let candidate = state.catalog.fetch_by_isrc(&isrc).await
        .inspect_err(|e| error!(isrc = %isrc, error = %e, "fetch_and_store.catalog"))?;

    let stored = state.store.upsert_track(&candidate).await
        .inspect_err(|e| error!(isrc = %isrc, error = %e, "fetch_and_store.store"))?;

    Ok(Json(StoredBody::from(stored)))
}

async fn get_by_isrc(
    State(store): State<SharedStore>,
    Path(isrc): Path<String>,
) -> Response {
    let isrc = Isrc(isrc);
    match store.find_by_isrc(&isrc).await {
        Ok(Some(track)) => Json(TrackBody::from(track)).into_response(),
        Ok(None) => ServiceError::NotFound("Track not found".to_string()).into_response(),
        Err(e) => {
            error!(isrc = %isrc, error = %e, "get_by_isrc");
            e.into_response()
        }
    }
}

async fn get_by_artist(
    State(store): State<SharedStore>,
    Path(artist): Path<String>,
) -> Response {
    match store.find_by_artist(&artist).await {
        Ok(tracks) => {
            let body: Vec<TrackBody> = tracks.into_iter().map(TrackBody::from).collect();
            Json(body).into_response()
        }
        Err(e) => {
            error!(artist = %artist, error = %e, "get_by_artist");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to retrieve tracks" }))
            ).into_response()
        }
    }
}

async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if response.status().is_server_error() {
        warn!(%method, %path, status, elapsed_ms, "http.request");
    } else {
        info!(%method, %path, status, elapsed_ms, "http.request");
    }
    response
}

pub fn make_app(state: AppState) -> Router {
    Router::new()
        .route("/fetch-and-store", post(fetch_and_store))
        .route("/track/{isrc}", get(get_by_isrc))
        .route("/tracks-by-artist/{artist}", get(get_by_artist))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

pub async fn run_server(
    cfg: &ServerConfig,
    state: AppState,
    shutdown: CancellationToken
) -> Result<(), ServiceError> {
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr()).await?;
    info!(addr = %cfg.bind_addr(), "server.start");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("server.stop");
    Ok(())
}
