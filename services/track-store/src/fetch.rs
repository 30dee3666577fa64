//!
//! src/fetch.rs
//!
//! Defines the spotify client used to resolve an isrc into track
//! metadata: client credentials token (cached until expiry),
//! search by isrc, and picking the most popular hit
//!

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header, redirect, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, SpotifyConfig};
use crate::errors::ServiceError;
use crate::types::{Isrc, TrackCandidate};

/// Tokens are treated as expired this long before spotify says so
pub const TOKEN_EXPIRY_SKEW: u64 = 60;
pub const TOKEN_DEFAULT_TTL: u64 = 3600;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder  {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, ServiceError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_helper(http)
        .default_headers(h)
        .build()
        .map_err(|e| ServiceError::Http(format!("build client: {e}")))
}

/// Sends once, success bodies are parsed as json and anything else
/// is surfaced with its status
async fn send_json(request: RequestBuilder) -> Result<Value, ServiceError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<Value>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let msg = format!("status {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED => Err(ServiceError::Unauthorized(msg)),
        StatusCode::TOO_MANY_REQUESTS => Err(ServiceError::RateLimited(msg)),
        _ => Err(ServiceError::Http(msg))
    }
}

/// Anything that can resolve an isrc into a candidate track
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_by_isrc(&self, isrc: &Isrc) -> Result<TrackCandidate, ServiceError>;
}

/// One item of a spotify track search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub popularity: i64,
    pub artists: Vec<String>,
    pub image_uri: Option<String>
}

impl SearchHit {
    pub fn new(item: &Value) -> Self {
        Self {
            title: item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            popularity: item.get("popularity").and_then(|v| v.as_i64()).unwrap_or(0),
            artists: item.get("artists").and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter().filter_map(|a| a.get("name").and_then(|v| v.as_str()))
                       .map(|name| name.to_string()).collect()
                }).unwrap_or_default(),
            image_uri: item.pointer("/album/images/0/url")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }
    }

    pub fn into_candidate(self, isrc: &Isrc) -> TrackCandidate {
        TrackCandidate {
            isrc: isrc.clone(),
            image_uri: self.image_uri,
            title: self.title,
            popularity: self.popularity,
            artists: self.artists
        }
    }
}

/// Pulls `tracks.items` out of a search response
pub fn parse_search(search: &Value) -> Result<Vec<SearchHit>, ServiceError> {
    let items = search.pointer("/tracks/items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ServiceError::Parse(
            "spotify search response missing tracks.items".into()
        ))?;

    Ok(items.iter()
        .filter(|item| !item.is_null())
        .map(SearchHit::new)
        .collect())
}

/// Highest popularity wins, ties keep the first seen hit
pub fn select_most_popular(hits: Vec<SearchHit>) -> Option<SearchHit> {
    hits.into_iter().reduce(|best, hit| {
        if hit.popularity > best.popularity { hit } else { best }
    })
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: Instant
}

#[derive(Clone, Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub cfg: SpotifyConfig,
    token: std::sync::Arc<Mutex<Option<CachedToken>>>
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &SpotifyConfig) ->
        Result<Self, ServiceError> {

        let http = base_client(http_config)?;
        Ok( Self {
            http,
            cfg: cfg.clone(),
            token: std::sync::Arc::new(Mutex::new(None))
        })
    }

    pub fn token_request(&self) -> RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
    }

    /// GET /v1/search?type=track&q=...&limit=&offset=
    pub fn search(&self, query: &str, limit: u32, offset: u32, bearer: &str) ->
        Result<RequestBuilder, ServiceError> {
        let url = self.cfg.api_base.join("search")?;
        let limit = limit.to_string();
        let offset = offset.to_string();
        Ok(self.http.get(url).bearer_auth(bearer).query(&[
            ("type", "track"),
            ("q", query),
            ("limit", limit.as_str()),
            ("offset", offset.as_str())
        ]))
    }

    async fn refresh_token(&self) -> Result<CachedToken, ServiceError> {
        let response = send_json(self.token_request()).await?;
        let bearer = response["access_token"].as_str()
            .ok_or_else(|| ServiceError::Http("no access_token in response".into()))?
            .to_string();
        let expires_in = response["expires_in"].as_u64().unwrap_or(TOKEN_DEFAULT_TTL);
        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SKEW));
        Ok(CachedToken { bearer, expires_at })
    }

    /// Cached bearer, refreshed under the lock so concurrent callers
    /// share a single token request
    pub async fn bearer(&self) -> Result<String, ServiceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.bearer.clone());
            }
        }

        let token = self.refresh_token().await?;
        debug!(expires_at = ?token.expires_at, "spotify.token.refresh");
        let bearer = token.bearer.clone();
        *cached = Some(token);
        Ok(bearer)
    }

    pub async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    pub async fn search_isrc(&self, isrc: &Isrc) -> Result<Vec<SearchHit>, ServiceError> {
        let bearer = self.bearer().await?;
        let query = format!("isrc:{isrc}");
        let request = self.search(&query, self.cfg.search_limit, 0, &bearer)?;

        match send_json(request).await {
            Ok(search) => parse_search(&search),
            Err(ServiceError::Unauthorized(msg)) => {
                warn!(isrc = %isrc, "spotify.token.rejected");
                self.invalidate_token().await;
                Err(ServiceError::Unauthorized(msg))
            }
            Err(e) => Err(e)
        }
    }
}

#[async_trait]
impl CatalogSource for SpotifyClient {
    async fn fetch_by_isrc(&self, isrc: &Isrc) -> Result<TrackCandidate, ServiceError> {
        let hits = self.search_isrc(isrc).await?;
        debug!(isrc = %isrc, hits = hits.len(), "spotify.search");

        let best = select_most_popular(hits)
            .ok_or_else(|| ServiceError::Catalog(
                "no track found for the given ISRC".to_string()
            ))?;

        if best.image_uri.is_none() {
            warn!(isrc = %isrc, "spotify.track.no_artwork");
        }
        info!(isrc = %isrc, title = %best.title, popularity = best.popularity, "spotify.resolved");
        Ok(best.into_candidate(isrc))
    }
}
