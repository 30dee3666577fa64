use std::time;
use url::Url;
use crate::errors::ServiceError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const SERVER_HOST: &str = "0.0.0.0";
pub const SERVER_PORT: u16 = 8080;

pub const DATABASE_URL: &str = "sqlite:./data/tracks.db";
pub const DB_MAX_CONNECTIONS: u32 = 8;

pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1/";
pub const SPOTIFY_SEARCH_LIMIT: u32 = 20;
pub const SPOTIFY_SEARCH_MAX: u32 = 50;

/// Wrapper over a variable lookup to return an invalid environment var error
fn env_check<F>(var: &F, s: &str) -> Result<String, ServiceError>
where
    F: Fn(&str) -> Option<String>
{
    match var(s) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ServiceError::Config(format!("{s} was not set"))),
    }
}

/// Optional variable parsed into T, default when unset
fn env_parse<F, T>(var: &F, s: &str, default: T) -> Result<T, ServiceError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr
{
    match var(s) {
        Some(v) if !v.trim().is_empty() => v.trim().parse::<T>()
            .map_err(|_| ServiceError::Config(format!("{s} invalid: {v}"))),
        _ => Ok(default)
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

///
/// Listen address for the http surface
///
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn build_server<F>(var: &F) -> Result<ServerConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>
{
    let host = var("SERVER_HOST")
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| SERVER_HOST.to_string());
    let port = env_parse(var, "SERVER_PORT", SERVER_PORT)?;

    Ok( ServerConfig { host, port } )
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub api_base: Url,
    pub search_limit: u32
}

fn build_spotify<F>(var: &F) -> Result<SpotifyConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>
{
    let client_id     = env_check(var, "SPOTIFY_CLIENT_ID")?;
    let client_secret = env_check(var, "SPOTIFY_CLIENT_SECRET")?;

    // form urls
    let token_url = var("SPOTIFY_TOKEN_URL")
        .unwrap_or_else(|| SPOTIFY_TOKEN_URL.to_string());

    let api_base  = var("SPOTIFY_API_BASE")
        .unwrap_or_else(|| SPOTIFY_API_BASE.to_string());

    let token_url = Url::parse(&token_url)
        .map_err(|e| ServiceError::Config(
                format!("SPOTIFY_TOKEN_URL invalid {e}")
        ))?;

    let mut api_base  = Url::parse(&api_base)
        .map_err(|e| ServiceError::Config(
                format!("SPOTIFY_API_BASE invalid {e}")
        ))?;

    // ensure valid https and hostname for both urls
    ensure_https(&token_url).map_err(ServiceError::Config)?;
    ensure_https(&api_base).map_err(ServiceError::Config)?;
    ensure_host(&token_url, "accounts.spotify.com")
        .map_err(ServiceError::Config)?;
    ensure_host(&api_base, "api.spotify.com")
        .map_err(ServiceError::Config)?;

    if !api_base.path().ends_with('/') {
        let mut path = api_base.path().to_string();
        path.push('/');
        api_base.set_path(&path);
    }

    let search_limit = env_parse(var, "SPOTIFY_SEARCH_LIMIT", SPOTIFY_SEARCH_LIMIT)?
        .clamp(1, SPOTIFY_SEARCH_MAX);

    Ok( SpotifyConfig { client_id, client_secret, token_url, api_base, search_limit })
}

///
/// Configuration for Http timeouts, pooling, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS
        }
    }
}

///
/// Configuration for persistent storage in sqlite db
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub max_connections: u32
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: DATABASE_URL.to_string(),
            max_connections: DB_MAX_CONNECTIONS
        }
    }
}

fn build_persistence<F>(var: &F) -> Result<PersistenceConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>
{
    let db_url = var("DATABASE_URL")
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DATABASE_URL.to_string());

    if !db_url.starts_with("sqlite:") {
        return Err(ServiceError::Config(
            format!("DATABASE_URL must be a sqlite url: {db_url}")
        ));
    }

    let max_connections = env_parse(var, "DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS)?;
    if max_connections == 0 {
        return Err(ServiceError::Config("DB_MAX_CONNECTIONS must be > 0".into()));
    }

    Ok( PersistenceConfig { db_url, max_connections } )
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,track_store=debug,tower_http=info,sqlx=warn,reqwest=warn"
                .to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true
        }
    }
}

fn build_logging<F>(var: &F) -> Result<LoggingConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>
{
    let format = match var("LOG_FORMAT").as_deref().map(str::trim) {
        None | Some("") | Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        Some(other) => return Err(ServiceError::Config(
            format!("LOG_FORMAT invalid: {other}")
        ))
    };

    Ok( LoggingConfig { format, ..LoggingConfig::default() } )
}

///
/// AppConfig which holds everything resolved at process start
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub spotify: SpotifyConfig,
    pub http: HttpConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, ServiceError> {
    dotenvy::dotenv().ok();
    load_config_from(|s| std::env::var(s).ok())
}

pub fn load_config_from<F>(var: F) -> Result<AppConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>
{
    let server      = build_server(&var)?;
    let spotify     = build_spotify(&var)?;
    let http        = HttpConfig::default();
    let persistence = build_persistence(&var)?;
    let logging     = build_logging(&var)?;

    Ok( AppConfig { server, spotify, http, persistence, logging } )
}
