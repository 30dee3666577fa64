//!
//! src/persistent.rs
//!
//! Defines module for persisting track metadata. Tracks and their
//! artist credits live in an sqlite database, keyed by isrc
//!

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions},
    Pool, Row, Sqlite
};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::errors::ServiceError;
use crate::types::{Artist, Isrc, Track, TrackCandidate};

const MEMORY_URL: &str = "sqlite::memory:";

/// Escapes LIKE wildcards so user input only ever matches literally
fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len() + 2);
    for c in fragment.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Creates the parent directory of a file backed sqlite url
fn ensure_parent_dir(database_url: &str) -> Result<(), ServiceError> {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub struct Persistent {
    pool: Pool<Sqlite>
}

impl Persistent {

    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), ServiceError> {
        // ensure that schema exists
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tracks (
              id           INTEGER PRIMARY KEY AUTOINCREMENT,
              isrc         TEXT NOT NULL UNIQUE,
              image_uri    TEXT,
              title        TEXT NOT NULL,
              popularity   INTEGER NOT NULL DEFAULT 0,
              created_at   INTEGER NOT NULL,
              updated_at   INTEGER NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS artists (
              id          INTEGER PRIMARY KEY AUTOINCREMENT,
              track_id    INTEGER NOT NULL,
              position    INTEGER NOT NULL,
              name        TEXT NOT NULL,
              FOREIGN KEY(track_id) REFERENCES tracks(id) ON DELETE CASCADE
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_artists_track ON artists(track_id, position);"
        ).execute(pool).await?;

        Ok(())
    }

    pub async fn init(cfg: &PersistenceConfig) -> Result<Self, ServiceError> {
        let database_url = cfg.db_url.as_str();
        let is_memory = database_url == MEMORY_URL;

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // WAL is file-only; don't set it for in-memory
        if !is_memory {
            ensure_parent_dir(database_url)?;
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // every in-memory connection is its own database, so keep exactly one
        // and never let the pool recycle it
        let pool = if is_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(cfg.max_connections)
                .connect_with(opts)
                .await?
        };

        // Always create schema right away
        Self::ensure_schema(&pool).await?;
        info!(db = %database_url, "store.ready");

        Ok(Self { pool })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn load_artists(conn: &mut SqliteConnection, track_id: i64) ->
        Result<Vec<Artist>, ServiceError> {
        let rows = sqlx::query(
            "SELECT id, name FROM artists WHERE track_id = ?1 ORDER BY position ASC, id ASC;"
        )
        .bind(track_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter()
            .map(|r| Artist { id: r.get("id"), name: r.get("name") })
            .collect())
    }

    fn track_from_row(r: &sqlx::sqlite::SqliteRow, artists: Vec<Artist>) -> Track {
        Track {
            id: r.get("id"),
            isrc: Isrc(r.get("isrc")),
            image_uri: r.get("image_uri"),
            title: r.get("title"),
            popularity: r.get("popularity"),
            artists,
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at")
        }
    }

    async fn load_track(conn: &mut SqliteConnection, isrc: &str) ->
        Result<Option<Track>, ServiceError> {
        let row = sqlx::query(
            r"
            SELECT id, isrc, image_uri, title, popularity, created_at, updated_at
              FROM tracks
             WHERE isrc = ?1
             LIMIT 1;
            "
        )
        .bind(isrc)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let artists = Self::load_artists(conn, row.get("id")).await?;
        Ok(Some(Self::track_from_row(&row, artists)))
    }

    /// Exact match on isrc with artists in credit order
    pub async fn find_by_isrc(&self, isrc: &Isrc) -> Result<Option<Track>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Self::load_track(&mut *conn, isrc.as_str()).await
    }

    /// Every track with at least one artist whose name contains `fragment`,
    /// each track once, ordered by id. Case folding is sqlite `LIKE`, so
    /// ASCII only: `beyoncé` does not match `BEYONCÉ`
    pub async fn find_by_artist(&self, fragment: &str) -> Result<Vec<Track>, ServiceError> {
        let pattern = format!("%{}%", escape_like(fragment));
        let mut conn = self.pool.acquire().await?;

        let rows = sqlx::query(
            r"
            SELECT t.id, t.isrc, t.image_uri, t.title, t.popularity,
                   t.created_at, t.updated_at
              FROM tracks t
             WHERE EXISTS (
                   SELECT 1 FROM artists a
                    WHERE a.track_id = t.id
                      AND a.name LIKE ?1 ESCAPE '\'
             )
             ORDER BY t.id ASC;
            "
        )
        .bind(&pattern)
        .fetch_all(&mut *conn)
        .await?;

        let mut tracks = Vec::with_capacity(rows.len());
        for row in rows {
            let artists = Self::load_artists(&mut *conn, row.get("id")).await?;
            tracks.push(Self::track_from_row(&row, artists));
        }
        debug!(fragment = %fragment, found = tracks.len(), "store.find_by_artist");
        Ok(tracks)
    }

    /// Insert-or-update keyed by isrc. The row write, the artist
    /// replacement and the read back share one transaction
    pub async fn upsert_track(&self, track: &TrackCandidate) ->
        Result<Track, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let track_id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO tracks (
                isrc, image_uri, title, popularity, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(isrc) DO UPDATE SET
                image_uri  = excluded.image_uri,
                title      = excluded.title,
                popularity = excluded.popularity,
                updated_at = excluded.updated_at
            RETURNING id;
            "
        )
        .bind(track.isrc.as_str())
        .bind(track.image_uri.as_deref())
        .bind(&track.title)
        .bind(track.popularity)
        .bind(Self::now())
        .fetch_one(&mut *tx)
        .await?;

        // artist credits are replaced wholesale, never merged
        sqlx::query("DELETE FROM artists WHERE track_id = ?1;")
            .bind(track_id)
            .execute(&mut *tx)
            .await?;

        for (position, name) in track.artists.iter().enumerate() {
            sqlx::query(
                "INSERT INTO artists (track_id, position, name) VALUES (?1, ?2, ?3);"
            )
            .bind(track_id)
            .bind(position as i64)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }

        let stored = Self::load_track(&mut *tx, track.isrc.as_str())
            .await?
            .ok_or_else(|| ServiceError::Db(
                format!("track {} missing after upsert", track.isrc)
            ))?;

        tx.commit().await?;

        info!(
            isrc = %stored.isrc, track_id = stored.id,
            artists = ?stored.artist_names(), "track.upsert"
        );
        Ok(stored)
    }

    pub async fn count_tracks(&self) -> Result<i64, ServiceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks;")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[cfg(test)]
    pub async fn count_artists(&self) -> Result<i64, ServiceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artists;")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn memory_store() -> Persistent {
        let cfg = PersistenceConfig {
            db_url: MEMORY_URL.to_string(),
            ..PersistenceConfig::default()
        };
        Persistent::init(&cfg).await.unwrap()
    }

    fn candidate(isrc: &str, title: &str, popularity: i64, artists: &[&str]) -> TrackCandidate {
        TrackCandidate {
            isrc: Isrc(isrc.to_string()),
            image_uri: Some(format!("https://i.scdn.co/image/{isrc}")),
            title: title.to_string(),
            popularity,
            artists: artists.iter().map(|a| a.to_string()).collect()
        }
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("Beyonce"), "Beyonce");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
    }

    #[tokio::test]
    async fn insert_then_find_by_isrc() -> Result<(), ServiceError> {
        let store = memory_store().await;
        let input = candidate("USRC17607839", "Track A", 50, &["Artist One", "Artist Two"]);

        let stored = store.upsert_track(&input).await?;
        assert_eq!(stored.isrc, input.isrc);
        assert_eq!(stored.artist_names(), vec!["Artist One", "Artist Two"]);

        let found = store.find_by_isrc(&input.isrc).await?.expect("track should exist");
        assert_eq!(found, stored);
        assert_eq!(found.title, "Track A");
        assert_eq!(found.popularity, 50);
        assert_eq!(found.image_uri.as_deref(), Some("https://i.scdn.co/image/USRC17607839"));

        Ok(())
    }

    #[tokio::test]
    async fn missing_isrc_is_none() -> Result<(), ServiceError> {
        let store = memory_store().await;
        assert!(store.find_by_isrc(&Isrc("NOPE00000000".into())).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn refetch_updates_in_place() -> Result<(), ServiceError> {
        let store = memory_store().await;

        let first = store.upsert_track(
            &candidate("USRC17607839", "Track A", 50, &["Old One", "Old Two"])
        ).await?;

        let mut refetch = candidate("USRC17607839", "Track A (Remastered)", 75, &["New"]);
        refetch.image_uri = None;
        let second = store.upsert_track(&refetch).await?;

        assert_eq!(store.count_tracks().await?, 1);
        assert_eq!(store.count_artists().await?, 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.popularity, 75);
        assert_eq!(second.title, "Track A (Remastered)");
        assert_eq!(second.image_uri, None);
        assert_eq!(second.artist_names(), vec!["New"]);

        Ok(())
    }

    #[tokio::test]
    async fn upsert_is_idempotent() -> Result<(), ServiceError> {
        let store = memory_store().await;
        let input = candidate("GBAYE0601498", "Song", 10, &["Band"]);

        store.upsert_track(&input).await?;
        store.upsert_track(&input).await?;

        assert_eq!(store.count_tracks().await?, 1);
        assert_eq!(store.count_artists().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn track_without_artists_is_allowed() -> Result<(), ServiceError> {
        let store = memory_store().await;
        let stored = store.upsert_track(&candidate("QZES71982312", "Instrumental", 3, &[])).await?;

        assert!(stored.artists.is_empty());
        assert!(store.find_by_artist("").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn artist_substring_search() -> Result<(), ServiceError> {
        let store = memory_store().await;
        store.upsert_track(&candidate("ISRC00000001", "One", 1, &["Tame Impala"])).await?;
        store.upsert_track(&candidate("ISRC00000002", "Two", 2, &["Lil Yachty", "Tame Impala"])).await?;
        store.upsert_track(&candidate("ISRC00000003", "Three", 3, &["Daft Punk"])).await?;

        let hits = store.find_by_artist("Impala").await?;
        let isrcs: Vec<&str> = hits.iter().map(|t| t.isrc.as_str()).collect();
        assert_eq!(isrcs, vec!["ISRC00000001", "ISRC00000002"]);
        // the non matching co-artist is still loaded
        assert_eq!(hits[1].artist_names(), vec!["Lil Yachty", "Tame Impala"]);

        let hits = store.find_by_artist("punk").await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Three");

        assert!(store.find_by_artist("Beatles").await?.is_empty());
        assert_eq!(store.find_by_artist("").await?.len(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn artist_search_treats_wildcards_literally() -> Result<(), ServiceError> {
        let store = memory_store().await;
        store.upsert_track(&candidate("ISRC00000010", "Pure", 1, &["100% Pure"])).await?;
        store.upsert_track(&candidate("ISRC00000011", "Plain", 1, &["Plain Name"])).await?;
        store.upsert_track(&candidate("ISRC00000012", "Under", 1, &["snake_case"])).await?;

        let hits = store.find_by_artist("%").await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].isrc.as_str(), "ISRC00000010");

        let hits = store.find_by_artist("_").await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].isrc.as_str(), "ISRC00000012");

        Ok(())
    }

    #[tokio::test]
    async fn file_database_survives_reopen() -> Result<(), ServiceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("tracks.db");
        let cfg = PersistenceConfig {
            db_url: format!("sqlite:{}", path.display()),
            max_connections: 2
        };

        {
            let store = Persistent::init(&cfg).await?;
            store.upsert_track(&candidate("USRC17607839", "Track A", 50, &["A"])).await?;
            store.pool.close().await;
        }

        let store = Persistent::init(&cfg).await?;
        let found = store.find_by_isrc(&Isrc("USRC17607839".into())).await?;
        assert_eq!(found.map(|t| t.title), Some("Track A".to_string()));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_keep_one_row() -> Result<(), ServiceError> {
        let dir = tempfile::tempdir()?;
        let cfg = PersistenceConfig {
            db_url: format!("sqlite:{}", dir.path().join("tracks.db").display()),
            max_connections: 8
        };
        let store = std::sync::Arc::new(Persistent::init(&cfg).await?);

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let track = candidate("USRC17607839", "Track A", n, &["Tame Impala", "Lil Yachty"]);
                store.upsert_track(&track).await
            }));
        }
        for handle in handles {
            handle.await.expect("upsert task panicked")?;
        }

        assert_eq!(store.count_tracks().await?, 1);
        assert_eq!(store.count_artists().await?, 2);

        let stored = store.find_by_isrc(&Isrc("USRC17607839".into())).await?
            .expect("track should exist");
        assert_eq!(stored.artist_names(), vec!["Tame Impala", "Lil Yachty"]);
        assert!((0..16).contains(&stored.popularity));

        Ok(())
    }

    #[tokio::test]
    async fn artist_search_folds_ascii_case_only() -> Result<(), ServiceError> {
        let store = memory_store().await;
        store.upsert_track(&candidate("ISRC00000021", "Halo", 80, &["BEYONCÉ"])).await?;

        assert_eq!(store.find_by_artist("beyonc").await?.len(), 1);
        assert!(store.find_by_artist("beyoncé").await?.is_empty());

        Ok(())
    }
}
