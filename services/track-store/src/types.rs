use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

// International standard recording code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Isrc(pub String);

impl Isrc {
    /// Trims the raw value, an empty code is a caller error
    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let code = raw.trim();
        if code.is_empty() {
            return Err(ServiceError::Validation(
                "ISRC parameter is required".to_string()
            ));
        }
        Ok(Isrc(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Isrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Track as resolved from the catalog, before it has a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackCandidate {
    pub isrc: Isrc,
    pub image_uri: Option<String>,
    pub title: String,
    pub popularity: i64,
    pub artists: Vec<String>
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: i64,
    pub name: String
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub isrc: Isrc,
    pub image_uri: Option<String>,
    pub title: String,
    pub popularity: i64,
    pub artists: Vec<Artist>,
    pub created_at: i64,
    pub updated_at: i64
}

impl Track {
    pub fn artist_names(&self) -> Vec<&str> {
        self.artists.iter().map(|a| a.name.as_str()).collect()
    }
}
