//! Book records exchanged with the host and kept in the device catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata the host supplies for a book being sent to the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    pub pubdate: Option<DateTime<Utc>>,
    pub size: u64,
    /// Host-side identity key; never generated here.
    pub uuid: String,
}

impl BookMetadata {
    pub fn new(title: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pubdate(mut self, pubdate: DateTime<Utc>) -> Self {
        self.pubdate = Some(pubdate);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// A book believed to be present on the device.
///
/// Equality is by `uuid` alone; every other field is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookEntry {
    pub title: String,
    pub authors: Vec<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub uuid: String,
    /// Remote path inside the device's document tree.
    pub path: String,
    #[serde(default)]
    pub thumbnail: Option<Vec<u8>>,
}

impl BookEntry {
    /// Pair host metadata with the remote path an upload produced.
    pub fn from_metadata(metadata: &BookMetadata, path: impl Into<String>) -> Self {
        Self {
            title: metadata.title.clone(),
            authors: metadata.authors.clone(),
            size: metadata.size,
            created_at: metadata.pubdate.unwrap_or_else(Utc::now),
            tags: metadata.tags.clone(),
            uuid: metadata.uuid.clone(),
            path: path.into(),
            thumbnail: None,
        }
    }

    pub fn authors_display(&self) -> String {
        self.authors.join(" & ")
    }
}

impl PartialEq for BookEntry {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for BookEntry {}
