//! Metadata record kept for every uploaded object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Upload/download/removal facts about one stored object.
///
/// The record outlives the object: a delete only flips `is_removed` and stamps
/// `remove_date`, so `info` keeps answering for removed objects.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileMetadataRecord {
    /// Object identifier, identical to the name returned by upload.
    pub filename: String,

    /// When the object was persisted.
    pub upload_date: DateTime<Utc>,

    /// When the object was deleted, if it has been.
    pub remove_date: Option<DateTime<Utc>>,

    /// Tombstone flag set by delete.
    pub is_removed: bool,

    /// Number of successful downloads.
    pub downloads_count: i64,
}
