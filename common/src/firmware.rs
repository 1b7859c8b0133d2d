use crate::version::FirmwareVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An uploaded firmware image. Immutable after creation; the binary lives on
/// disk under the firmware root as `filename`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firmware {
    pub id: i64,
    pub version: FirmwareVersion,
    pub filename: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub checksum: String,
    pub notes: Option<String>,
    pub download_count: u64,
    pub created_at: DateTime<Utc>,
}

/// One contiguous run of differing bytes between two images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRegion {
    pub kind: DiffKind,
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffKind {
    Changed,
    Added,
    Removed,
}

/// Byte-level comparison of two firmware images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareDiff {
    pub size_diff: i64,
    pub added_bytes: u64,
    pub removed_bytes: u64,
    /// Capped; a truncated list means the images diverge in more places.
    pub changed_regions: Vec<DiffRegion>,
}
