use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityId, EntityKind};

pub const MERGE_REASON: &str = "MERGED";

/// Immutable snapshot of a row removed by a merge. Written before the row is
/// deactivated or deleted; never updated or deleted afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedRecord {
    pub archive_id: i64,
    pub kind: EntityKind,
    pub original_id: EntityId,
    pub reason: String,
    pub merged_to_id: Option<EntityId>,
    pub reason_detail: Option<String>,
    /// Every column of the source row at capture time.
    pub snapshot: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}
