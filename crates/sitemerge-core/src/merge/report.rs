use std::fmt;

use serde::Serialize;

use crate::models::{DuplicateGroup, EntityId, EntityKind};

/// Terminal state of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Applied,
    /// Dry run: everything was computed, nothing was written.
    Previewed,
    /// Already merged earlier; every loser is still referenced, nothing to change.
    Retained,
    Skipped,
    Failed,
}

impl MergeStatus {
    pub fn is_success(self) -> bool {
        matches!(self, MergeStatus::Applied | MergeStatus::Previewed | MergeStatus::Retained)
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeStatus::Applied => "APPLIED",
            MergeStatus::Previewed => "PREVIEWED",
            MergeStatus::Retained => "RETAINED",
            MergeStatus::Skipped => "SKIPPED",
            MergeStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepointCount {
    /// `table.column`
    pub reference: String,
    pub dependents: usize,
    pub moved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedConflict {
    pub reference: String,
    pub rowid: i64,
    pub from_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub kind: EntityKind,
    pub members: Vec<EntityId>,
    pub status: MergeStatus,
    /// Surviving row; `None` only when a dry run would insert a new one.
    pub target_id: Option<EntityId>,
    /// The target is a newly inserted row rather than an existing match.
    pub created: bool,
    /// Retired row outside the group that the natural key landed on.
    pub revived: Option<EntityId>,
    pub repointed: Vec<RepointCount>,
    pub excluded: Vec<ExcludedConflict>,
    pub archived: Vec<EntityId>,
    pub deactivated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
    /// Losing rows kept live because something still references them.
    pub retained: Vec<EntityId>,
    pub error: Option<String>,
}

impl MergeReport {
    pub fn new(group: &DuplicateGroup, status: MergeStatus) -> Self {
        Self {
            kind: group.kind,
            members: group.members().to_vec(),
            status,
            target_id: None,
            created: false,
            revived: None,
            repointed: Vec::new(),
            excluded: Vec::new(),
            archived: Vec::new(),
            deactivated: Vec::new(),
            deleted: Vec::new(),
            retained: Vec::new(),
            error: None,
        }
    }

    pub fn skipped(group: &DuplicateGroup) -> Self {
        Self::new(group, MergeStatus::Skipped)
    }

    pub fn failed(group: &DuplicateGroup, error: impl Into<String>) -> Self {
        let mut report = Self::new(group, MergeStatus::Failed);
        report.error = Some(error.into());
        report
    }

    pub fn moved_total(&self) -> usize {
        self.repointed.iter().map(|r| r.moved).sum()
    }

    /// One-line outcome for the audit log.
    pub fn summary(&self) -> String {
        let target = match (self.target_id, self.created) {
            (Some(id), false) => id.to_string(),
            (Some(id), true) => format!("{id} (new)"),
            (None, _) if self.created => "(new)".to_string(),
            (None, _) => "-".to_string(),
        };
        let mut line = format!("action={} target={target}", self.status);
        if matches!(self.status, MergeStatus::Applied | MergeStatus::Previewed) {
            line.push_str(&format!(
                " repointed={} excluded={} archived={:?} deactivated={:?} deleted={:?}",
                self.moved_total(),
                self.excluded.len(),
                self.archived,
                self.deactivated,
                self.deleted
            ));
            if let Some(id) = self.revived {
                line.push_str(&format!(" revived={id}"));
            }
            if !self.retained.is_empty() {
                line.push_str(&format!(" retained={:?}", self.retained));
            }
        } else if self.status == MergeStatus::Retained {
            line.push_str(&format!(" retained={:?}", self.retained));
        }
        if let Some(err) = &self.error {
            line.push_str(&format!(" error=\"{err}\""));
        }
        line
    }
}
