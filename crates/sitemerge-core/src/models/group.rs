use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::{EntityId, EntityKind};

/// Which grouping strategy produced a candidate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    /// Normalized parent name.
    NormalizedName,
    /// Normalized address key, split by distance to the cluster anchor.
    Address,
    /// Name/city/state key used when the street line is missing.
    NameFallback,
    /// Distance clustering with no text key.
    Proximity,
    /// Exact `(parent, name, city, state)` key with no distance check.
    ExactKey,
}

impl fmt::Display for GroupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupStrategy::NormalizedName => "normalized-name",
            GroupStrategy::Address => "address",
            GroupStrategy::NameFallback => "name-fallback",
            GroupStrategy::Proximity => "proximity",
            GroupStrategy::ExactKey => "exact-key",
        };
        f.write_str(s)
    }
}

/// Ordered, deduplicated set of two or more rows believed to be one real-world thing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub kind: EntityKind,
    members: Vec<EntityId>,
    pub strategy: GroupStrategy,
}

impl DuplicateGroup {
    /// Returns `None` when fewer than two distinct members remain.
    pub fn new(
        kind: EntityKind,
        ids: impl IntoIterator<Item = EntityId>,
        strategy: GroupStrategy,
    ) -> Option<Self> {
        let mut seen = HashSet::new();
        let members: Vec<EntityId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        if members.len() < 2 {
            return None;
        }
        Some(Self {
            kind,
            members,
            strategy,
        })
    }

    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn first(&self) -> EntityId {
        self.members[0]
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn overlaps(&self, other: &DuplicateGroup) -> bool {
        self.members.iter().any(|id| other.contains(*id))
    }
}

/// A synthesized record, not yet assigned an identifier, plus the group it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeProposal<T> {
    pub group: DuplicateGroup,
    /// Member whose values anchored the synthesis.
    pub base_id: EntityId,
    pub record: T,
}
