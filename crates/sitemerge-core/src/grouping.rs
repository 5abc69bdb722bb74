//! Candidate discovery. Every strategy is a pure function from a snapshot of
//! rows to a list of groups: keys are collected in one pass into an ordered
//! map, then filtered, so repeated runs over unchanged rows agree.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::error::Result;
use crate::models::{Company, DuplicateGroup, EntityId, EntityKind, Facility, GroupStrategy, Row};
use crate::normalize::{norm_ws, normalize_name, normalize_street};
use crate::storage::spatial::DistanceOracle;

/// Text key of a dependent row. Both variants carry the parent so groups never
/// cross it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FacilityKey {
    Address {
        parent: Option<EntityId>,
        street: String,
        city: String,
        state: String,
        postal: String,
    },
    NameFallback {
        parent: Option<EntityId>,
        name: String,
        city: String,
        state: String,
    },
}

impl FacilityKey {
    /// Address key when the street line survives normalization, else the
    /// name/city/state key. `None` when neither has anything to match on.
    pub fn of(f: &Facility) -> Option<Self> {
        let city = lower(f.city.as_deref());
        let state = upper(f.state.as_deref());
        let street = normalize_street(f.address_line1.as_deref().unwrap_or_default()).to_lowercase();
        if !street.is_empty() {
            return Some(FacilityKey::Address {
                parent: f.company_id,
                street,
                city,
                state,
                postal: norm_ws(f.postal_code.as_deref().unwrap_or_default()),
            });
        }
        let name = lower(Some(&f.name));
        if name.is_empty() {
            return None;
        }
        Some(FacilityKey::NameFallback {
            parent: f.company_id,
            name,
            city,
            state,
        })
    }

    fn strategy(&self) -> GroupStrategy {
        match self {
            FacilityKey::Address { .. } => GroupStrategy::Address,
            FacilityKey::NameFallback { .. } => GroupStrategy::NameFallback,
        }
    }
}

fn lower(s: Option<&str>) -> String {
    norm_ws(s.unwrap_or_default()).to_lowercase()
}

fn upper(s: Option<&str>) -> String {
    norm_ws(s.unwrap_or_default()).to_uppercase()
}

/// Parent companies grouped by `normalize_name`. Members keep row order.
pub fn group_companies(rows: &[Row<Company>]) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
    for row in rows {
        let key = normalize_name(&row.record.name);
        if key.is_empty() {
            continue;
        }
        buckets.entry(key).or_default().push(row.id);
    }
    let mut groups: Vec<DuplicateGroup> = buckets
        .into_values()
        .filter_map(|ids| DuplicateGroup::new(EntityKind::Company, ids, GroupStrategy::NormalizedName))
        .collect();
    groups.sort_by_key(|g| g.first());
    groups
}

/// Rows whose `(parent, name, city, state)` would collide under the facility
/// unique constraint. No distance check: these must merge or never coexist.
pub fn exact_key_groups(rows: &[Row<Facility>]) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<(EntityId, String, String, String), Vec<EntityId>> = BTreeMap::new();
    for row in rows {
        let f = &row.record;
        let Some(parent) = f.company_id else { continue };
        let name = lower(Some(&f.name));
        let city = lower(f.city.as_deref());
        let state = upper(f.state.as_deref());
        if name.is_empty() || city.is_empty() || state.is_empty() {
            continue;
        }
        buckets.entry((parent, name, city, state)).or_default().push(row.id);
    }
    let mut groups: Vec<DuplicateGroup> = buckets
        .into_values()
        .filter_map(|mut ids| {
            ids.sort_unstable();
            DuplicateGroup::new(EntityKind::Facility, ids, GroupStrategy::ExactKey)
        })
        .collect();
    groups.sort_by_key(|g| g.first());
    groups
}

/// Keep every primary group, add secondary groups that overlap none of them,
/// then drop members already claimed by an earlier group. Groups left with
/// fewer than two members disappear.
pub fn reconcile(primary: Vec<DuplicateGroup>, secondary: Vec<DuplicateGroup>) -> Vec<DuplicateGroup> {
    let mut combined = primary;
    let kept = combined.len();
    for group in secondary {
        if combined[..kept].iter().any(|p| p.overlaps(&group)) {
            debug!(members = ?group.members(), strategy = %group.strategy, "discarding overlapping group");
            continue;
        }
        combined.push(group);
    }
    dedupe_first_seen(combined)
}

pub fn dedupe_first_seen(groups: Vec<DuplicateGroup>) -> Vec<DuplicateGroup> {
    let mut claimed: HashSet<EntityId> = HashSet::new();
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let free: Vec<EntityId> = group
            .members()
            .iter()
            .copied()
            .filter(|id| !claimed.contains(id))
            .collect();
        if let Some(g) = DuplicateGroup::new(group.kind, free, group.strategy) {
            claimed.extend(g.members().iter().copied());
            out.push(g);
        }
    }
    out
}

/// Parent ids that survived a parent merge only because something still
/// references them, mapped to the canonical parent they were merged into.
#[derive(Debug, Clone, Default)]
pub struct ParentAliases {
    aliases: HashMap<EntityId, EntityId>,
}

impl ParentAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, retained: EntityId, canonical: EntityId) {
        self.aliases.insert(retained, canonical);
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn resolve(&self, id: Option<EntityId>) -> Option<EntityId> {
        id.map(|p| self.aliases.get(&p).copied().unwrap_or(p))
    }

    /// Tag rows of retained parents as belonging to the canonical parent, so
    /// grouping and proposals treat them as siblings.
    pub fn apply(&self, rows: &mut [Row<Facility>]) {
        if self.aliases.is_empty() {
            return;
        }
        for row in rows {
            row.record.company_id = self.resolve(row.record.company_id);
        }
    }
}

/// Dependent-kind grouping with distance splitting.
pub struct GroupingEngine<'a> {
    oracle: &'a dyn DistanceOracle,
    max_distance_m: f64,
}

impl<'a> GroupingEngine<'a> {
    pub fn new(oracle: &'a dyn DistanceOracle, max_distance_m: f64) -> Self {
        Self {
            oracle,
            max_distance_m,
        }
    }

    /// Text-key groups, each split into distance clusters around an anchor.
    pub fn group_facilities(&self, rows: &[Row<Facility>]) -> Result<Vec<DuplicateGroup>> {
        let mut buckets: BTreeMap<FacilityKey, Vec<EntityId>> = BTreeMap::new();
        for row in rows {
            if let Some(key) = FacilityKey::of(&row.record) {
                buckets.entry(key).or_default().push(row.id);
            }
        }

        let mut groups = Vec::new();
        for (key, ids) in buckets {
            if ids.len() < 2 {
                continue;
            }
            groups.extend(self.cluster(ids, key.strategy())?);
        }
        groups.sort_by_key(|g| g.first());
        Ok(groups)
    }

    /// Pure distance clustering per parent, with no text key.
    pub fn proximity_groups(&self, rows: &[Row<Facility>]) -> Result<Vec<DuplicateGroup>> {
        let mut by_parent: BTreeMap<Option<EntityId>, Vec<EntityId>> = BTreeMap::new();
        for row in rows {
            by_parent.entry(row.record.company_id).or_default().push(row.id);
        }

        let mut groups = Vec::new();
        for (_, ids) in by_parent {
            if ids.len() < 2 {
                continue;
            }
            groups.extend(self.cluster(ids, GroupStrategy::Proximity)?);
        }
        groups.sort_by_key(|g| g.first());
        Ok(groups)
    }

    /// Walk members in id order: each one joins the open cluster if it lies
    /// within the radius of the anchor, otherwise it closes the cluster and
    /// becomes the next anchor. A member with no distance stays in the cluster.
    fn cluster(&self, mut ids: Vec<EntityId>, strategy: GroupStrategy) -> Result<Vec<DuplicateGroup>> {
        ids.sort_unstable();
        ids.dedup();

        let mut groups = Vec::new();
        let mut current: Vec<EntityId> = Vec::new();
        for id in ids {
            let Some(&anchor) = current.first() else {
                current.push(id);
                continue;
            };
            match self.oracle.distance_m(anchor, id)? {
                Some(d) if d > self.max_distance_m => {
                    debug!(anchor, id, distance_m = d, "splitting cluster");
                    groups.extend(DuplicateGroup::new(
                        EntityKind::Facility,
                        std::mem::take(&mut current),
                        strategy,
                    ));
                    current.push(id);
                }
                _ => current.push(id),
            }
        }
        groups.extend(DuplicateGroup::new(EntityKind::Facility, current, strategy));
        Ok(groups)
    }
}
