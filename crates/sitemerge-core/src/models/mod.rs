mod archive;
mod company;
mod facility;
mod group;

pub use archive::{ArchivedRecord, MERGE_REASON};
pub use company::Company;
pub use facility::{Facility, STATUS_ACTIVE, STATUS_INACTIVE};
pub use group::{DuplicateGroup, GroupStrategy, MergeProposal};

use std::fmt;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

/// Surrogate key of a catalog row.
pub type EntityId = i64;

/// The two merge-able tables. `Company` is the parent kind, `Facility` the
/// dependent kind that references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Facility,
}

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Facility => "facility",
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            EntityKind::Company => "company_id",
            EntityKind::Facility => "facility_id",
        }
    }

    pub fn archive_table(self) -> &'static str {
        match self {
            EntityKind::Company => "deactivated_companies",
            EntityKind::Facility => "deactivated_facilities",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// A stored row: surrogate key plus attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row<T> {
    pub id: EntityId,
    #[serde(flatten)]
    pub record: T,
}

impl<T> Row<T> {
    pub fn new(id: EntityId, record: T) -> Self {
        Self { id, record }
    }
}

/// Attributes of a merge-able table, independent of any surrogate key.
pub trait Entity: Clone + PartialEq + fmt::Debug + Serialize {
    const KIND: EntityKind;

    fn name(&self) -> &str;

    /// Every column this record writes on insert, in table order.
    fn column_values(&self) -> Vec<(&'static str, Value)>;

    /// Columns of the table's natural (unique) key. They are matched NULL-safely
    /// when resolving a merge target and never overwritten on update.
    fn natural_key_columns() -> &'static [&'static str];

    /// Fields shown to a reviewer, in display order, already formatted.
    fn display_fields(&self) -> Vec<(&'static str, Option<String>)>;

    fn natural_key(&self) -> Vec<(&'static str, Value)> {
        let keys = Self::natural_key_columns();
        self.column_values()
            .into_iter()
            .filter(|(col, _)| keys.contains(col))
            .collect()
    }
}

pub(crate) fn text_value(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

pub(crate) fn int_value(v: Option<i64>) -> Value {
    v.map(Value::Integer).unwrap_or(Value::Null)
}

pub(crate) fn real_value(v: Option<f64>) -> Value {
    v.map(Value::Real).unwrap_or(Value::Null)
}

pub(crate) fn display_float(v: Option<f64>) -> Option<String> {
    v.map(|f| format!("{f:.6}"))
}
