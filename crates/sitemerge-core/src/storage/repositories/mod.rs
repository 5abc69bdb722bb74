mod archive_repository;
mod company_repository;
mod entity_store;
mod facility_repository;

pub use archive_repository::{ArchiveRepository, SqliteArchiveRepository};
pub use company_repository::{CompanyRepository, SqliteCompanyRepository};
pub use entity_store::EntityStore;
pub use facility_repository::{FacilityRepository, SqliteFacilityRepository};

use crate::error::Result;
use crate::models::{Entity, EntityId, Row};

pub trait Repository {
    type Entity: Entity;

    fn find_by_id(&self, id: EntityId) -> Result<Option<Row<Self::Entity>>>;
    fn find_by_ids(&self, ids: &[EntityId]) -> Result<Vec<Row<Self::Entity>>>;
    fn insert(&self, record: &Self::Entity) -> Result<EntityId>;
}

/// `WHERE` fragment for an operator-supplied predicate. The predicate is raw
/// SQL from the command line and is trusted as such.
pub(crate) fn where_clause(base: Option<&str>, filter: Option<&str>) -> String {
    let filter = filter.map(str::trim).filter(|f| !f.is_empty());
    match (base, filter) {
        (Some(b), Some(f)) => format!(" WHERE {b} AND ({f})"),
        (Some(b), None) => format!(" WHERE {b}"),
        (None, Some(f)) => format!(" WHERE ({f})"),
        (None, None) => String::new(),
    }
}
