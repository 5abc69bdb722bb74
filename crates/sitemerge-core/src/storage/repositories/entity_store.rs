use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params, params_from_iter};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Result, SiteMergeError};
use crate::models::{Entity, EntityId, EntityKind, STATUS_INACTIVE};
use crate::storage::schema_graph::{SchemaGraph, quote_ident};

/// Kind-agnostic row writes driven by [`Entity::column_values`]. Status flips and
/// deletes are crate-private: only the merge executor retires rows.
pub struct EntityStore<'a> {
    conn: &'a Connection,
    schema: String,
}

impl<'a> EntityStore<'a> {
    pub fn new(conn: &'a Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    fn table(&self, kind: EntityKind) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(kind.table()))
    }

    pub fn insert<E: Entity>(&self, record: &E) -> Result<EntityId> {
        let values = record.column_values();
        let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(E::KIND),
            columns.join(", "),
            vec!["?"; values.len()].join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(values.into_iter().map(|(_, v)| v)))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Overwrite every non-key attribute of `id` with the values from `record`.
    pub fn update_attributes<E: Entity>(&self, id: EntityId, record: &E) -> Result<()> {
        let keys = E::natural_key_columns();
        let values: Vec<(&str, Value)> = record
            .column_values()
            .into_iter()
            .filter(|(c, _)| !keys.contains(c))
            .collect();
        if values.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = values
            .iter()
            .map(|(c, _)| format!("{} = ?", quote_ident(c)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.table(E::KIND),
            assignments.join(", "),
            quote_ident(E::KIND.id_column())
        );
        let params: Vec<Value> = values
            .into_iter()
            .map(|(_, v)| v)
            .chain(std::iter::once(Value::Integer(id)))
            .collect();
        let updated = self.conn.execute(&sql, params_from_iter(params))?;
        if updated == 0 {
            return Err(SiteMergeError::NotFound(format!("{} {id}", E::KIND)));
        }
        Ok(())
    }

    /// Whether row `id` already holds every non-key value of `record`.
    pub fn matches_attributes<E: Entity>(&self, id: EntityId, record: &E) -> Result<bool> {
        let keys = E::natural_key_columns();
        let values: Vec<(&str, Value)> = record
            .column_values()
            .into_iter()
            .filter(|(c, _)| !keys.contains(c))
            .collect();
        let mut conditions = vec![format!("{} = ?", quote_ident(E::KIND.id_column()))];
        conditions.extend(values.iter().map(|(c, _)| format!("{} IS ?", quote_ident(c))));
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.table(E::KIND),
            conditions.join(" AND ")
        );
        let params: Vec<Value> = std::iter::once(Value::Integer(id))
            .chain(values.into_iter().map(|(_, v)| v))
            .collect();
        let n: i64 = self.conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(n > 0)
    }

    /// Row whose natural key equals the record's, compared NULL-safely. Rows in
    /// `preferred` win over any other match, then rows not marked INACTIVE;
    /// ties break on lowest id.
    pub fn find_by_natural_key<E: Entity>(
        &self,
        record: &E,
        preferred: &[EntityId],
    ) -> Result<Option<EntityId>> {
        let key = record.natural_key();
        let conditions: Vec<String> = key
            .iter()
            .map(|(c, _)| format!("{} IS ?", quote_ident(c)))
            .collect();
        let id_col = quote_ident(E::KIND.id_column());
        let mut order = Vec::new();
        if !preferred.is_empty() {
            order.push(format!(
                "CASE WHEN {id_col} IN ({}) THEN 0 ELSE 1 END",
                vec!["?"; preferred.len()].join(", ")
            ));
        }
        if self.has_status(E::KIND)? {
            order.push(format!("status IS '{STATUS_INACTIVE}'"));
        }
        order.push(id_col.clone());
        let sql = format!(
            "SELECT {id_col} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            self.table(E::KIND),
            conditions.join(" AND "),
            order.join(", ")
        );
        let params: Vec<Value> = key
            .into_iter()
            .map(|(_, v)| v)
            .chain(preferred.iter().map(|id| Value::Integer(*id)))
            .collect();

        let result = self
            .conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0));
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn has_status(&self, kind: EntityKind) -> Result<bool> {
        SchemaGraph::new(self.conn, &self.schema).has_column(kind.table(), "status")
    }

    /// True when the row exists and carries the INACTIVE status.
    pub fn is_inactive(&self, kind: EntityKind, id: EntityId) -> Result<bool> {
        if !self.has_status(kind)? {
            return Ok(false);
        }
        let sql = format!(
            "SELECT status IS '{STATUS_INACTIVE}' FROM {} WHERE {} = ?1",
            self.table(kind),
            quote_ident(kind.id_column())
        );
        match self.conn.query_row(&sql, params![id], |row| row.get(0)) {
            Ok(inactive) => Ok(inactive),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every column of the row as a JSON object, for archiving.
    pub fn snapshot(&self, kind: EntityKind, id: EntityId) -> Result<JsonValue> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1",
            self.table(kind),
            quote_ident(kind.id_column())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Err(SiteMergeError::NotFound(format!("{kind} {id}")));
        };

        let mut object = Map::new();
        for (i, name) in names.into_iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => JsonValue::Null,
                ValueRef::Integer(n) => JsonValue::from(n),
                ValueRef::Real(f) => JsonValue::from(f),
                ValueRef::Text(t) => JsonValue::from(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => JsonValue::from(b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
            };
            object.insert(name, value);
        }
        Ok(JsonValue::Object(object))
    }

    pub(crate) fn set_status(&self, kind: EntityKind, id: EntityId, status: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?1 WHERE {} = ?2",
            self.table(kind),
            quote_ident(kind.id_column())
        );
        self.conn.execute(&sql, params![status, id])?;
        Ok(())
    }

    pub(crate) fn delete(&self, kind: EntityKind, id: EntityId) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            self.table(kind),
            quote_ident(kind.id_column())
        );
        let deleted = self.conn.execute(&sql, params![id])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, Facility};
    use crate::storage::database::open_in_memory;

    #[test]
    fn natural_key_is_null_safe_and_prefers_members() {
        let pool = open_in_memory().unwrap();
        let conn = pool.get_connection();
        let store = EntityStore::new(&conn, "main");

        let acme = store.insert(&Company::new("Acme")).unwrap();
        let mut no_city = Facility::new("Elevator").with_company(acme);
        no_city.state = Some("KS".to_string());
        let a = store.insert(&no_city).unwrap();
        let b = store.insert(&no_city).unwrap();

        assert_eq!(store.find_by_natural_key(&no_city, &[]).unwrap(), Some(a));
        assert_eq!(store.find_by_natural_key(&no_city, &[b]).unwrap(), Some(b));

        let elsewhere = Facility::new("Elevator").with_company(acme).with_place("Hays", "KS");
        assert_eq!(store.find_by_natural_key(&elsewhere, &[a, b]).unwrap(), None);
    }

    #[test]
    fn natural_key_prefers_live_rows_over_retired_ones() {
        let pool = open_in_memory().unwrap();
        let conn = pool.get_connection();
        let store = EntityStore::new(&conn, "main");

        let acme = store.insert(&Company::new("Acme")).unwrap();
        let mut no_city = Facility::new("Elevator").with_company(acme);
        no_city.state = Some("KS".to_string());
        let retired = store.insert(&no_city).unwrap();
        let live = store.insert(&no_city).unwrap();
        store.set_status(EntityKind::Facility, retired, STATUS_INACTIVE).unwrap();

        assert_eq!(store.find_by_natural_key(&no_city, &[]).unwrap(), Some(live));
        assert_eq!(store.find_by_natural_key(&no_city, &[retired]).unwrap(), Some(retired));
        assert!(store.is_inactive(EntityKind::Facility, retired).unwrap());
        assert!(!store.is_inactive(EntityKind::Facility, live).unwrap());
        assert!(!store.is_inactive(EntityKind::Company, acme).unwrap());
    }

    #[test]
    fn update_leaves_natural_key_alone() {
        let pool = open_in_memory().unwrap();
        let conn = pool.get_connection();
        let store = EntityStore::new(&conn, "main");

        let id = store.insert(&Company::new("Acme")).unwrap();
        let mut changed = Company::new("Acme Renamed");
        changed.notes = Some("merged".to_string());
        store.update_attributes(id, &changed).unwrap();

        let snap = store.snapshot(EntityKind::Company, id).unwrap();
        assert_eq!(snap["name"], "Acme");
        assert_eq!(snap["notes"], "merged");
        assert_eq!(snap["company_id"], id);
    }

    #[test]
    fn snapshot_of_missing_row_is_not_found() {
        let pool = open_in_memory().unwrap();
        let conn = pool.get_connection();
        let store = EntityStore::new(&conn, "main");
        assert!(matches!(
            store.snapshot(EntityKind::Facility, 404),
            Err(SiteMergeError::NotFound(_))
        ));
    }
}
