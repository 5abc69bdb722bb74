//! Live-schema view of who references whom. Dependents are never listed by
//! hand: every merge asks the catalog which columns point at the table being
//! merged, then moves those pointers.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::models::EntityId;

/// A single-column foreign key from `table.column` to `referenced_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyReference {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    /// For every unique index on `table` that includes `column`, the other
    /// columns of that index. Repointing must not create a duplicate tuple
    /// under any of them.
    pub unique_partners: Vec<Vec<String>>,
}

impl fmt::Display for ForeignKeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// A dependent row left on the losing record because moving it would
/// duplicate a unique tuple already present on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepointConflict {
    pub rowid: i64,
    pub from_id: EntityId,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Hashable, NULL-safe form of a column value: two NULLs compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyPart {
    Null,
    Integer(i64),
    Real(u64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for KeyPart {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => KeyPart::Null,
            ValueRef::Integer(i) => KeyPart::Integer(i),
            ValueRef::Real(f) => KeyPart::Real(f.to_bits()),
            ValueRef::Text(t) => KeyPart::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => KeyPart::Blob(b.to_vec()),
        }
    }
}

pub struct SchemaGraph<'c> {
    conn: &'c Connection,
    schema: String,
}

impl<'c> SchemaGraph<'c> {
    pub fn new(conn: &'c Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
            quote_ident(&self.schema)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            quote_ident(&self.schema)
        );
        Ok(self.conn.prepare(&sql)?.exists([table])?)
    }

    pub fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid")?;
        let rows = stmt.query_map([table, self.schema.as_str()], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                decl_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                primary_key: row.get::<_, i64>(3)? != 0,
            })
        })?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .columns(table)?
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column)))
    }

    /// NOT NULL columns other than the primary key.
    pub fn required_columns(&self, table: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .columns(table)?
            .into_iter()
            .filter(|c| c.not_null && !c.primary_key)
            .map(|c| c.name)
            .collect())
    }

    /// Every single-column foreign key in the schema that targets `table`.
    /// Composite foreign keys are skipped. An empty result means nothing
    /// depends on `table`, which is not an error.
    pub fn references_to(&self, table: &str) -> Result<Vec<ForeignKeyReference>> {
        let mut refs = Vec::new();
        for child in self.table_names()? {
            let mut stmt = self.conn.prepare(
                "SELECT id, \"table\", \"from\" FROM pragma_foreign_key_list(?1, ?2) ORDER BY id, seq",
            )?;
            let rows = stmt.query_map([child.as_str(), self.schema.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut by_id: BTreeMap<i64, Vec<(String, String)>> = BTreeMap::new();
            for row in rows {
                let (id, parent, from) = row?;
                by_id.entry(id).or_default().push((parent, from));
            }

            for (_, columns) in by_id {
                if columns.len() != 1 {
                    debug!(table = %child, "skipping composite foreign key");
                    continue;
                }
                let (parent, from) = &columns[0];
                if !parent.eq_ignore_ascii_case(table) {
                    continue;
                }
                refs.push(ForeignKeyReference {
                    schema: self.schema.clone(),
                    table: child.clone(),
                    column: from.clone(),
                    referenced_table: table.to_string(),
                    unique_partners: self.unique_partners(&child, from)?,
                });
            }
        }
        refs.sort_by(|a, b| (&a.table, &a.column).cmp(&(&b.table, &b.column)));
        Ok(refs)
    }

    fn unique_partners(&self, table: &str, column: &str) -> Result<Vec<Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, \"unique\", partial FROM pragma_index_list(?1, ?2)")?;
        let rows = stmt.query_map([table, self.schema.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, i64>(2)? != 0,
            ))
        })?;
        let mut indexes = Vec::new();
        for row in rows {
            let (name, unique, partial) = row?;
            if unique && !partial {
                indexes.push(name);
            }
        }
        indexes.sort();

        let mut partners = Vec::new();
        for index in indexes {
            let mut stmt = self
                .conn
                .prepare("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")?;
            let rows = stmt.query_map([index.as_str(), self.schema.as_str()], |row| {
                row.get::<_, Option<String>>(0)
            })?;
            let mut cols = Vec::new();
            for row in rows {
                // Expression index columns have no name; such an index cannot be reasoned about here.
                match row? {
                    Some(c) => cols.push(c),
                    None => {
                        cols.clear();
                        break;
                    }
                }
            }
            if !cols.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                continue;
            }
            let others: Vec<String> = cols
                .into_iter()
                .filter(|c| !c.eq_ignore_ascii_case(column))
                .collect();
            if !partners.contains(&others) {
                partners.push(others);
            }
        }
        Ok(partners)
    }

    pub fn count_dependents(&self, r: &ForeignKeyReference, ids: &[EntityId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} IN ({})",
            self.qualified(&r.table),
            quote_ident(&r.column),
            placeholders(ids.len())
        );
        let n: i64 = self
            .conn
            .query_row(&sql, params_from_iter(ids.iter()), |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Moves every `r` row pointing at one of `ids` onto `new_id`, except the
    /// rows named in `excluded_rowids`. Returns the number of rows moved.
    pub fn repoint_dependents(
        &self,
        r: &ForeignKeyReference,
        ids: &[EntityId],
        new_id: EntityId,
        excluded_rowids: &[i64],
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut sql = format!(
            "UPDATE {} SET {col} = ? WHERE {col} IN ({})",
            self.qualified(&r.table),
            placeholders(ids.len()),
            col = quote_ident(&r.column),
        );
        if !excluded_rowids.is_empty() {
            sql.push_str(&format!(" AND rowid NOT IN ({})", placeholders(excluded_rowids.len())));
        }
        let params: Vec<Value> = std::iter::once(new_id)
            .chain(ids.iter().copied())
            .chain(excluded_rowids.iter().copied())
            .map(Value::Integer)
            .collect();
        Ok(self.conn.execute(&sql, params_from_iter(params))?)
    }

    /// Rows of `r` that cannot move from `losing_ids` to `target_id` without
    /// duplicating a unique tuple. A tuple is taken if a row already on the
    /// target holds it, or if an earlier (lower rowid) losing row claimed it.
    /// With no target yet (a record still to be inserted) only the losing rows
    /// can collide.
    pub fn find_repoint_conflicts(
        &self,
        r: &ForeignKeyReference,
        losing_ids: &[EntityId],
        target_id: Option<EntityId>,
    ) -> Result<Vec<RepointConflict>> {
        if r.unique_partners.is_empty() || losing_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut columns: Vec<&str> = Vec::new();
        for set in &r.unique_partners {
            for c in set {
                if !columns.contains(&c.as_str()) {
                    columns.push(c);
                }
            }
        }
        let positions: Vec<Vec<usize>> = r
            .unique_partners
            .iter()
            .map(|set| {
                set.iter()
                    .filter_map(|c| columns.iter().position(|x| x == c))
                    .collect()
            })
            .collect();

        let select_cols: String = columns
            .iter()
            .map(|c| format!(", {}", quote_ident(c)))
            .collect();
        let sql = format!(
            "SELECT rowid, {fk}{select_cols} FROM {table} WHERE {fk} IN ({}) ORDER BY rowid",
            placeholders(losing_ids.len() + usize::from(target_id.is_some())),
            fk = quote_ident(&r.column),
            table = self.qualified(&r.table),
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let params: Vec<i64> = target_id.into_iter().chain(losing_ids.iter().copied()).collect();
        let mut rows = stmt.query(params_from_iter(params))?;

        let mut on_target: Vec<(i64, Vec<KeyPart>)> = Vec::new();
        let mut losing: Vec<(i64, EntityId, Vec<KeyPart>)> = Vec::new();
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let fk: EntityId = row.get(1)?;
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(KeyPart::from(row.get_ref(i + 2)?));
            }
            if Some(fk) == target_id {
                on_target.push((rowid, values));
            } else {
                losing.push((rowid, fk, values));
            }
        }

        let key_of = |set: usize, values: &[KeyPart]| -> (usize, Vec<KeyPart>) {
            (set, positions[set].iter().map(|&i| values[i].clone()).collect())
        };

        let mut taken: HashSet<(usize, Vec<KeyPart>)> = HashSet::new();
        for (_, values) in &on_target {
            for set in 0..positions.len() {
                taken.insert(key_of(set, values));
            }
        }

        let mut conflicts = Vec::new();
        for (rowid, fk, values) in losing {
            let keys: Vec<_> = (0..positions.len()).map(|set| key_of(set, &values)).collect();
            if keys.iter().any(|k| taken.contains(k)) {
                conflicts.push(RepointConflict { rowid, from_id: fk });
            } else {
                taken.extend(keys);
            }
        }
        Ok(conflicts)
    }
}
