//! Re-geocode facilities whose coordinates are missing or implausible.

use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;
use sitemerge_core::config::SiteMergeConfig;
use sitemerge_core::normalize::is_implausible_coordinate;
use sitemerge_core::storage::repositories::{Repository, SqliteFacilityRepository};
use sitemerge_core::storage::{ConnectionPool, SchemaGraph, quote_ident};
use sitemerge_core::{EntityId, Facility, Row, SiteMergeError};
use tracing::{debug, info, warn};

use crate::error::{GeoError, Result};
use crate::geocoder::{GeoResult, Geocoder};
use crate::queries::{GeoQuery, QueryMode, build_queries};

const COORDINATE_EPSILON: f64 = 1e-6;
const PROGRESS_EVERY: usize = 25;

const IMPLAUSIBLE_COORDINATES: &str = "(latitude IS NULL OR longitude IS NULL \
     OR latitude = 0 OR longitude = 0 \
     OR latitude NOT BETWEEN -90 AND 90 \
     OR longitude NOT BETWEEN -180 AND 180)";

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub dry_run: bool,
    /// Select every facility and write even when the result is unchanged.
    pub overwrite: bool,
    /// Only rows whose coordinates did not come from geocoding.
    pub unflagged_only: bool,
    /// Operator-supplied SQL predicate.
    pub filter: Option<String>,
    pub not_updated_after: Option<NaiveDate>,
    pub limit: usize,
    pub schema: String,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            overwrite: false,
            unflagged_only: false,
            filter: None,
            not_updated_after: None,
            limit: 500,
            schema: "main".to_string(),
        }
    }
}

impl RepairOptions {
    pub fn from_config(config: &SiteMergeConfig) -> Self {
        Self {
            schema: config.database.schema.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairStatus {
    Updated,
    Unchanged,
    NoResult,
    NoQuery,
    DryRun,
    Error(String),
    DbError(String),
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairStatus::Updated => f.write_str("UPDATED"),
            RepairStatus::Unchanged => f.write_str("UNCHANGED"),
            RepairStatus::NoResult => f.write_str("NO_RESULT"),
            RepairStatus::NoQuery => f.write_str("NO_QUERY"),
            RepairStatus::DryRun => f.write_str("DRY_RUN"),
            RepairStatus::Error(e) => write!(f, "ERROR: {e}"),
            RepairStatus::DbError(e) => write!(f, "DB_ERROR: {e}"),
        }
    }
}

/// One line of the CSV log. Column order is the header order.
#[derive(Debug, Clone, Serialize)]
pub struct RepairLogRow {
    pub facility_id: EntityId,
    pub name: String,
    pub mode_used: String,
    pub query_used: String,
    pub geocoder_backend: String,
    pub old_lat: Option<f64>,
    pub old_lon: Option<f64>,
    pub new_lat: Option<f64>,
    pub new_lon: Option<f64>,
    pub old_geom_from_address: bool,
    pub new_geom_from_address: bool,
    pub display_name: String,
    pub status: String,
}

impl RepairLogRow {
    fn new(row: &Row<Facility>, backend: &str, status: RepairStatus) -> Self {
        Self {
            facility_id: row.id,
            name: row.record.name.clone(),
            mode_used: String::new(),
            query_used: String::new(),
            geocoder_backend: backend.to_string(),
            old_lat: row.record.latitude,
            old_lon: row.record.longitude,
            new_lat: None,
            new_lon: None,
            old_geom_from_address: row.record.geom_from_address,
            new_geom_from_address: row.record.geom_from_address,
            display_name: String::new(),
            status: status.to_string(),
        }
    }

    fn with_query(mut self, query: &GeoQuery) -> Self {
        self.mode_used = query.mode.to_string();
        self.query_used = query.text.clone();
        self
    }

    fn with_result(mut self, result: &GeoResult) -> Self {
        self.new_lat = Some(result.lat);
        self.new_lon = Some(result.lon);
        self.display_name = result.display_name.clone();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub selected: usize,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
}

pub struct RepairJob<'a> {
    pool: &'a ConnectionPool,
    geocoder: &'a dyn Geocoder,
    options: RepairOptions,
}

impl<'a> RepairJob<'a> {
    pub fn new(pool: &'a ConnectionPool, geocoder: &'a dyn Geocoder, options: RepairOptions) -> Self {
        Self {
            pool,
            geocoder,
            options,
        }
    }

    /// Run with the CSV log written to `path`, replacing any previous log.
    pub async fn run_to_path(&self, path: &Path) -> Result<RepairSummary> {
        let mut log = csv::Writer::from_path(path)?;
        self.run(&mut log).await
    }

    /// Walk the selected facilities, one lookup chain per row, logging every
    /// outcome. The database lock is only taken between lookups.
    pub async fn run<W: Write>(&self, log: &mut csv::Writer<W>) -> Result<RepairSummary> {
        let (facilities, stamp_updated_at) = {
            let conn = self.pool.get_connection();
            self.select(&conn)?
        };
        let backend = self.geocoder.name();
        let mut summary = RepairSummary {
            selected: facilities.len(),
            ..RepairSummary::default()
        };
        info!(selected = summary.selected, backend, dry_run = self.options.dry_run, "coordinate repair started");

        for row in &facilities {
            summary.processed += 1;
            if summary.processed % PROGRESS_EVERY == 0 {
                info!(
                    processed = summary.processed,
                    total = summary.selected,
                    updated = summary.updated,
                    skipped = summary.skipped,
                    "coordinate repair progress"
                );
            }

            let entry = self.repair_one(row, backend, stamp_updated_at, log).await?;
            if entry.status == RepairStatus::Updated.to_string() {
                summary.updated += 1;
            } else {
                summary.skipped += 1;
            }
            log.serialize(&entry)?;
        }
        log.flush()?;

        info!(
            processed = summary.processed,
            updated = summary.updated,
            skipped = summary.skipped,
            "coordinate repair finished"
        );
        Ok(summary)
    }

    async fn repair_one<W: Write>(
        &self,
        row: &Row<Facility>,
        backend: &str,
        stamp_updated_at: bool,
        log: &mut csv::Writer<W>,
    ) -> Result<RepairLogRow> {
        let queries = build_queries(&row.record);
        if queries.is_empty() {
            return Ok(RepairLogRow::new(row, backend, RepairStatus::NoQuery));
        }

        let mut hit = None;
        for query in &queries {
            match self.geocoder.geocode(&query.text).await {
                Ok(Some(result)) => {
                    hit = Some((query, result));
                    break;
                }
                Ok(None) => debug!(facility_id = row.id, query = %query.text, "no match"),
                Err(e) => {
                    warn!(facility_id = row.id, query = %query.text, error = %e, "geocoding failed");
                    let entry = RepairLogRow::new(row, backend, RepairStatus::Error(e.to_string())).with_query(query);
                    log.serialize(&entry)?;
                }
            }
        }
        let Some((query, result)) = hit else {
            return Ok(RepairLogRow::new(row, backend, RepairStatus::NoResult));
        };

        let entry = RepairLogRow::new(row, backend, RepairStatus::Updated)
            .with_query(query)
            .with_result(&result);

        if self.is_unchanged(&row.record, query.mode, &result) {
            return Ok(RepairLogRow {
                status: RepairStatus::Unchanged.to_string(),
                ..entry
            });
        }
        if self.options.dry_run {
            return Ok(RepairLogRow {
                status: RepairStatus::DryRun.to_string(),
                ..entry
            });
        }

        let written = {
            let conn = self.pool.get_connection();
            write_coordinates(&conn, &self.options.schema, row.id, &result, stamp_updated_at)
        };
        match written {
            Ok(()) => Ok(RepairLogRow {
                new_geom_from_address: true,
                ..entry
            }),
            Err(e) => {
                warn!(facility_id = row.id, error = %e, "coordinate update rolled back");
                Ok(RepairLogRow {
                    status: RepairStatus::DbError(e.to_string()).to_string(),
                    ..entry
                })
            }
        }
    }

    /// Plausible coordinates that the lookup merely confirms are left alone.
    /// A town-centre hit always counts as a change.
    fn is_unchanged(&self, facility: &Facility, mode: QueryMode, result: &GeoResult) -> bool {
        if self.options.overwrite || mode == QueryMode::CityState {
            return false;
        }
        let (Some(lat), Some(lon)) = (facility.latitude, facility.longitude) else {
            return false;
        };
        !is_implausible_coordinate(Some(lat), Some(lon))
            && (lat - result.lat).abs() < COORDINATE_EPSILON
            && (lon - result.lon).abs() < COORDINATE_EPSILON
    }

    /// Candidate rows, ordered by id, plus whether the table carries `updated_at`.
    fn select(&self, conn: &Connection) -> Result<(Vec<Row<Facility>>, bool)> {
        let graph = SchemaGraph::new(conn, &self.options.schema);
        let has_updated_at = graph.has_column("facility", "updated_at")?;

        let mut conditions = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(filter) = self.options.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            conditions.push(format!("({filter})"));
        }
        if self.options.unflagged_only {
            conditions.push("geom_from_address = 0".to_string());
        }
        if let Some(date) = self.options.not_updated_after {
            if !has_updated_at {
                return Err(GeoError::config(
                    "--not-updated-after needs an updated_at column on facility",
                ));
            }
            conditions.push("updated_at < ?".to_string());
            params.push(SqlValue::Text(date.format("%Y-%m-%d").to_string()));
        }

        let predicate = if conditions.is_empty() {
            if self.options.overwrite {
                None
            } else {
                Some(IMPLAUSIBLE_COORDINATES.to_string())
            }
        } else {
            Some(conditions.join(" AND "))
        };
        let where_sql = predicate.map(|p| format!(" WHERE {p}")).unwrap_or_default();
        params.push(SqlValue::Integer(i64::try_from(self.options.limit).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT facility_id FROM {}{where_sql} ORDER BY facility_id LIMIT ?",
            graph.qualified("facility")
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, EntityId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let facilities = SqliteFacilityRepository::new(conn, &self.options.schema).find_by_ids(&ids)?;
        Ok((facilities, has_updated_at))
    }
}

fn write_coordinates(
    conn: &Connection,
    schema: &str,
    id: EntityId,
    result: &GeoResult,
    stamp_updated_at: bool,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let table = format!("{}.facility", quote_ident(schema));
    let changed = if stamp_updated_at {
        tx.execute(
            &format!(
                "UPDATE {table} SET latitude = ?1, longitude = ?2, geom_from_address = 1, updated_at = ?3 \
                 WHERE facility_id = ?4"
            ),
            params![result.lat, result.lon, Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(), id],
        )?
    } else {
        tx.execute(
            &format!("UPDATE {table} SET latitude = ?1, longitude = ?2, geom_from_address = 1 WHERE facility_id = ?3"),
            params![result.lat, result.lon, id],
        )?
    };
    if changed != 1 {
        return Err(SiteMergeError::NotFound(format!("facility {id}")).into());
    }
    tx.commit()?;
    Ok(())
}
