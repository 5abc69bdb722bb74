use std::collections::HashMap;

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, params};

use crate::error::Result;
use crate::models::{EntityId, Facility, Row};
use crate::storage::schema_graph::quote_ident;

const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance in metres between two WGS84 points.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Registers `st_distance_m(lat1, lon1, lat2, lon2)`; NULL in, NULL out.
pub fn register_distance_function(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "st_distance_m",
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let lat1: Option<f64> = ctx.get(0)?;
            let lon1: Option<f64> = ctx.get(1)?;
            let lat2: Option<f64> = ctx.get(2)?;
            let lon2: Option<f64> = ctx.get(3)?;
            Ok(match (lat1, lon1, lat2, lon2) {
                (Some(a), Some(b), Some(c), Some(d)) => Some(haversine_m(a, b, c, d)),
                _ => None,
            })
        },
    )?;
    Ok(())
}

/// Distance between two dependent rows, `None` when either has no coordinates.
pub trait DistanceOracle {
    fn distance_m(&self, a: EntityId, b: EntityId) -> Result<Option<f64>>;
}

/// Asks the store: `st_distance_m` over the two facility rows.
pub struct SqlDistance<'a> {
    conn: &'a Connection,
    schema: String,
}

impl<'a> SqlDistance<'a> {
    pub fn new(conn: &'a Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }
}

impl DistanceOracle for SqlDistance<'_> {
    fn distance_m(&self, a: EntityId, b: EntityId) -> Result<Option<f64>> {
        let table = format!("{}.facility", quote_ident(&self.schema));
        let sql = format!(
            "SELECT st_distance_m(a.latitude, a.longitude, b.latitude, b.longitude)
             FROM {table} a, {table} b
             WHERE a.facility_id = ?1 AND b.facility_id = ?2"
        );
        let result = self.conn.query_row(&sql, params![a, b], |row| row.get(0));
        match result {
            Ok(d) => Ok(d),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process oracle over a snapshot of rows; same formula as the SQL function.
#[derive(Debug, Default)]
pub struct Haversine {
    points: HashMap<EntityId, (f64, f64)>,
}

impl Haversine {
    pub fn from_rows(rows: &[Row<Facility>]) -> Self {
        let points = rows
            .iter()
            .filter_map(|r| Some((r.id, (r.record.latitude?, r.record.longitude?))))
            .collect();
        Self { points }
    }
}

impl DistanceOracle for Haversine {
    fn distance_m(&self, a: EntityId, b: EntityId) -> Result<Option<f64>> {
        Ok(match (self.points.get(&a), self.points.get(&b)) {
            (Some(&(lat1, lon1)), Some(&(lat2, lon2))) => Some(haversine_m(lat1, lon1, lat2, lon2)),
            _ => None,
        })
    }
}
