pub mod database;
pub mod repositories;
pub mod schema_graph;
pub mod spatial;

pub use database::{ConnectionPool, open_database, open_existing, open_in_memory};
pub use schema_graph::{ColumnInfo, ForeignKeyReference, RepointConflict, SchemaGraph, quote_ident};
pub use spatial::{DistanceOracle, Haversine, SqlDistance, haversine_m};
