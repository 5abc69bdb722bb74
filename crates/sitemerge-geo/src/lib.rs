pub mod error;
pub mod geocoder;
pub mod http;
pub mod queries;
pub mod repair;

pub use error::{GeoError, Result};
pub use geocoder::{GeoResult, Geocoder, GoogleGeocoder, NominatimGeocoder};
pub use queries::{GeoQuery, QueryMode, build_queries};
pub use repair::{RepairJob, RepairLogRow, RepairOptions, RepairStatus, RepairSummary};
