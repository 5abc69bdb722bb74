//! Lookup strings for a facility, best first.

use std::fmt;

use serde::Serialize;
use sitemerge_core::Facility;
use sitemerge_core::normalize::{looks_like_unusable_street, norm_ws, normalize_street};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Street line(s) plus place.
    Address,
    /// Town centre: city, state and postal code only.
    CityState,
}

impl QueryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryMode::Address => "address",
            QueryMode::CityState => "city_state",
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoQuery {
    pub text: String,
    pub mode: QueryMode,
}

/// Street query first when the street is deliverable, then the town-centre
/// fallback when both city and state are known. Empty when neither applies.
pub fn build_queries(facility: &Facility) -> Vec<GeoQuery> {
    let street1 = cleaned(facility.address_line1.as_deref().map(normalize_street));
    let street2 = cleaned(facility.address_line2.as_deref().map(normalize_street));
    let city = cleaned(facility.city.as_deref().map(norm_ws));
    let state = cleaned(facility.state.as_deref().map(|s| s.trim().to_uppercase()));
    let postal = cleaned(facility.postal_code.as_deref().map(norm_ws));

    let city_state = [&city, &state, &postal]
        .into_iter()
        .flatten()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let has_place = city.is_some() && state.is_some();

    let mut queries = Vec::new();
    if let Some(street) = street1.as_deref()
        && !looks_like_unusable_street(street)
    {
        let text = [&street1, &street2, &city, &state, &postal]
            .into_iter()
            .flatten()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        queries.push(GeoQuery {
            text,
            mode: QueryMode::Address,
        });
    }
    if has_place {
        queries.push(GeoQuery {
            text: city_state,
            mode: QueryMode::CityState,
        });
    }
    queries
}

fn cleaned(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
