use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use super::{Entity, EntityId, EntityKind, display_float, int_value, real_value, text_value};

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const STATUS_INACTIVE: &str = "INACTIVE";

/// Dependent-kind record: a physical site owned by a company.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub company_id: Option<EntityId>,
    pub facility_type_id: Option<EntityId>,
    pub name: String,
    pub description: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: Option<String>,
    pub website_url: Option<String>,
    pub phone_main: Option<String>,
    pub email_main: Option<String>,
    pub notes: Option<String>,
    /// Provenance flag: coordinates came from geocoding the address.
    pub geom_from_address: bool,
    pub imported_source: Option<String>,
}

impl Facility {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Some(STATUS_ACTIVE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_company(mut self, company_id: EntityId) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn with_place(mut self, city: &str, state: &str) -> Self {
        self.city = Some(city.to_string());
        self.state = Some(state.to_string());
        self
    }

    pub fn with_address(mut self, line1: &str, postal_code: &str) -> Self {
        self.address_line1 = Some(line1.to_string());
        self.postal_code = Some(postal_code.to_string());
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn is_inactive(&self) -> bool {
        self.status.as_deref() == Some(STATUS_INACTIVE)
    }
}

impl Entity for Facility {
    const KIND: EntityKind = EntityKind::Facility;

    fn name(&self) -> &str {
        &self.name
    }

    fn column_values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("company_id", int_value(self.company_id)),
            ("facility_type_id", int_value(self.facility_type_id)),
            ("name", Value::Text(self.name.clone())),
            ("description", text_value(&self.description)),
            ("address_line1", text_value(&self.address_line1)),
            ("address_line2", text_value(&self.address_line2)),
            ("city", text_value(&self.city)),
            ("county", text_value(&self.county)),
            ("state", text_value(&self.state)),
            ("postal_code", text_value(&self.postal_code)),
            ("latitude", real_value(self.latitude)),
            ("longitude", real_value(self.longitude)),
            ("status", text_value(&self.status)),
            ("website_url", text_value(&self.website_url)),
            ("phone_main", text_value(&self.phone_main)),
            ("email_main", text_value(&self.email_main)),
            ("notes", text_value(&self.notes)),
            ("geom_from_address", Value::Integer(i64::from(self.geom_from_address))),
            ("imported_source", text_value(&self.imported_source)),
        ]
    }

    fn natural_key_columns() -> &'static [&'static str] {
        &["company_id", "name", "city", "state"]
    }

    fn display_fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("company_id", self.company_id.map(|v| v.to_string())),
            ("facility_type_id", self.facility_type_id.map(|v| v.to_string())),
            ("name", Some(self.name.clone())),
            ("address_line1", self.address_line1.clone()),
            ("address_line2", self.address_line2.clone()),
            ("city", self.city.clone()),
            ("county", self.county.clone()),
            ("state", self.state.clone()),
            ("postal_code", self.postal_code.clone()),
            ("website_url", self.website_url.clone()),
            ("phone_main", self.phone_main.clone()),
            ("email_main", self.email_main.clone()),
            ("description", self.description.clone()),
            ("notes", self.notes.clone()),
            ("imported_source", self.imported_source.clone()),
            ("latitude", display_float(self.latitude)),
            ("longitude", display_float(self.longitude)),
            ("status", self.status.clone()),
            ("geom_from_address", Some(self.geom_from_address.to_string())),
        ]
    }
}
