use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use super::{Entity, EntityKind, text_value};

/// Parent-kind record: an organization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub website_url: Option<String>,
    pub phone_main: Option<String>,
    pub notes: Option<String>,
}

impl Company {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Entity for Company {
    const KIND: EntityKind = EntityKind::Company;

    fn name(&self) -> &str {
        &self.name
    }

    fn column_values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", Value::Text(self.name.clone())),
            ("website_url", text_value(&self.website_url)),
            ("phone_main", text_value(&self.phone_main)),
            ("notes", text_value(&self.notes)),
        ]
    }

    fn natural_key_columns() -> &'static [&'static str] {
        &["name"]
    }

    fn display_fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("name", Some(self.name.clone())),
            ("website_url", self.website_url.clone()),
            ("phone_main", self.phone_main.clone()),
            ("notes", self.notes.clone()),
        ]
    }
}
