use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sitemerge_core::config::GeocodeConfig;

use crate::error::{GeoError, Result};
use crate::http::RateLimitedClient;

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const GOOGLE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Top hit of a geocoding lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoResult {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
}

/// Free-text address lookup. `Ok(None)` means the backend answered with no match.
#[async_trait]
pub trait Geocoder: Send + Sync {
    fn name(&self) -> &'static str;

    async fn geocode(&self, query: &str) -> Result<Option<GeoResult>>;
}

/// Build the backend named in the config. Google needs its key in the
/// configured environment variable.
pub fn from_config(config: &GeocodeConfig) -> Result<Box<dyn Geocoder>> {
    match config.backend.trim().to_lowercase().as_str() {
        "nominatim" => {
            let user_agent = std::env::var("NOMINATIM_USER_AGENT")
                .ok()
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or_else(|| config.user_agent.clone());
            Ok(Box::new(NominatimGeocoder::new(
                client_for(config, &user_agent)?,
                &config.country_codes,
            )))
        }
        "google" => {
            let key = std::env::var(&config.google_api_key_env)
                .ok()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    GeoError::config(format!(
                        "google backend selected but {} is not set",
                        config.google_api_key_env
                    ))
                })?;
            Ok(Box::new(GoogleGeocoder::new(client_for(config, &config.user_agent)?, key)))
        }
        other => Err(GeoError::config(format!("unknown geocoder backend: {other}"))),
    }
}

fn client_for(config: &GeocodeConfig, user_agent: &str) -> Result<RateLimitedClient> {
    RateLimitedClient::new(
        Duration::from_millis(config.min_interval_ms),
        config.max_retries,
        user_agent,
        Duration::from_secs(config.timeout_secs),
    )
}

// ─── Nominatim ────────────────────────────────────────────────────────────────

pub struct NominatimGeocoder {
    client: RateLimitedClient,
    country_codes: String,
}

impl NominatimGeocoder {
    pub fn new(client: RateLimitedClient, country_codes: &str) -> Self {
        Self {
            client,
            country_codes: country_codes.to_string(),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, query: &str) -> Result<Option<GeoResult>> {
        let params = [
            ("q", query),
            ("format", "json"),
            ("limit", "1"),
            ("addressdetails", "1"),
            ("countrycodes", self.country_codes.as_str()),
        ];
        let json: Value = self.client.get_json(NOMINATIM_URL, &params).await?;
        parse_nominatim(&json)
    }
}

/// Nominatim answers with an array of places; coordinates arrive as strings.
pub fn parse_nominatim(json: &Value) -> Result<Option<GeoResult>> {
    let Some(top) = json.as_array().and_then(|arr| arr.first()) else {
        return Ok(None);
    };
    Ok(Some(GeoResult {
        lat: number_field(top, "lat")?,
        lon: number_field(top, "lon")?,
        display_name: top
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }))
}

// ─── Google ───────────────────────────────────────────────────────────────────

pub struct GoogleGeocoder {
    client: RateLimitedClient,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(client: RateLimitedClient, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, query: &str) -> Result<Option<GeoResult>> {
        let params = [("address", query), ("key", self.api_key.as_str())];
        let json: Value = self.client.get_json(GOOGLE_URL, &params).await?;
        parse_google(&json)
    }
}

/// Anything but `status = "OK"` with at least one result is a miss.
pub fn parse_google(json: &Value) -> Result<Option<GeoResult>> {
    if json.get("status").and_then(Value::as_str) != Some("OK") {
        return Ok(None);
    }
    let Some(top) = json.get("results").and_then(Value::as_array).and_then(|r| r.first()) else {
        return Ok(None);
    };
    let location = top
        .get("geometry")
        .and_then(|g| g.get("location"))
        .ok_or_else(|| GeoError::Parse("google result without geometry.location".to_string()))?;
    Ok(Some(GeoResult {
        lat: number_field(location, "lat")?,
        lon: number_field(location, "lng")?,
        display_name: top
            .get("formatted_address")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }))
}

fn number_field(v: &Value, key: &str) -> Result<f64> {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| GeoError::Parse(format!("missing or invalid `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nominatim_top_hit_is_parsed() {
        let body = json!([
            {"lat": "38.8403", "lon": "-97.6114", "display_name": "Salina, Saline County, Kansas"},
            {"lat": "1", "lon": "1", "display_name": "ignored"}
        ]);
        let hit = parse_nominatim(&body).unwrap().unwrap();
        assert_eq!(hit.lat, 38.8403);
        assert_eq!(hit.lon, -97.6114);
        assert!(hit.display_name.starts_with("Salina"));
    }

    #[test]
    fn nominatim_empty_array_is_no_result() {
        assert_eq!(parse_nominatim(&json!([])).unwrap(), None);
    }

    #[test]
    fn nominatim_bad_coordinate_is_parse_error() {
        let err = parse_nominatim(&json!([{"lat": "north", "lon": "1"}])).unwrap_err();
        assert!(matches!(err, GeoError::Parse(_)));
    }

    #[test]
    fn google_ok_result_is_parsed() {
        let body = json!({
            "status": "OK",
            "results": [{
                "formatted_address": "100 Main St, Hays, KS 67601, USA",
                "geometry": {"location": {"lat": 38.879, "lng": -99.327}}
            }]
        });
        let hit = parse_google(&body).unwrap().unwrap();
        assert_eq!(hit.lon, -99.327);
        assert_eq!(hit.display_name, "100 Main St, Hays, KS 67601, USA");
    }

    #[test]
    fn google_zero_results_is_no_result() {
        let body = json!({"status": "ZERO_RESULTS", "results": []});
        assert_eq!(parse_google(&body).unwrap(), None);
    }

    #[test]
    fn unknown_backend_is_config_error() {
        let config = GeocodeConfig {
            backend: "mapquest".to_string(),
            ..GeocodeConfig::default()
        };
        let err = from_config(&config).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn google_without_key_is_config_error() {
        let config = GeocodeConfig {
            backend: "google".to_string(),
            google_api_key_env: "SITEMERGE_TEST_UNSET_GOOGLE_KEY".to_string(),
            ..GeocodeConfig::default()
        };
        let err = from_config(&config).err().unwrap();
        assert!(err.is_config());
    }
}
