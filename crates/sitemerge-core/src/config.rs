use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteMergeError};

/// Root configuration, loaded from `~/.config/sitemerge/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteMergeConfig {
    pub database: DatabaseConfig,
    pub merge: MergeConfig,
    pub geocode: GeocodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub schema: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Clustering radius in metres.
    pub max_distance_m: f64,
    /// 0 = unlimited.
    pub limit_companies: usize,
    /// 0 = unlimited.
    pub limit_facilities: usize,
    pub proximity_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub backend: String,
    pub user_agent: String,
    pub country_codes: String,
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub google_api_key_env: String,
    pub log_csv: String,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            schema: "main".to_string(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_distance_m: 250.0,
            limit_companies: 0,
            limit_facilities: 0,
            proximity_pass: false,
        }
    }
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            backend: "nominatim".to_string(),
            user_agent: "sitemerge-geofix/0.1 (set NOMINATIM_USER_AGENT for production)".to_string(),
            country_codes: "us".to_string(),
            min_interval_ms: 1100,
            max_retries: 3,
            timeout_secs: 20,
            google_api_key_env: "GOOGLE_API_KEY".to_string(),
            log_csv: "facility_geofix_log.csv".to_string(),
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl SiteMergeConfig {
    /// Standard config file path: `~/.config/sitemerge/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SITEMERGE_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("sitemerge")
            .join("config.toml")
    }

    /// Load config from disk, falling back to defaults if the file doesn't exist.
    /// `SITEMERGE_DATABASE` overrides the configured database path.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(db) = std::env::var("SITEMERGE_DATABASE")
            && !db.trim().is_empty()
        {
            self.database.path = Some(db);
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    pub fn set_database_path(&mut self, path: impl Into<String>) {
        self.database.path = Some(path.into());
    }

    /// The database path is the one parameter every job needs; its absence is
    /// fatal before any database access.
    pub fn require_database_path(&self) -> Result<PathBuf> {
        match self.database.path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Ok(PathBuf::from(p)),
            _ => Err(SiteMergeError::ConfigError(
                "database path missing: pass --database, set SITEMERGE_DATABASE or database.path in config".to_string(),
            )),
        }
    }
}
