//! Provider Catalog
//!
//! Static lookup data for the gateway:
//! - model id → provider name
//! - provider name → OpenAI-compatible base URL
//! - `provider:model` → price entry
//! - the sponsored free tier
//!
//! Loaded once at startup (built-in JSON or a JSON/YAML file) and shared read-only.

use crate::pricing::{ModelPrice, PriceTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const BUILTIN_CATALOG: &str = include_str!("../config/catalog.json");

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid catalog: {0}")]
    Invalid(String),
}

/// Sponsored tier reachable through a reserved model token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FreeTier {
    /// Model identifier callers send to select the tier
    #[serde(default = "default_free_token")]
    pub token: String,
    pub model: String,
    pub provider: String,
    pub base_url: String,
    /// Environment variable holding the tier's upstream key
    #[serde(default = "default_free_key_env")]
    pub api_key_env: String,
}

fn default_free_token() -> String {
    "free".to_string()
}

fn default_free_key_env() -> String {
    "FREE_MODEL_API_KEY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub free_tier: FreeTier,
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub providers: HashMap<String, String>,
    #[serde(default)]
    pub prices: HashMap<String, ModelPrice>,
}

/// Table sizes, reported on `/status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogStats {
    pub models: usize,
    pub providers: usize,
    pub prices: usize,
}

impl Catalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json_str(BUILTIN_CATALOG)
    }

    pub fn from_json_str(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_yaml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load from a file; `.yaml`/`.yml` is parsed as YAML, anything else as JSON.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// `TOLLGATE_CATALOG_PATH` if set, otherwise the built-in catalog.
    pub fn from_env() -> Result<Self, CatalogError> {
        match std::env::var("TOLLGATE_CATALOG_PATH") {
            Ok(path) if !path.trim().is_empty() => {
                let catalog = Self::load_from_file(path.trim())?;
                tracing::info!("Loaded provider catalog from {}", path.trim());
                Ok(catalog)
            }
            _ => Self::builtin(),
        }
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let free = &self.free_tier;
        if free.token.trim().is_empty() {
            return Err(CatalogError::Invalid("free_tier.token is empty".into()));
        }
        if free.base_url.trim().is_empty() {
            return Err(CatalogError::Invalid("free_tier.base_url is empty".into()));
        }
        if let Some(bad) = self.prices.keys().find(|k| !k.contains(':')) {
            return Err(CatalogError::Invalid(format!(
                "price key '{}' is not of the form provider:model",
                bad
            )));
        }

        let orphaned = self
            .models
            .values()
            .filter(|p| !self.providers.contains_key(p.as_str()))
            .count();
        if orphaned > 0 {
            tracing::warn!(
                "{} catalog models map to providers without a base URL",
                orphaned
            );
        }
        Ok(())
    }

    pub fn price_table(&self) -> PriceTable {
        PriceTable::new(self.prices.clone())
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            models: self.models.len(),
            providers: self.providers.len(),
            prices: self.prices.len(),
        }
    }
}
