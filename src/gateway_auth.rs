//! Gateway authentication
//!
//! Requests identify their gateway with `x-gateway-id` and prove it with
//! `x-gateway-authorization`. The authenticator runs before the orchestrator; the core
//! trusts whatever identity it returns.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub const GATEWAY_ID_HEADER: &str = "x-gateway-id";
pub const GATEWAY_SECRET_HEADER: &str = "x-gateway-authorization";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayAuthError {
    #[error("Missing gateway credentials")]
    MissingCredentials,
    #[error("Invalid Gateway ID or Authorization")]
    Rejected,
    #[error("Gateway directory error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedGateway {
    pub id: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait GatewayAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        gateway_id: Option<&str>,
        secret: Option<&str>,
    ) -> Result<AuthenticatedGateway, GatewayAuthError>;
}

struct DirectoryEntry {
    name: Option<String>,
    digest: [u8; 32],
}

/// Fixed set of gateways; only secret digests are kept in memory.
#[derive(Default)]
pub struct StaticGatewayDirectory {
    entries: HashMap<String, DirectoryEntry>,
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl StaticGatewayDirectory {
    pub fn new(records: impl IntoIterator<Item = GatewayRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|r| {
                (
                    r.id,
                    DirectoryEntry {
                        name: r.name,
                        digest: sha256(r.secret.as_bytes()),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `id:secret[,id:secret...]`.
    pub fn parse_pairs(raw: &str) -> Result<Vec<GatewayRecord>, GatewayAuthError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let (id, secret) = pair.split_once(':').ok_or_else(|| {
                    GatewayAuthError::Config(format!("expected id:secret, got '{}'", pair))
                })?;
                if id.trim().is_empty() || secret.trim().is_empty() {
                    return Err(GatewayAuthError::Config(
                        "gateway id and secret must be non-empty".into(),
                    ));
                }
                Ok(GatewayRecord {
                    id: id.trim().to_string(),
                    name: None,
                    secret: secret.trim().to_string(),
                })
            })
            .collect()
    }

    /// JSON or YAML list of `{id, name?, secret}`.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Vec<GatewayRecord>, GatewayAuthError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayAuthError::Config(format!("{}: {}", path.display(), e)))?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| GatewayAuthError::Config(e.to_string()))
        } else {
            serde_json::from_str(&content).map_err(|e| GatewayAuthError::Config(e.to_string()))
        }
    }

    /// Gateways from `TOLLGATE_GATEWAYS` and `TOLLGATE_GATEWAYS_PATH` combined.
    pub fn from_env() -> Result<Self, GatewayAuthError> {
        let mut records = Vec::new();
        if let Ok(raw) = std::env::var("TOLLGATE_GATEWAYS") {
            records.extend(Self::parse_pairs(&raw)?);
        }
        if let Ok(path) = std::env::var("TOLLGATE_GATEWAYS_PATH") {
            if !path.trim().is_empty() {
                records.extend(Self::load_file(path.trim())?);
            }
        }
        let directory = Self::new(records);
        if directory.is_empty() {
            tracing::warn!("No gateways configured; every chat request will be rejected");
        } else {
            tracing::info!("Loaded {} gateway(s)", directory.len());
        }
        Ok(directory)
    }
}

#[async_trait]
impl GatewayAuthenticator for StaticGatewayDirectory {
    async fn authenticate(
        &self,
        gateway_id: Option<&str>,
        secret: Option<&str>,
    ) -> Result<AuthenticatedGateway, GatewayAuthError> {
        let (Some(id), Some(secret)) = (gateway_id, secret) else {
            return Err(GatewayAuthError::MissingCredentials);
        };
        let entry = self.entries.get(id).ok_or(GatewayAuthError::Rejected)?;
        if !ct_eq(&sha256(secret.as_bytes()), &entry.digest) {
            return Err(GatewayAuthError::Rejected);
        }
        Ok(AuthenticatedGateway {
            id: id.to_string(),
            name: entry.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn directory() -> StaticGatewayDirectory {
        let records = StaticGatewayDirectory::parse_pairs("g1:s3cret, g2:other").unwrap();
        StaticGatewayDirectory::new(records)
    }

    #[tokio::test]
    async fn accepts_matching_secret() {
        let gw = directory()
            .authenticate(Some("g1"), Some("s3cret"))
            .await
            .unwrap();
        assert_eq!(gw.id, "g1");
    }

    #[tokio::test]
    async fn rejects_wrong_secret_unknown_id_and_missing_headers() {
        let dir = directory();
        assert_eq!(
            dir.authenticate(Some("g1"), Some("other")).await,
            Err(GatewayAuthError::Rejected)
        );
        assert_eq!(
            dir.authenticate(Some("g9"), Some("s3cret")).await,
            Err(GatewayAuthError::Rejected)
        );
        assert_eq!(
            dir.authenticate(Some("g1"), None).await,
            Err(GatewayAuthError::MissingCredentials)
        );
    }

    #[test]
    fn malformed_pairs_are_config_errors() {
        assert!(matches!(
            StaticGatewayDirectory::parse_pairs("g1"),
            Err(GatewayAuthError::Config(_))
        ));
        assert!(matches!(
            StaticGatewayDirectory::parse_pairs("g1:"),
            Err(GatewayAuthError::Config(_))
        ));
        assert!(StaticGatewayDirectory::parse_pairs(" , ").unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_yaml_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateways.yaml");
        std::fs::write(&path, "- id: team-a\n  name: Team A\n  secret: abc\n").unwrap();
        let records = StaticGatewayDirectory::load_file(&path).unwrap();
        let directory = StaticGatewayDirectory::new(records);
        let gw = directory
            .authenticate(Some("team-a"), Some("abc"))
            .await
            .unwrap();
        assert_eq!(gw.name.as_deref(), Some("Team A"));
    }
}
