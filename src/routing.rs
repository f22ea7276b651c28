//! Route Resolver
//!
//! Maps a requested model identifier to the upstream that serves it:
//! - the reserved free-tier token selects a fixed sponsored endpoint and key
//! - `provider/model` names the provider explicitly and skips the model table
//! - anything else is looked up in the model table

use crate::catalog::{Catalog, FreeTier};
use http::StatusCode;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Provider must be specified for unknown model: {0}")]
    UnknownModel(String),

    #[error("Provider not available: {0}")]
    UnknownProvider(String),

    #[error("No base URL configured for provider {0}")]
    MisconfiguredProvider(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

/// Where a request goes, and with which credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Model name sent upstream
    pub model: String,
    pub provider: String,
    pub base_url: String,
    /// Fixed credential for the free tier; caller credentials are ignored when set
    pub override_credential: Option<String>,
    pub free_tier: bool,
}

impl ResolvedRoute {
    /// Credential actually sent upstream.
    pub fn effective_credential(&self, caller: Option<String>) -> Option<String> {
        if self.free_tier {
            self.override_credential.clone()
        } else {
            caller
        }
    }
}

impl fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field(
                "override_credential",
                &self.override_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("free_tier", &self.free_tier)
            .finish()
    }
}

pub struct RouteResolver {
    free_tier: FreeTier,
    free_credential: Option<String>,
    models: HashMap<String, String>,
    providers: HashMap<String, String>,
}

impl RouteResolver {
    pub fn new(catalog: &Catalog, free_credential: Option<String>) -> Self {
        Self {
            free_tier: catalog.free_tier.clone(),
            free_credential,
            models: catalog.models.clone(),
            providers: catalog.providers.clone(),
        }
    }

    /// Build from a catalog, reading the free-tier key from the environment once.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let free_credential = std::env::var(&catalog.free_tier.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if free_credential.is_none() {
            tracing::warn!(
                "{} not set; free tier requests will be sent without a key",
                catalog.free_tier.api_key_env
            );
        }
        Self::new(catalog, free_credential)
    }

    pub fn resolve(&self, model_identifier: &str) -> Result<ResolvedRoute, RouteError> {
        if model_identifier == self.free_tier.token {
            return Ok(ResolvedRoute {
                model: self.free_tier.model.clone(),
                provider: self.free_tier.provider.clone(),
                base_url: self.free_tier.base_url.clone(),
                override_credential: self.free_credential.clone(),
                free_tier: true,
            });
        }

        let (provider, model) = match model_identifier.split_once('/') {
            Some((provider, model)) => (provider.to_string(), model.to_string()),
            None => {
                let provider = self
                    .models
                    .get(model_identifier)
                    .ok_or_else(|| RouteError::UnknownModel(model_identifier.to_string()))?;
                (provider.clone(), model_identifier.to_string())
            }
        };

        let base_url = self
            .providers
            .get(&provider)
            .ok_or_else(|| RouteError::UnknownProvider(provider.clone()))?;
        if base_url.trim().is_empty() {
            return Err(RouteError::MisconfiguredProvider(provider));
        }

        Ok(ResolvedRoute {
            model,
            base_url: base_url.clone(),
            provider,
            override_credential: None,
            free_tier: false,
        })
    }
}
