//! Declarative client configuration.
//!
//! Deserializable alternative to driving
//! [`AuthClientBuilder`](crate::client::AuthClientBuilder) by hand,
//! for embedders that load settings from a config file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::AuthClient;
use crate::error::AuthError;
use crate::keys::SigningKeyCacheConfig;
use identikit_credentials::{Credentials, ServiceAccountCredential};

/// Auth client settings.
///
/// Durations accept humantime strings (`"1h"`, `"90s"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Project ID, used when no credentials file supplies one.
    pub project_id: Option<String>,

    /// Path to a service account credentials JSON file. When unset,
    /// the `IDENTIKIT_CREDENTIALS` environment variable is consulted.
    pub credentials_file: Option<PathBuf>,

    /// Service account email for remote signing when no private key is
    /// available.
    pub service_account_email: Option<String>,

    /// Identity backend base URL override (e.g. an emulator).
    pub backend_url: Option<Url>,

    /// ID-token key-set endpoint override.
    pub id_token_key_url: Option<Url>,

    /// Session-cookie key-set endpoint override.
    pub session_cookie_key_url: Option<Url>,

    /// Key cache TTL used when the key endpoint sends no Cache-Control.
    #[serde(with = "humantime_serde")]
    pub key_cache_default_ttl: Option<Duration>,

    /// Grace window for serving a stale key set when a refresh fails.
    #[serde(with = "humantime_serde")]
    pub key_cache_stale_if_error: Option<Duration>,

    /// Tenant to scope the client to.
    pub tenant_id: Option<String>,
}

impl AuthConfig {
    /// Builds an [`AuthClient`] from this configuration.
    ///
    /// Credentials are resolved in order: `credentials_file`, the
    /// `IDENTIKIT_CREDENTIALS` environment variable, then an implicit
    /// credential from `project_id` (verification-only unless
    /// `service_account_email` enables remote signing).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] when no credential
    /// source yields a project ID or the credentials file is invalid.
    pub fn build_client(&self) -> Result<AuthClient, AuthError> {
        let credentials = self.resolve_credentials()?;

        let mut builder = AuthClient::builder(credentials);

        if let Some(url) = &self.backend_url {
            builder = builder.with_backend_url(url.clone());
        }
        if let Some(url) = &self.id_token_key_url {
            builder = builder.with_id_token_key_url(url.clone());
        }
        if let Some(url) = &self.session_cookie_key_url {
            builder = builder.with_session_cookie_key_url(url.clone());
        }
        if self.key_cache_default_ttl.is_some() || self.key_cache_stale_if_error.is_some() {
            let mut cache = SigningKeyCacheConfig::default();
            if let Some(ttl) = self.key_cache_default_ttl {
                cache = cache.with_default_ttl(ttl);
            }
            if let Some(window) = self.key_cache_stale_if_error {
                cache = cache.with_stale_if_error(window);
            }
            builder = builder.with_key_cache_config(cache);
        }
        if let Some(tenant) = &self.tenant_id {
            builder = builder.with_tenant(tenant.clone());
        }

        builder.build()
    }

    fn resolve_credentials(&self) -> Result<Credentials, AuthError> {
        if let Some(path) = &self.credentials_file {
            let credential = ServiceAccountCredential::from_file(path)
                .map_err(|e| AuthError::invalid_credential(e.to_string()))?;
            return Ok(Credentials::ServiceAccount(credential));
        }

        match ServiceAccountCredential::from_env() {
            Ok(credential) => return Ok(Credentials::ServiceAccount(credential)),
            Err(identikit_credentials::CredentialError::EnvNotSet(_)) => {}
            Err(e) => return Err(AuthError::invalid_credential(e.to_string())),
        }

        Ok(Credentials::Implicit {
            project_id: self.project_id.clone().unwrap_or_default(),
            service_account_email: self.service_account_email.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrip() {
        let config = AuthConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AuthConfig = serde_json::from_str(&json).unwrap();
        assert!(back.project_id.is_none());
        assert!(back.tenant_id.is_none());
    }

    #[test]
    fn test_humantime_durations() {
        let config: AuthConfig = serde_json::from_str(
            r#"{
                "project_id": "demo-project",
                "key_cache_default_ttl": "30m",
                "key_cache_stale_if_error": "2h"
            }"#,
        )
        .unwrap();

        assert_eq!(config.key_cache_default_ttl, Some(Duration::from_secs(1800)));
        assert_eq!(
            config.key_cache_stale_if_error,
            Some(Duration::from_secs(7200))
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<AuthConfig, _> =
            serde_json::from_str(r#"{"projcet_id": "typo"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_client_from_project_id() {
        let config = AuthConfig {
            project_id: Some("demo-project".to_string()),
            ..AuthConfig::default()
        };
        let client = config.build_client().unwrap();
        assert_eq!(client.project_id(), "demo-project");
        assert!(client.tenant_id().is_none());
    }

    #[test]
    fn test_build_client_with_tenant() {
        let config = AuthConfig {
            project_id: Some("demo-project".to_string()),
            tenant_id: Some("tenant-a".to_string()),
            ..AuthConfig::default()
        };
        let client = config.build_client().unwrap();
        assert_eq!(client.tenant_id(), Some("tenant-a"));
    }
}
