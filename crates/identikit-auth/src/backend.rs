//! Identity backend RPCs.
//!
//! The revocation check, remote signing and session-cookie minting all
//! talk to the identity backend over HTTPS. Each concern is a small
//! trait so tests and embedders can substitute their own transport;
//! [`HttpBackend`] is the stock implementation over [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer};
use url::Url;

/// Errors raised by backend RPCs.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A network error occurred.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The backend returned a non-success status code.
    #[error("Backend returned status {status}: {message}")]
    HttpError {
        /// The HTTP status code.
        status: u16,
        /// The response body, truncated.
        message: String,
    },

    /// The backend response could not be parsed.
    #[error("Failed to parse backend response: {0}")]
    Parse(String),

    /// No account exists for the given UID.
    #[error("No user record for uid {uid}")]
    UserNotFound {
        /// The UID that was looked up.
        uid: String,
    },
}

fn deserialize_opt_i64_string_or_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid integer string: {e}"))),
    }
}

/// A user account as reported by the backend.
///
/// The wire format spells numeric fields as strings in some API
/// versions, so `validSince` accepts either representation.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    /// The user's UID.
    #[serde(rename = "localId")]
    pub uid: String,

    /// Primary email, if set.
    #[serde(default)]
    pub email: Option<String>,

    /// The tenant the account belongs to, if any.
    #[serde(default, rename = "tenantId")]
    pub tenant_id: Option<String>,

    /// Whether the account has been disabled.
    #[serde(default)]
    pub disabled: bool,

    /// Unix timestamp (seconds) before which all issued tokens are
    /// considered revoked. Set when tokens are revoked or the password
    /// changes.
    #[serde(
        default,
        rename = "validSince",
        deserialize_with = "deserialize_opt_i64_string_or_number"
    )]
    pub tokens_valid_after: Option<i64>,
}

// ============================================================================
// Ports
// ============================================================================

/// Looks up user accounts, for the revocation check.
#[async_trait]
pub trait AccountLookup: Send + Sync {
    /// Fetches the account for `uid`, scoped to `tenant_id` when set.
    async fn get_user(
        &self,
        uid: &str,
        tenant_id: Option<&str>,
    ) -> Result<UserRecord, BackendError>;
}

/// Signs a raw blob with a platform-held service account key.
#[async_trait]
pub trait SignBlob: Send + Sync {
    /// Signs `payload` as `service_account_email` and returns the raw
    /// signature bytes.
    async fn sign_blob(
        &self,
        service_account_email: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, BackendError>;
}

/// Exchanges a verified ID token for a session cookie.
#[async_trait]
pub trait SessionCookieMinter: Send + Sync {
    /// Mints a session cookie valid for `valid_duration_secs`.
    async fn create_session_cookie(
        &self,
        id_token: &str,
        valid_duration_secs: u64,
        tenant_id: Option<&str>,
    ) -> Result<String, BackendError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Production base URL of the identity backend.
pub const DEFAULT_BACKEND_URL: &str = "https://identitytoolkit.identikit.dev";

const MAX_ERROR_BODY: usize = 512;

#[derive(serde::Serialize)]
struct LookupRequest<'a> {
    #[serde(rename = "localId")]
    local_id: [&'a str; 1],
    #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<UserRecord>,
}

#[derive(serde::Serialize)]
struct SignBlobRequest<'a> {
    payload: &'a str,
}

#[derive(Deserialize)]
struct SignBlobResponse {
    #[serde(rename = "signedBlob")]
    signed_blob: String,
}

#[derive(serde::Serialize)]
struct SessionCookieRequest<'a> {
    #[serde(rename = "idToken")]
    id_token: &'a str,
    #[serde(rename = "validDuration")]
    valid_duration: u64,
}

#[derive(Deserialize)]
struct SessionCookieResponse {
    #[serde(rename = "sessionCookie")]
    session_cookie: String,
}

/// Backend client over HTTPS, implementing all three ports.
pub struct HttpBackend {
    http_client: reqwest::Client,
    base_url: Url,
    project_id: String,
    access_token: Option<String>,
}

impl HttpBackend {
    /// Creates a backend client for the given project.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen
    /// in practice).
    #[must_use]
    pub fn new(base_url: Url, project_id: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url,
            project_id: project_id.into(),
            access_token: None,
        }
    }

    /// Sets the bearer token attached to every request.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Parse(format!("invalid endpoint path {path}: {e}")))
    }

    async fn post_json<Req, Resp>(&self, url: Url, body: &Req) -> Result<Resp, BackendError>
    where
        Req: serde::Serialize + ?Sized,
        Resp: serde::de::DeserializeOwned,
    {
        let mut request = self.http_client.post(url.clone()).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Backend request failed");
            BackendError::NetworkError(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(MAX_ERROR_BODY);
            return Err(BackendError::HttpError {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }
}

#[async_trait]
impl AccountLookup for HttpBackend {
    async fn get_user(
        &self,
        uid: &str,
        tenant_id: Option<&str>,
    ) -> Result<UserRecord, BackendError> {
        let url = self.endpoint("/v1/accounts:lookup")?;
        let body = LookupRequest {
            local_id: [uid],
            tenant_id,
        };

        let response: LookupResponse = self.post_json(url, &body).await?;
        response
            .users
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::UserNotFound {
                uid: uid.to_string(),
            })
    }
}

#[async_trait]
impl SignBlob for HttpBackend {
    async fn sign_blob(
        &self,
        service_account_email: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, BackendError> {
        let url = self.endpoint(&format!(
            "/v1/projects/-/serviceAccounts/{service_account_email}:signBlob"
        ))?;
        let encoded = STANDARD.encode(payload);
        let body = SignBlobRequest { payload: &encoded };

        let response: SignBlobResponse = self.post_json(url, &body).await?;
        STANDARD
            .decode(&response.signed_blob)
            .map_err(|e| BackendError::Parse(format!("signedBlob is not valid base64: {e}")))
    }
}

#[async_trait]
impl SessionCookieMinter for HttpBackend {
    async fn create_session_cookie(
        &self,
        id_token: &str,
        valid_duration_secs: u64,
        tenant_id: Option<&str>,
    ) -> Result<String, BackendError> {
        let path = match tenant_id {
            Some(tenant) => format!(
                "/v1/projects/{}/tenants/{tenant}:createSessionCookie",
                self.project_id
            ),
            None => format!("/v1/projects/{}:createSessionCookie", self.project_id),
        };
        let url = self.endpoint(&path)?;
        let body = SessionCookieRequest {
            id_token,
            valid_duration: valid_duration_secs,
        };

        let response: SessionCookieResponse = self.post_json(url, &body).await?;
        Ok(response.session_cookie)
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url.as_str())
            .field("project_id", &self.project_id)
            .field("has_access_token", &self.access_token.is_some())
            .finish_non_exhaustive()
    }
}
