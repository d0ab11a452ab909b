//! The `AuthClient` facade.
//!
//! One client per project; `tenant()` derives a tenant-scoped view
//! that shares every cache and connection with its parent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::backend::{AccountLookup, BackendError, HttpBackend, SessionCookieMinter, SignBlob};
use crate::claims::DecodedToken;
use crate::custom_token::{CustomTokenIssuer, ServiceAccountSigner, SignBlobSigner, TokenSigner};
use crate::error::{AuthError, TokenKind};
use crate::keys::{SigningKeyCache, SigningKeyCacheConfig};
use crate::verify::{ID_TOKEN_CERT_URL, SESSION_COOKIE_CERT_URL, TokenVerifier};
use identikit_credentials::Credentials;

/// Minimum session cookie lifetime: 5 minutes.
pub const MIN_SESSION_COOKIE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Maximum session cookie lifetime: 2 weeks.
pub const MAX_SESSION_COOKIE_DURATION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

struct ClientInner {
    project_id: String,
    id_token_verifier: TokenVerifier,
    session_cookie_verifier: TokenVerifier,
    issuer: Option<CustomTokenIssuer>,
    accounts: Option<Arc<dyn AccountLookup>>,
    cookie_minter: Option<Arc<dyn SessionCookieMinter>>,
}

/// Client for the token lifecycle of one project.
///
/// Cloning is cheap; clones share the key caches and backend
/// connections. Use [`AuthClient::builder`] to construct one.
#[derive(Clone)]
pub struct AuthClient {
    inner: Arc<ClientInner>,
    tenant_id: Option<String>,
}

impl AuthClient {
    /// Starts building a client from credentials.
    #[must_use]
    pub fn builder(credentials: Credentials) -> AuthClientBuilder {
        AuthClientBuilder::new(credentials)
    }

    /// The project this client serves.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// The tenant this client is scoped to, if any.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Derives a client scoped to `tenant_id`.
    ///
    /// The scoped client mints tokens carrying the tenant and rejects
    /// verified tokens whose tenant claim does not match. Caches and
    /// connections are shared with the parent.
    #[must_use]
    pub fn tenant(&self, tenant_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            tenant_id: Some(tenant_id.into()),
        }
    }

    // ------------------------------------------------------------------
    // Minting
    // ------------------------------------------------------------------

    /// Mints a custom token for `uid` with no developer claims.
    ///
    /// # Errors
    ///
    /// See [`AuthClient::create_custom_token_with_claims`].
    pub async fn create_custom_token(&self, uid: &str) -> Result<String, AuthError> {
        self.create_custom_token_with_claims(uid, None).await
    }

    /// Mints a custom token for `uid`, embedding `developer_claims`.
    ///
    /// When the client is tenant-scoped the token carries the tenant,
    /// and the ID token obtained by exchanging it will carry it too.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] if the client has no
    /// signing capability, [`AuthError::InvalidArgument`] on a bad UID
    /// or reserved claim names, and [`AuthError::Signer`] when signing
    /// fails.
    pub async fn create_custom_token_with_claims(
        &self,
        uid: &str,
        developer_claims: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<String, AuthError> {
        let issuer = self.inner.issuer.as_ref().ok_or_else(|| {
            AuthError::invalid_credential(
                "Custom token minting requires a service account credential \
                 or a service account email with remote signing",
            )
        })?;

        issuer
            .mint(uid, self.tenant_id.as_deref(), developer_claims)
            .await
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Verifies an ID token.
    ///
    /// With `check_revoked` the account's valid-since timestamp is
    /// consulted and tokens issued before it are rejected; this adds a
    /// backend round trip per call.
    ///
    /// # Errors
    ///
    /// All [`TokenVerifier::verify`] errors, plus
    /// [`AuthError::TenantMismatch`] on a tenant-scoped client and
    /// [`AuthError::TokenRevoked`] / [`AuthError::UserNotFound`] when
    /// `check_revoked` is set. A lookup failure during the revocation
    /// check surfaces as [`AuthError::Backend`] (or
    /// [`AuthError::InvalidCredential`] when the backend rejects the
    /// access token) rather than skipping the check.
    pub async fn verify_id_token(
        &self,
        token: &str,
        check_revoked: bool,
    ) -> Result<DecodedToken, AuthError> {
        self.verify(&self.inner.id_token_verifier, token, check_revoked)
            .await
    }

    /// Verifies a session cookie. Semantics mirror
    /// [`AuthClient::verify_id_token`], with session-cookie error codes.
    ///
    /// # Errors
    ///
    /// See [`AuthClient::verify_id_token`].
    pub async fn verify_session_cookie(
        &self,
        cookie: &str,
        check_revoked: bool,
    ) -> Result<DecodedToken, AuthError> {
        self.verify(&self.inner.session_cookie_verifier, cookie, check_revoked)
            .await
    }

    async fn verify(
        &self,
        verifier: &TokenVerifier,
        token: &str,
        check_revoked: bool,
    ) -> Result<DecodedToken, AuthError> {
        // Credential presence is validated before the first network
        // call (including the key fetch), not at the point of use.
        let accounts = if check_revoked {
            Some(self.inner.accounts.as_ref().ok_or_else(|| {
                AuthError::invalid_credential("Revocation checks require a backend credential")
            })?)
        } else {
            None
        };

        let decoded = verifier.verify(token).await?;
        self.assert_tenant(&decoded)?;

        if let Some(accounts) = accounts {
            self.check_revoked(accounts, verifier.kind(), &decoded)
                .await?;
        }

        Ok(decoded)
    }

    fn assert_tenant(&self, decoded: &DecodedToken) -> Result<(), AuthError> {
        let Some(expected) = self.tenant_id.as_deref() else {
            return Ok(());
        };

        match decoded.tenant_id() {
            None => Err(AuthError::tenant_mismatch("missing tenant id")),
            Some(found) if found != expected => {
                Err(AuthError::tenant_mismatch("mismatching tenant id"))
            }
            Some(_) => Ok(()),
        }
    }

    /// Rejects tokens issued before the account's valid-since mark.
    ///
    /// The comparison uses `auth_time`, so a session cookie minted
    /// after revocation from a pre-revocation sign-in is still caught.
    /// A revocation check that cannot run is a failure, not a pass:
    /// backend errors propagate instead of accepting the token with
    /// the check skipped.
    async fn check_revoked(
        &self,
        accounts: &Arc<dyn AccountLookup>,
        kind: TokenKind,
        decoded: &DecodedToken,
    ) -> Result<(), AuthError> {
        let user = match accounts.get_user(decoded.uid(), self.tenant_id.as_deref()).await {
            Ok(user) => user,
            Err(BackendError::UserNotFound { uid }) => {
                return Err(AuthError::UserNotFound { uid });
            }
            Err(err) => {
                tracing::warn!(
                    uid = decoded.uid(),
                    error = %err,
                    "Revocation check failed"
                );
                return Err(map_backend_error(err));
            }
        };

        if let Some(valid_after) = user.tokens_valid_after
            && decoded.auth_time < valid_after
        {
            tracing::debug!(uid = decoded.uid(), kind = %kind, "Token revoked");
            return Err(AuthError::TokenRevoked { kind });
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Session cookies
    // ------------------------------------------------------------------

    /// Exchanges a verified ID token for a session cookie valid for
    /// `expires_in`.
    ///
    /// The duration must lie in `[5 minutes, 2 weeks]`, bounds
    /// inclusive; the check runs before any network call. On a
    /// tenant-scoped client the ID token is verified first and must
    /// carry the matching tenant.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidSessionCookieDuration`] when the
    /// duration is out of range, [`AuthError::InvalidCredential`] when
    /// no backend is configured, plus verification and backend errors.
    pub async fn create_session_cookie(
        &self,
        id_token: &str,
        expires_in: Duration,
    ) -> Result<String, AuthError> {
        if expires_in < MIN_SESSION_COOKIE_DURATION || expires_in > MAX_SESSION_COOKIE_DURATION {
            return Err(AuthError::InvalidSessionCookieDuration);
        }

        let minter = self.inner.cookie_minter.as_ref().ok_or_else(|| {
            AuthError::invalid_credential("Session cookie minting requires a backend credential")
        })?;

        if self.tenant_id.is_some() {
            self.verify_id_token(id_token, false).await?;
        }

        let cookie = minter
            .create_session_cookie(id_token, expires_in.as_secs(), self.tenant_id.as_deref())
            .await
            .map_err(map_backend_error)?;

        tracing::debug!(
            valid_secs = expires_in.as_secs(),
            tenant_id = self.tenant_id.as_deref(),
            "Minted session cookie"
        );
        Ok(cookie)
    }
}

/// Maps backend RPC failures, distinguishing a rejected access token
/// from plain backend trouble.
fn map_backend_error(err: BackendError) -> AuthError {
    match err {
        BackendError::HttpError {
            status: status @ (401 | 403),
            message,
        } => AuthError::invalid_credential(format!(
            "Backend rejected the access token (status {status}): {message}"
        )),
        other => AuthError::Backend { source: other },
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("project_id", &self.inner.project_id)
            .field("tenant_id", &self.tenant_id)
            .field("can_mint", &self.inner.issuer.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builds an [`AuthClient`].
pub struct AuthClientBuilder {
    credentials: Credentials,
    backend_url: Url,
    access_token: Option<String>,
    id_token_key_url: Url,
    session_cookie_key_url: Url,
    key_cache_config: SigningKeyCacheConfig,
    signer: Option<Arc<dyn TokenSigner>>,
    accounts: Option<Arc<dyn AccountLookup>>,
    cookie_minter: Option<Arc<dyn SessionCookieMinter>>,
    tenant_id: Option<String>,
}

impl AuthClientBuilder {
    fn new(credentials: Credentials) -> Self {
        // These literals parse; expect() documents the invariant.
        Self {
            credentials,
            backend_url: Url::parse(crate::backend::DEFAULT_BACKEND_URL)
                .expect("default backend URL is valid"),
            access_token: None,
            id_token_key_url: Url::parse(ID_TOKEN_CERT_URL).expect("default key URL is valid"),
            session_cookie_key_url: Url::parse(SESSION_COOKIE_CERT_URL)
                .expect("default key URL is valid"),
            key_cache_config: SigningKeyCacheConfig::default(),
            signer: None,
            accounts: None,
            cookie_minter: None,
            tenant_id: None,
        }
    }

    /// Overrides the identity backend base URL (e.g. an emulator).
    #[must_use]
    pub fn with_backend_url(mut self, url: Url) -> Self {
        self.backend_url = url;
        self
    }

    /// Supplies the bearer token that authenticates backend RPCs
    /// (account lookup, session-cookie minting, remote signing).
    ///
    /// Obtaining the token is the embedder's concern; without one (or
    /// injected ports) the backend-dependent operations fail with
    /// [`AuthError::InvalidCredential`] before any network call.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Overrides the ID-token key-set endpoint.
    #[must_use]
    pub fn with_id_token_key_url(mut self, url: Url) -> Self {
        self.id_token_key_url = url;
        self
    }

    /// Overrides the session-cookie key-set endpoint.
    #[must_use]
    pub fn with_session_cookie_key_url(mut self, url: Url) -> Self {
        self.session_cookie_key_url = url;
        self
    }

    /// Overrides the signing-key cache configuration.
    #[must_use]
    pub fn with_key_cache_config(mut self, config: SigningKeyCacheConfig) -> Self {
        self.key_cache_config = config;
        self
    }

    /// Injects a custom token signer, replacing credential-derived ones.
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn TokenSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Injects an account-lookup port, replacing the HTTP backend.
    #[must_use]
    pub fn with_account_lookup(mut self, accounts: Arc<dyn AccountLookup>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Injects a session-cookie minter, replacing the HTTP backend.
    #[must_use]
    pub fn with_cookie_minter(mut self, minter: Arc<dyn SessionCookieMinter>) -> Self {
        self.cookie_minter = Some(minter);
        self
    }

    /// Scopes the client to a tenant from the start.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Builds the client.
    ///
    /// Signing capability is resolved in order: an injected signer, a
    /// service account private key, then a service account email with
    /// remote signing (which additionally needs an access token). A
    /// client without any of these still verifies tokens; minting
    /// fails with [`AuthError::InvalidCredential`]. Likewise the
    /// account-lookup and cookie-minting ports are installed only when
    /// injected or when an access token authenticates the stock HTTP
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] when the credentials
    /// carry no project ID or the private key cannot be parsed.
    pub fn build(self) -> Result<AuthClient, AuthError> {
        let project_id = self.credentials.project_id().to_string();
        if project_id.is_empty() {
            return Err(AuthError::invalid_credential(
                "Credentials carry no project ID",
            ));
        }

        let has_backend_auth = self.access_token.is_some();
        let mut backend = HttpBackend::new(self.backend_url, project_id.clone());
        if let Some(token) = self.access_token {
            backend = backend.with_access_token(token);
        }
        let backend = Arc::new(backend);

        let signer: Option<Arc<dyn TokenSigner>> = match self.signer {
            Some(signer) => Some(signer),
            None => match &self.credentials {
                Credentials::ServiceAccount(credential) => {
                    Some(Arc::new(ServiceAccountSigner::new(credential)?))
                }
                // Remote signing needs an authenticated backend; an
                // email alone cannot produce signatures.
                Credentials::Implicit {
                    service_account_email: Some(email),
                    ..
                } if has_backend_auth => {
                    let remote: Arc<dyn SignBlob> = backend.clone();
                    Some(Arc::new(SignBlobSigner::new(email.clone(), remote)))
                }
                Credentials::Implicit { .. } => None,
            },
        };

        let id_token_keys = Arc::new(SigningKeyCache::new(
            self.id_token_key_url,
            self.key_cache_config.clone(),
        ));
        let session_cookie_keys = Arc::new(SigningKeyCache::new(
            self.session_cookie_key_url,
            self.key_cache_config,
        ));

        // The stock HTTP ports are only usable with an access token;
        // without one they stay absent so the per-operation credential
        // checks fire instead of an opaque 401 downstream.
        let accounts: Option<Arc<dyn AccountLookup>> = match self.accounts {
            Some(accounts) => Some(accounts),
            None if has_backend_auth => Some(backend.clone()),
            None => None,
        };
        let cookie_minter: Option<Arc<dyn SessionCookieMinter>> = match self.cookie_minter {
            Some(minter) => Some(minter),
            None if has_backend_auth => Some(backend.clone()),
            None => None,
        };

        tracing::debug!(
            project_id,
            can_mint = signer.is_some(),
            tenant_id = self.tenant_id.as_deref(),
            "Auth client initialized"
        );

        Ok(AuthClient {
            inner: Arc::new(ClientInner {
                id_token_verifier: TokenVerifier::new(
                    TokenKind::IdToken,
                    project_id.clone(),
                    id_token_keys,
                ),
                session_cookie_verifier: TokenVerifier::new(
                    TokenKind::SessionCookie,
                    project_id.clone(),
                    session_cookie_keys,
                ),
                project_id,
                issuer: signer.map(CustomTokenIssuer::new),
                accounts,
                cookie_minter,
            }),
            tenant_id: self.tenant_id,
        })
    }
}
