//! # identikit-auth
//!
//! Server-side token lifecycle for the Identikit identity platform.
//!
//! This crate provides:
//! - Custom token minting with local or remote RS256 signing
//! - ID token and session cookie verification against rotating keys
//! - Session cookie minting with bounded lifetimes
//! - Revocation checks against per-account valid-since timestamps
//! - Tenant-scoped clients for multi-tenant projects
//!
//! ## Overview
//!
//! The entry point is [`AuthClient`], built from [`Credentials`] (a
//! service account JSON file or an implicit project identity). A
//! custom token minted with [`AuthClient::create_custom_token`] is
//! exchanged by a client SDK for an ID token, which servers verify
//! with [`AuthClient::verify_id_token`]; long-lived sessions go
//! through [`AuthClient::create_session_cookie`] and
//! [`AuthClient::verify_session_cookie`].
//!
//! ## Modules
//!
//! - [`client`] - The `AuthClient` facade and its builder
//! - [`custom_token`] - Custom token minting and signers
//! - [`verify`] - ID token and session cookie verification
//! - [`keys`] - Public signing-key fetching and caching
//! - [`backend`] - Identity backend RPCs (lookup, signing, cookies)
//! - [`claims`] - Decoded token claims
//! - [`config`] - Declarative client configuration
//! - [`error`] - Error types and stable error codes

pub mod backend;
pub mod claims;
pub mod client;
pub mod config;
pub mod custom_token;
pub mod error;
pub mod keys;
pub mod verify;

pub use backend::{AccountLookup, BackendError, HttpBackend, SessionCookieMinter, SignBlob, UserRecord};
pub use claims::{DecodedToken, PlatformClaims};
pub use client::{
    AuthClient, AuthClientBuilder, MAX_SESSION_COOKIE_DURATION, MIN_SESSION_COOKIE_DURATION,
};
pub use config::AuthConfig;
pub use custom_token::{
    CUSTOM_TOKEN_LIFETIME_SECS, CustomTokenIssuer, MAX_UID_LENGTH, ServiceAccountSigner,
    SignBlobSigner, SignerError, TOKEN_EXCHANGE_AUDIENCE, TokenSigner,
};
pub use error::{AuthError, ErrorCategory, TokenKind};
pub use keys::{KeysError, SigningKeyCache, SigningKeyCacheConfig};
pub use verify::{
    CLOCK_SKEW_SECS, ID_TOKEN_ISSUER_PREFIX, SESSION_COOKIE_ISSUER_PREFIX, TokenVerifier,
};

pub use identikit_credentials::{CredentialError, Credentials, ServiceAccountCredential};

/// Type alias for token-lifecycle results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use identikit_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::claims::{DecodedToken, PlatformClaims};
    pub use crate::client::{AuthClient, AuthClientBuilder};
    pub use crate::config::AuthConfig;
    pub use crate::error::{AuthError, ErrorCategory, TokenKind};
    pub use identikit_credentials::{Credentials, ServiceAccountCredential};
}
