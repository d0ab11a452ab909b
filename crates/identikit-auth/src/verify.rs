//! ID token and session cookie verification.
//!
//! Both kinds of bearer token are RS256 compact JWTs that differ only
//! in issuer prefix, key-set endpoint and error codes, so one
//! [`TokenVerifier`] handles both, parameterized by [`TokenKind`].
//!
//! Checks run in a fixed order and fail fast, with everything that can
//! be decided locally decided before the signing key is fetched:
//!
//! 1. structure (three base64url segments)
//! 2. header: `alg` must be RS256, `kid` must be present
//! 3. payload decodes to the expected claim set
//! 4. claims: `exp`, `iat`, `aud`, `iss`, `sub`, `auth_time`
//! 5. signature, against the key the header's `kid` names

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::claims::DecodedToken;
use crate::custom_token::TOKEN_EXCHANGE_AUDIENCE;
use crate::error::{AuthError, TokenKind};
use crate::keys::SigningKeyCache;

/// Issuer prefix of ID tokens; the project ID is appended.
pub const ID_TOKEN_ISSUER_PREFIX: &str = "https://securetoken.identikit.dev/";

/// Issuer prefix of session cookies; the project ID is appended.
pub const SESSION_COOKIE_ISSUER_PREFIX: &str = "https://session.identikit.dev/";

/// Where the ID-token signing keys are published.
pub const ID_TOKEN_CERT_URL: &str = "https://keys.identikit.dev/v1/idTokenKeys";

/// Where the session-cookie signing keys are published.
pub const SESSION_COOKIE_CERT_URL: &str = "https://keys.identikit.dev/v1/sessionCookieKeys";

/// Tolerated clock skew for `iat`, `exp` and `auth_time`, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 300;

/// Maximum accepted length of a `sub` claim, in characters.
const MAX_SUB_LENGTH: usize = 128;

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Verifies one kind of bearer token for one project.
pub struct TokenVerifier {
    kind: TokenKind,
    project_id: String,
    issuer: String,
    keys: Arc<SigningKeyCache>,
}

impl TokenVerifier {
    /// Creates a verifier for `kind` tokens of `project_id`, fetching
    /// signing keys through `keys`.
    #[must_use]
    pub fn new(kind: TokenKind, project_id: impl Into<String>, keys: Arc<SigningKeyCache>) -> Self {
        let project_id = project_id.into();
        let prefix = match kind {
            TokenKind::IdToken => ID_TOKEN_ISSUER_PREFIX,
            TokenKind::SessionCookie => SESSION_COOKIE_ISSUER_PREFIX,
        };
        Self {
            issuer: format!("{prefix}{project_id}"),
            kind,
            project_id,
            keys,
        }
    }

    /// The kind of token this verifier accepts.
    #[must_use]
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// The exact issuer this verifier requires.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verifies `token` and returns its decoded claims.
    ///
    /// Verification is pure with respect to the token: no network call
    /// is made beyond fetching the public key set, and a token that
    /// verifies once keeps verifying until it expires, its key rotates
    /// out, or it is revoked (revocation is checked separately, by the
    /// caller).
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::MalformedToken`] on structural or claim
    /// defects, [`AuthError::InvalidAlgorithm`] when the header names
    /// an algorithm other than RS256, [`AuthError::TokenExpired`] past
    /// `exp`, [`AuthError::InvalidSignature`] when the signature does
    /// not verify, and [`AuthError::KeyFetch`] when the key set is
    /// unavailable.
    pub async fn verify(&self, token: &str) -> Result<DecodedToken, AuthError> {
        if token.is_empty() {
            return Err(AuthError::malformed_token(
                self.kind,
                "token must be a non-empty string",
            ));
        }

        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(_signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::malformed_token(
                self.kind,
                "token must have exactly three segments",
            ));
        };

        let header = self.decode_header(header_b64)?;
        if header.alg != "RS256" {
            return Err(AuthError::InvalidAlgorithm {
                kind: self.kind,
                found: header.alg,
            });
        }
        let Some(kid) = header.kid else {
            return Err(AuthError::malformed_token(
                self.kind,
                "token header has no \"kid\" claim",
            ));
        };

        let claims = self.decode_payload(payload_b64)?;
        self.check_claims(&claims)?;

        let key = self.keys.get_key(&kid).await?;
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        if jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation).is_err() {
            tracing::debug!(kind = %self.kind, kid, "Signature verification failed");
            return Err(AuthError::InvalidSignature { kind: self.kind });
        }

        tracing::trace!(kind = %self.kind, uid = claims.uid(), "Token verified");
        Ok(claims)
    }

    fn decode_header(&self, segment: &str) -> Result<TokenHeader, AuthError> {
        let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
            AuthError::malformed_token(self.kind, format!("header is not valid base64url: {e}"))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AuthError::malformed_token(self.kind, format!("header is not valid JSON: {e}"))
        })
    }

    fn decode_payload(&self, segment: &str) -> Result<DecodedToken, AuthError> {
        let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
            AuthError::malformed_token(self.kind, format!("payload is not valid base64url: {e}"))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AuthError::malformed_token(self.kind, format!("payload is missing required claims: {e}"))
        })
    }

    /// Checks every claim that can be decided without the signing key,
    /// in a fixed order so the first violation wins.
    fn check_claims(&self, claims: &DecodedToken) -> Result<(), AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        // exp must be strictly past the tolerance-adjusted now.
        if claims.exp <= now - CLOCK_SKEW_SECS {
            return Err(AuthError::TokenExpired { kind: self.kind });
        }

        if claims.iat > now + CLOCK_SKEW_SECS {
            return Err(AuthError::malformed_token(
                self.kind,
                "\"iat\" claim is in the future",
            ));
        }

        if claims.aud != self.project_id {
            // A custom token pasted into the verifier is a common
            // integration mistake worth a pointed message.
            if claims.aud == TOKEN_EXCHANGE_AUDIENCE {
                return Err(AuthError::malformed_token(
                    self.kind,
                    format!(
                        "{} expects {} but was given a custom token",
                        self.kind.verify_api(),
                        indefinite(self.kind.label()),
                    ),
                ));
            }
            return Err(AuthError::malformed_token(
                self.kind,
                format!(
                    "incorrect \"aud\" claim: expected {:?} but got {:?}",
                    self.project_id, claims.aud
                ),
            ));
        }

        if claims.iss != self.issuer {
            return Err(AuthError::malformed_token(
                self.kind,
                format!(
                    "incorrect \"iss\" claim: expected {:?} but got {:?}",
                    self.issuer, claims.iss
                ),
            ));
        }

        if claims.sub.is_empty() {
            return Err(AuthError::malformed_token(
                self.kind,
                "\"sub\" claim must be a non-empty string",
            ));
        }
        if claims.sub.chars().count() > MAX_SUB_LENGTH {
            return Err(AuthError::malformed_token(
                self.kind,
                format!("\"sub\" claim must not exceed {MAX_SUB_LENGTH} characters"),
            ));
        }

        if claims.auth_time > now + CLOCK_SKEW_SECS {
            return Err(AuthError::malformed_token(
                self.kind,
                "\"auth_time\" claim must be in the past",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("kind", &self.kind)
            .field("project_id", &self.project_id)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// "an ID token" / "a session cookie".
fn indefinite(label: &str) -> String {
    let article = if label.starts_with(['a', 'e', 'i', 'o', 'u', 'A', 'E', 'I', 'O', 'U']) {
        "an"
    } else {
        "a"
    };
    format!("{article} {label}")
}
