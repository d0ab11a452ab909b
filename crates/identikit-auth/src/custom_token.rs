//! Custom token minting.
//!
//! A custom token is an RS256 JWT signed with a service account key,
//! which a client SDK exchanges for an ID token. The signable part is
//! assembled here so the same bytes can go to a local private key or a
//! remote signing service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use time::OffsetDateTime;

use crate::backend::SignBlob;
use crate::error::AuthError;
use identikit_credentials::ServiceAccountCredential;

/// Lifetime of a minted custom token, in seconds.
pub const CUSTOM_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Maximum length of a UID, in characters.
pub const MAX_UID_LENGTH: usize = 128;

/// Audience of every custom token: the token-exchange endpoint.
pub const TOKEN_EXCHANGE_AUDIENCE: &str =
    "https://identitytoolkit.identikit.dev/v1/accounts:signInWithCustomToken";

/// Claim names a developer may not set through `developer_claims`.
///
/// These are either standard JWT claims the issuer controls or claims
/// the platform reserves for its own payload.
pub const RESERVED_CLAIMS: &[&str] = &[
    "acr",
    "amr",
    "at_hash",
    "aud",
    "auth_time",
    "azp",
    "c_hash",
    "cnf",
    "exp",
    "iat",
    "identikit",
    "iss",
    "jti",
    "nbf",
    "nonce",
    "sub",
    "tenant_id",
    "uid",
];

/// Errors produced while signing a custom token.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// No signing credential is available.
    #[error("No signing credential available: {message}")]
    NoCredential {
        /// What is missing and how to supply it.
        message: String,
    },

    /// The service account private key could not be parsed.
    #[error("Invalid private key: {message}")]
    InvalidKey {
        /// Description of the parse failure.
        message: String,
    },

    /// The remote signing service failed.
    #[error("Remote signing failed: {message}")]
    Remote {
        /// Description of the remote failure.
        message: String,
    },
}

impl SignerError {
    /// Creates a [`SignerError::NoCredential`].
    #[must_use]
    pub fn no_credential(message: impl Into<String>) -> Self {
        Self::NoCredential {
            message: message.into(),
        }
    }

    /// Creates a [`SignerError::InvalidKey`].
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a [`SignerError::Remote`].
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }
}

// ============================================================================
// Signers
// ============================================================================

/// Produces RS256 signatures over a raw message.
///
/// Two implementations ship with the crate: [`ServiceAccountSigner`]
/// signs locally with a service account private key, and
/// [`SignBlobSigner`] delegates to a remote signing endpoint for
/// deployments where the key never leaves the platform.
#[async_trait]
pub trait TokenSigner: Send + Sync {
    /// The service account email the token is issued as (`iss`/`sub`).
    fn account_email(&self) -> &str;

    /// The key ID to place in the JWT header, if known.
    fn key_id(&self) -> Option<&str> {
        None
    }

    /// Signs `message` with RSASSA-PKCS1-v1_5 over SHA-256.
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError>;
}

/// Signs locally with a service account's RSA private key.
pub struct ServiceAccountSigner {
    client_email: String,
    key_id: Option<String>,
    signing_key: rsa::pkcs1v15::SigningKey<rsa::sha2::Sha256>,
}

impl ServiceAccountSigner {
    /// Creates a signer from a service account credential.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::InvalidKey`] if the credential's private
    /// key is not a parseable PKCS#8 or PKCS#1 PEM.
    pub fn new(credential: &ServiceAccountCredential) -> Result<Self, SignerError> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        use rsa::pkcs8::DecodePrivateKey;

        let pem = credential.private_key.as_str();
        let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| rsa::RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SignerError::invalid_key(e.to_string()))?;

        Ok(Self {
            client_email: credential.client_email.clone(),
            key_id: credential.private_key_id.clone(),
            signing_key: rsa::pkcs1v15::SigningKey::new(private_key),
        })
    }
}

#[async_trait]
impl TokenSigner for ServiceAccountSigner {
    fn account_email(&self) -> &str {
        &self.client_email
    }

    fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        use rsa::signature::{SignatureEncoding, Signer};

        let signature = self.signing_key.sign(message);
        Ok(signature.to_vec())
    }
}

impl std::fmt::Debug for ServiceAccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountSigner")
            .field("client_email", &self.client_email)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Delegates signing to a remote endpoint via [`SignBlob`].
///
/// Used when the process runs under an attached service account
/// identity and holds no private key material itself.
pub struct SignBlobSigner {
    service_account_email: String,
    backend: Arc<dyn SignBlob>,
}

impl SignBlobSigner {
    /// Creates a signer delegating to the given backend.
    #[must_use]
    pub fn new(service_account_email: impl Into<String>, backend: Arc<dyn SignBlob>) -> Self {
        Self {
            service_account_email: service_account_email.into(),
            backend,
        }
    }
}

#[async_trait]
impl TokenSigner for SignBlobSigner {
    fn account_email(&self) -> &str {
        &self.service_account_email
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        self.backend
            .sign_blob(&self.service_account_email, message)
            .await
            .map_err(|e| SignerError::remote(e.to_string()))
    }
}

impl std::fmt::Debug for SignBlobSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignBlobSigner")
            .field("service_account_email", &self.service_account_email)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Issuer
// ============================================================================

#[derive(Serialize)]
struct CustomTokenHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Serialize)]
struct CustomTokenPayload<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<&'a HashMap<String, serde_json::Value>>,
}

/// Mints custom tokens with an injected [`TokenSigner`].
pub struct CustomTokenIssuer {
    signer: Arc<dyn TokenSigner>,
}

impl CustomTokenIssuer {
    /// Creates an issuer around the given signer.
    #[must_use]
    pub fn new(signer: Arc<dyn TokenSigner>) -> Self {
        Self { signer }
    }

    /// Mints a custom token for `uid`.
    ///
    /// The token is valid for one hour from the moment of signing and
    /// carries `developer_claims` (if any) under the `claims` key,
    /// where the token-exchange endpoint copies them into the resulting
    /// ID token's top-level claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidArgument`] if `uid` is empty or
    /// longer than [`MAX_UID_LENGTH`] characters, or if any developer
    /// claim uses a reserved name. Signing failures surface as
    /// [`AuthError::Signer`].
    pub async fn mint(
        &self,
        uid: &str,
        tenant_id: Option<&str>,
        developer_claims: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<String, AuthError> {
        validate_uid(uid)?;
        if let Some(claims) = developer_claims {
            validate_developer_claims(claims)?;
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let email = self.signer.account_email();

        let header = CustomTokenHeader {
            alg: "RS256",
            typ: "JWT",
            kid: self.signer.key_id(),
        };
        let payload = CustomTokenPayload {
            iss: email,
            sub: email,
            aud: TOKEN_EXCHANGE_AUDIENCE,
            iat: now,
            exp: now + CUSTOM_TOKEN_LIFETIME_SECS,
            uid,
            tenant_id,
            claims: developer_claims.filter(|c| !c.is_empty()),
        };

        let header_json = serde_json::to_vec(&header)
            .map_err(|e| AuthError::internal(format!("Failed to serialize header: {e}")))?;
        let payload_json = serde_json::to_vec(&payload)
            .map_err(|e| AuthError::internal(format!("Failed to serialize payload: {e}")))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(payload_json)
        );

        let signature = self.signer.sign(signing_input.as_bytes()).await?;

        tracing::debug!(uid, tenant_id, "Minted custom token");

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

impl std::fmt::Debug for CustomTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomTokenIssuer")
            .field("account_email", &self.signer.account_email())
            .finish_non_exhaustive()
    }
}

fn validate_uid(uid: &str) -> Result<(), AuthError> {
    if uid.is_empty() {
        return Err(AuthError::invalid_argument("uid must not be empty"));
    }
    if uid.chars().count() > MAX_UID_LENGTH {
        return Err(AuthError::invalid_argument(format!(
            "uid must not exceed {MAX_UID_LENGTH} characters"
        )));
    }
    Ok(())
}

fn validate_developer_claims(
    claims: &HashMap<String, serde_json::Value>,
) -> Result<(), AuthError> {
    let mut reserved: Vec<&str> = claims
        .keys()
        .map(String::as_str)
        .filter(|k| RESERVED_CLAIMS.contains(k))
        .collect();

    if reserved.is_empty() {
        return Ok(());
    }

    reserved.sort_unstable();
    Err(AuthError::invalid_argument(format!(
        "Developer claims use reserved names: {}",
        reserved.join(", ")
    )))
}

/// Decodes a compact JWT's payload without verifying the signature.
///
/// Test and diagnostic helper; never use the result for authorization.
///
/// # Errors
///
/// Returns an error if the token is not three base64url segments with
/// a JSON object payload.
pub fn decode_unverified(token: &str) -> Result<serde_json::Value, AuthError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::malformed_token(
            crate::error::TokenKind::IdToken,
            "token must have exactly three segments",
        ));
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        AuthError::malformed_token(
            crate::error::TokenKind::IdToken,
            format!("payload is not valid base64url: {e}"),
        )
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        AuthError::malformed_token(
            crate::error::TokenKind::IdToken,
            format!("payload is not valid JSON: {e}"),
        )
    })
}
