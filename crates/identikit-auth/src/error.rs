//! Error types for token lifecycle operations.
//!
//! Every failure surfaces a stable machine-readable code via
//! [`AuthError::code`] alongside a human-readable message. Codes that
//! depend on the kind of token being processed (expiry, revocation)
//! are keyed by [`TokenKind`].

use std::fmt;

use crate::backend::BackendError;
use crate::custom_token::SignerError;
use crate::keys::KeysError;

/// The kind of bearer token being verified.
///
/// ID tokens and session cookies share the same wire format and
/// verification algorithm but use distinct issuer prefixes, key-set
/// endpoints and error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// A short-lived token issued by the identity backend after sign-in.
    IdToken,
    /// A longer-lived cookie minted for server-side session management.
    SessionCookie,
}

impl TokenKind {
    /// Human-readable label used in error messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::IdToken => "ID token",
            Self::SessionCookie => "session cookie",
        }
    }

    /// Fragment used in machine-readable error codes.
    #[must_use]
    pub fn code_fragment(&self) -> &'static str {
        match self {
            Self::IdToken => "id-token",
            Self::SessionCookie => "session-cookie",
        }
    }

    /// Name of the API that verifies this kind of token.
    #[must_use]
    pub fn verify_api(&self) -> &'static str {
        match self {
            Self::IdToken => "verify_id_token()",
            Self::SessionCookie => "verify_session_cookie()",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors that can occur during token minting, verification and policy
/// enforcement.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// An argument failed local validation before any network call.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The bearer string is not a three-segment compact JWT.
    #[error("Malformed {kind}: {message}")]
    MalformedToken {
        /// The kind of token being verified.
        kind: TokenKind,
        /// Description of the structural defect.
        message: String,
    },

    /// The token header specifies an unsupported signing algorithm.
    #[error("{kind} has invalid algorithm {found:?}; expected \"RS256\"")]
    InvalidAlgorithm {
        /// The kind of token being verified.
        kind: TokenKind,
        /// The algorithm found in the token header.
        found: String,
    },

    /// The token has expired.
    #[error("{kind} has expired")]
    TokenExpired {
        /// The kind of token being verified.
        kind: TokenKind,
    },

    /// The token signature does not verify against any known key.
    #[error("{kind} has invalid signature")]
    InvalidSignature {
        /// The kind of token being verified.
        kind: TokenKind,
    },

    /// The token was issued before the account's valid-since timestamp.
    #[error("{kind} has been revoked")]
    TokenRevoked {
        /// The kind of token being verified.
        kind: TokenKind,
    },

    /// The decoded token's tenant claim does not satisfy this
    /// instance's tenant binding.
    #[error("Tenant ID mismatch: {message}")]
    TenantMismatch {
        /// Description of the mismatch (missing vs. mismatching).
        message: String,
    },

    /// The requested session-cookie lifetime is out of range.
    #[error("Session cookie duration must be between 5 minutes and 2 weeks")]
    InvalidSessionCookieDuration,

    /// No usable signing or backend credential is configured.
    #[error("Invalid credential: {message}")]
    InvalidCredential {
        /// Description of the missing capability.
        message: String,
    },

    /// No account exists for the decoded subject.
    #[error("No user record found for uid {uid}")]
    UserNotFound {
        /// The subject that was looked up.
        uid: String,
    },

    /// The public key set could not be fetched or is missing the
    /// token's key ID.
    #[error("Failed to obtain signing key")]
    KeyFetch {
        /// The underlying key-infrastructure failure.
        #[from]
        source: KeysError,
    },

    /// Token signing failed.
    #[error("Failed to sign token")]
    Signer {
        /// The underlying signing failure.
        #[from]
        source: SignerError,
    },

    /// A backend RPC (account lookup, cookie minting) failed.
    #[error("Backend request failed")]
    Backend {
        /// The underlying RPC failure.
        #[from]
        source: BackendError,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new `MalformedToken` error.
    #[must_use]
    pub fn malformed_token(kind: TokenKind, message: impl Into<String>) -> Self {
        Self::MalformedToken {
            kind,
            message: message.into(),
        }
    }

    /// Creates a new `TenantMismatch` error.
    #[must_use]
    pub fn tenant_mismatch(message: impl Into<String>) -> Self {
        Self::TenantMismatch {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidCredential` error.
    #[must_use]
    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::InvalidCredential {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "auth/invalid-argument",
            Self::MalformedToken { .. } => "auth/argument-error",
            Self::InvalidAlgorithm { .. } => "auth/invalid-algorithm",
            Self::TokenExpired { kind } => match kind {
                TokenKind::IdToken => "auth/id-token-expired",
                TokenKind::SessionCookie => "auth/session-cookie-expired",
            },
            Self::InvalidSignature { .. } => "auth/invalid-signature",
            Self::TokenRevoked { kind } => match kind {
                TokenKind::IdToken => "auth/id-token-revoked",
                TokenKind::SessionCookie => "auth/session-cookie-revoked",
            },
            Self::TenantMismatch { .. } => "auth/tenant-id-mismatch",
            Self::InvalidSessionCookieDuration => "auth/invalid-session-cookie-duration",
            Self::InvalidCredential { .. } => "auth/invalid-credential",
            Self::UserNotFound { .. } => "auth/user-not-found",
            Self::KeyFetch { .. } => "auth/key-fetch-error",
            Self::Signer { .. } => "auth/signing-error",
            Self::Backend { .. } => "auth/internal-error",
            Self::Internal { .. } => "auth/internal-error",
        }
    }

    /// Returns `true` if this error was raised by local argument
    /// validation, before any network call.
    #[must_use]
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. }
                | Self::MalformedToken { .. }
                | Self::InvalidSessionCookieDuration
        )
    }

    /// Returns `true` if this error was raised by cryptographic or
    /// claim verification.
    #[must_use]
    pub fn is_verification_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAlgorithm { .. }
                | Self::TokenExpired { .. }
                | Self::InvalidSignature { .. }
                | Self::TenantMismatch { .. }
        )
    }

    /// Returns `true` if this error was raised by the revocation check.
    #[must_use]
    pub fn is_revocation_error(&self) -> bool {
        matches!(self, Self::TokenRevoked { .. })
    }

    /// Returns `true` if this error originated in a network call.
    #[must_use]
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::KeyFetch { .. } | Self::Backend { .. } | Self::Signer { source: SignerError::Remote { .. } }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument { .. }
            | Self::MalformedToken { .. }
            | Self::InvalidSessionCookieDuration => ErrorCategory::Argument,
            Self::InvalidAlgorithm { .. }
            | Self::TokenExpired { .. }
            | Self::InvalidSignature { .. }
            | Self::TenantMismatch { .. } => ErrorCategory::Verification,
            Self::TokenRevoked { .. } => ErrorCategory::Revocation,
            Self::InvalidCredential { .. } | Self::Signer { .. } => ErrorCategory::Credential,
            Self::KeyFetch { .. } => ErrorCategory::KeyInfrastructure,
            Self::UserNotFound { .. } | Self::Backend { .. } | Self::Internal { .. } => {
                ErrorCategory::Backend
            }
        }
    }
}

/// Categories of token-lifecycle errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Local argument validation failures.
    Argument,
    /// Missing or unusable signing/backend credentials.
    Credential,
    /// Cryptographic and claim verification failures.
    Verification,
    /// Explicit revocation failures.
    Revocation,
    /// Key-set fetching and lookup failures.
    KeyInfrastructure,
    /// Backend RPC and internal failures.
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument => write!(f, "argument"),
            Self::Credential => write!(f, "credential"),
            Self::Verification => write!(f, "verification"),
            Self::Revocation => write!(f, "revocation"),
            Self::KeyInfrastructure => write!(f, "key-infrastructure"),
            Self::Backend => write!(f, "backend"),
        }
    }
}
