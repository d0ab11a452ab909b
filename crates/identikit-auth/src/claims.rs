//! Decoded token claims.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Provider-specific claims nested under the `identikit` key of every
/// ID token and session cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlatformClaims {
    /// The tenant the user signed in under, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    /// The provider used for this sign-in (e.g. `password`, `custom`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_in_provider: Option<String>,

    /// Identities linked to the account, keyed by provider.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub identities: HashMap<String, serde_json::Value>,
}

/// The verified claims of an ID token or session cookie.
///
/// Produced only by successful verification; holding one means the
/// token's signature and standard claims checked out at the time of
/// the call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecodedToken {
    /// Issuer. For ID tokens this is
    /// `https://securetoken.identikit.dev/<project-id>`; for session
    /// cookies, `https://session.identikit.dev/<project-id>`.
    pub iss: String,

    /// Audience; always the project ID.
    pub aud: String,

    /// Subject; the user's UID.
    pub sub: String,

    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,

    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,

    /// When the user last authenticated, seconds since the Unix epoch.
    pub auth_time: i64,

    /// Provider-specific claims.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identikit: Option<PlatformClaims>,

    /// Any remaining claims, including developer claims minted into
    /// custom tokens.
    #[serde(flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl DecodedToken {
    /// The user's UID (alias for `sub`).
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.sub
    }

    /// The tenant ID carried in the token, if any.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.identikit
            .as_ref()
            .and_then(|c| c.tenant.as_deref())
    }

    /// A custom claim by name, if present.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.custom.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_token_with_platform_claims() {
        let raw = json!({
            "iss": "https://securetoken.identikit.dev/demo-project",
            "aud": "demo-project",
            "sub": "user-123",
            "iat": 1_700_000_000,
            "exp": 1_700_003_600,
            "auth_time": 1_699_999_000,
            "identikit": {
                "tenant": "tenant-a",
                "sign_in_provider": "password"
            },
            "role": "admin"
        });

        let token: DecodedToken = serde_json::from_value(raw).unwrap();
        assert_eq!(token.uid(), "user-123");
        assert_eq!(token.tenant_id(), Some("tenant-a"));
        assert_eq!(token.claim("role"), Some(&json!("admin")));
        assert_eq!(
            token.identikit.as_ref().unwrap().sign_in_provider.as_deref(),
            Some("password")
        );
    }

    #[test]
    fn test_decode_token_without_platform_claims() {
        let raw = json!({
            "iss": "https://securetoken.identikit.dev/demo-project",
            "aud": "demo-project",
            "sub": "user-123",
            "iat": 1_700_000_000,
            "exp": 1_700_003_600,
            "auth_time": 1_700_000_000
        });

        let token: DecodedToken = serde_json::from_value(raw).unwrap();
        assert!(token.tenant_id().is_none());
        assert!(token.custom.is_empty());
    }

    #[test]
    fn test_custom_claims_survive_round_trip() {
        let raw = json!({
            "iss": "https://session.identikit.dev/demo-project",
            "aud": "demo-project",
            "sub": "user-456",
            "iat": 1_700_000_000,
            "exp": 1_700_003_600,
            "auth_time": 1_700_000_000,
            "premium": true,
            "level": 7
        });

        let token: DecodedToken = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&token).unwrap();
        assert_eq!(back, raw);
    }
}
