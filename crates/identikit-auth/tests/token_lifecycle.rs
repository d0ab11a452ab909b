//! End-to-end token lifecycle tests against a mocked key endpoint and
//! identity backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer};
use serde_json::json;
use time::OffsetDateTime;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use identikit_auth::{
    AuthClient, AuthError, Credentials, ServiceAccountCredential, SigningKeyCacheConfig,
    MAX_SESSION_COOKIE_DURATION, MIN_SESSION_COOKIE_DURATION,
    verify::{ID_TOKEN_ISSUER_PREFIX, SESSION_COOKIE_ISSUER_PREFIX},
};

const PROJECT_ID: &str = "demo-project";
const KID: &str = "key-1";

/// An RSA keypair plus the machinery to sign tokens the way the
/// identity backend would.
struct TestKeys {
    signing_key: rsa::pkcs1v15::SigningKey<rsa::sha2::Sha256>,
    private_pem: String,
    public_pem: String,
}

impl TestKeys {
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let private_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        Self {
            signing_key: rsa::pkcs1v15::SigningKey::new(private_key),
            private_pem,
            public_pem,
        }
    }

    /// Signs an RS256 token with the given payload, as the backend
    /// would when issuing an ID token or session cookie.
    fn sign_token(&self, kid: &str, payload: &serde_json::Value) -> String {
        let header = json!({"alg": "RS256", "typ": "JWT", "kid": kid});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap()),
        );
        let signature = self.signing_key.sign(signing_input.as_bytes()).to_vec();
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
    }

    fn id_token_payload(&self, uid: &str) -> serde_json::Value {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        json!({
            "iss": format!("{ID_TOKEN_ISSUER_PREFIX}{PROJECT_ID}"),
            "aud": PROJECT_ID,
            "sub": uid,
            "iat": now - 10,
            "exp": now + 3600,
            "auth_time": now - 30,
        })
    }
}

fn credentials(keys: &TestKeys) -> Credentials {
    Credentials::ServiceAccount(ServiceAccountCredential {
        project_id: PROJECT_ID.to_string(),
        client_email: "signer@demo-project.identikit.dev".to_string(),
        private_key: keys.private_pem.clone(),
        private_key_id: Some(KID.to_string()),
        token_uri: None,
    })
}

/// Opt-in log output for debugging, driven by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Builds a client whose key endpoints and backend all point at the
/// mock server.
fn client_against(server: &MockServer, keys: &TestKeys) -> AuthClient {
    init_tracing();
    let base = Url::parse(&server.uri()).unwrap();
    AuthClient::builder(credentials(keys))
        .with_backend_url(base.clone())
        .with_access_token("test-access-token")
        .with_id_token_key_url(base.join("/keys/id").unwrap())
        .with_session_cookie_key_url(base.join("/keys/session").unwrap())
        .with_key_cache_config(SigningKeyCacheConfig::default().with_allow_http(true))
        .build()
        .unwrap()
}

async fn mount_key_set(server: &MockServer, endpoint: &str, keys: &TestKeys) {
    Mock::given(method("GET"))
        .and(path(endpoint))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "public, max-age=3600")
                .set_body_json(json!({ KID: keys.public_pem })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn verify_id_token_round_trip() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    let client = client_against(&server, &keys);
    let uid = uuid::Uuid::new_v4().to_string();
    let token = keys.sign_token(KID, &keys.id_token_payload(&uid));

    let decoded = client.verify_id_token(&token, false).await.unwrap();
    assert_eq!(decoded.uid(), uid);
    assert_eq!(decoded.aud, PROJECT_ID);
}

#[tokio::test]
async fn verification_is_idempotent_and_key_fetch_is_cached() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/keys/id"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=3600")
                .set_body_json(json!({ KID: keys.public_pem })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);
    let token = keys.sign_token(KID, &keys.id_token_payload("user-123"));

    // Repeated verification of the same token yields the same claims
    // and does not refetch the key set.
    let first = client.verify_id_token(&token, false).await.unwrap();
    let second = client.verify_id_token(&token, false).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn cold_cache_concurrent_verifies_fetch_once() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/keys/id"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=3600")
                .set_body_json(json!({ KID: keys.public_pem }))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);
    let token = keys.sign_token(KID, &keys.id_token_payload("user-123"));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(
            async move { client.verify_id_token(&token, false).await },
        ));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn token_signed_by_unknown_key_is_rejected() {
    let keys = TestKeys::generate();
    let attacker_keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    let client = client_against(&server, &keys);
    let token = attacker_keys.sign_token(KID, &keys.id_token_payload("user-123"));

    let err = client.verify_id_token(&token, false).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidSignature { .. }), "{err:?}");
    assert_eq!(err.code(), "auth/invalid-signature");
}

#[tokio::test]
async fn unknown_kid_triggers_refresh_then_fails() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;

    // The rotated-out kid is absent from the set even after a refresh,
    // so the cache fetches twice (initial fill plus the retry an
    // unknown kid forces) and the lookup fails.
    Mock::given(method("GET"))
        .and(path("/keys/id"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=3600")
                .set_body_json(json!({ KID: keys.public_pem })),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);
    let token = keys.sign_token("rotated-out", &keys.id_token_payload("user-123"));

    // Warm the cache with a good token first.
    let good = keys.sign_token(KID, &keys.id_token_payload("user-123"));
    client.verify_id_token(&good, false).await.unwrap();

    let err = client.verify_id_token(&token, false).await.unwrap_err();
    assert!(matches!(err, AuthError::KeyFetch { .. }), "{err:?}");
}

#[tokio::test]
async fn stale_key_set_is_served_when_refresh_fails() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;

    // First fetch succeeds with an immediately-expiring TTL, every
    // later fetch fails; the cached set stays usable for the grace
    // window.
    Mock::given(method("GET"))
        .and(path("/keys/id"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=0")
                .set_body_json(json!({ KID: keys.public_pem })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/keys/id"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let base = Url::parse(&server.uri()).unwrap();
    let client = AuthClient::builder(credentials(&keys))
        .with_backend_url(base.clone())
        .with_id_token_key_url(base.join("/keys/id").unwrap())
        .with_session_cookie_key_url(base.join("/keys/session").unwrap())
        .with_key_cache_config(
            SigningKeyCacheConfig::default()
                .with_allow_http(true)
                .with_min_ttl(Duration::ZERO)
                .with_stale_if_error(Duration::from_secs(3600)),
        )
        .build()
        .unwrap();

    let token = keys.sign_token(KID, &keys.id_token_payload("user-123"));
    client.verify_id_token(&token, false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.verify_id_token(&token, false).await.unwrap();
}

#[tokio::test]
async fn revoked_token_is_rejected_and_fresh_token_accepted() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    let now = OffsetDateTime::now_utc().unix_timestamp();

    // The account's tokens were revoked one minute ago. The lookup
    // must arrive with the configured bearer token.
    Mock::given(method("POST"))
        .and(path("/v1/accounts:lookup"))
        .and(header("authorization", "Bearer test-access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [{
                "localId": "user-123",
                "validSince": (now - 60).to_string(),
            }]
        })))
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);

    // Signed in before the revocation mark.
    let mut payload = keys.id_token_payload("user-123");
    payload["auth_time"] = json!(now - 120);
    payload["iat"] = json!(now - 120);
    let old_token = keys.sign_token(KID, &payload);

    // Without the revocation check the token still verifies.
    client.verify_id_token(&old_token, false).await.unwrap();

    let err = client.verify_id_token(&old_token, true).await.unwrap_err();
    assert!(matches!(err, AuthError::TokenRevoked { .. }), "{err:?}");
    assert_eq!(err.code(), "auth/id-token-revoked");

    // Signed in after the revocation mark.
    let mut payload = keys.id_token_payload("user-123");
    payload["auth_time"] = json!(now - 30);
    let fresh_token = keys.sign_token(KID, &payload);
    client.verify_id_token(&fresh_token, true).await.unwrap();
}

#[tokio::test]
async fn revocation_check_fails_closed_on_backend_outage() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    Mock::given(method("POST"))
        .and(path("/v1/accounts:lookup"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);
    let token = keys.sign_token(KID, &keys.id_token_payload("user-123"));

    // The token itself is fine.
    client.verify_id_token(&token, false).await.unwrap();

    // But a requested revocation check that cannot run must not be
    // silently skipped.
    let err = client.verify_id_token(&token, true).await.unwrap_err();
    assert!(matches!(err, AuthError::Backend { .. }), "{err:?}");
}

#[tokio::test]
async fn rejected_access_token_surfaces_as_credential_error() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    Mock::given(method("POST"))
        .and(path("/v1/accounts:lookup"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);
    let token = keys.sign_token(KID, &keys.id_token_payload("user-123"));

    let err = client.verify_id_token(&token, true).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredential { .. }), "{err:?}");
    assert_eq!(err.code(), "auth/invalid-credential");
}

#[tokio::test]
async fn revocation_check_surfaces_missing_account() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    Mock::given(method("POST"))
        .and(path("/v1/accounts:lookup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": []})))
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);
    let token = keys.sign_token(KID, &keys.id_token_payload("ghost"));

    let err = client.verify_id_token(&token, true).await.unwrap_err();
    assert!(matches!(err, AuthError::UserNotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn tenant_scoped_client_enforces_tenant_claim() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    let client = client_against(&server, &keys);
    let scoped = client.tenant("tenant-a");

    // No tenant claim at all.
    let token = keys.sign_token(KID, &keys.id_token_payload("user-123"));
    let err = scoped.verify_id_token(&token, false).await.unwrap_err();
    let AuthError::TenantMismatch { message } = &err else {
        panic!("expected TenantMismatch, got {err:?}");
    };
    assert!(message.contains("missing"));

    // Wrong tenant.
    let mut payload = keys.id_token_payload("user-123");
    payload["identikit"] = json!({"tenant": "tenant-b"});
    let token = keys.sign_token(KID, &payload);
    let err = scoped.verify_id_token(&token, false).await.unwrap_err();
    let AuthError::TenantMismatch { message } = &err else {
        panic!("expected TenantMismatch, got {err:?}");
    };
    assert!(message.contains("mismatching"));

    // Matching tenant passes the scoped client and still passes the
    // unscoped parent.
    let mut payload = keys.id_token_payload("user-123");
    payload["identikit"] = json!({"tenant": "tenant-a"});
    let token = keys.sign_token(KID, &payload);
    scoped.verify_id_token(&token, false).await.unwrap();
    client.verify_id_token(&token, false).await.unwrap();
}

#[tokio::test]
async fn session_cookie_minting_and_verification() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/session", &keys).await;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let cookie_payload = json!({
        "iss": format!("{SESSION_COOKIE_ISSUER_PREFIX}{PROJECT_ID}"),
        "aud": PROJECT_ID,
        "sub": "user-123",
        "iat": now - 10,
        "exp": now + 3600,
        "auth_time": now - 30,
    });
    let cookie = keys.sign_token(KID, &cookie_payload);

    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT_ID}:createSessionCookie")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"sessionCookie": cookie})),
        )
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);

    let minted = client
        .create_session_cookie("some-id-token", Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(minted, cookie);

    let decoded = client.verify_session_cookie(&minted, false).await.unwrap();
    assert_eq!(decoded.uid(), "user-123");

    // A session cookie does not pass the ID-token verifier.
    let err = client.verify_id_token(&minted, false).await.unwrap_err();
    assert!(matches!(err, AuthError::MalformedToken { .. }), "{err:?}");
}

#[tokio::test]
async fn session_cookie_duration_bounds_are_inclusive() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT_ID}:createSessionCookie")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"sessionCookie": "cookie"})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = client_against(&server, &keys);

    // Exactly at both bounds is accepted and reaches the backend.
    client
        .create_session_cookie("id-token", MIN_SESSION_COOKIE_DURATION)
        .await
        .unwrap();
    client
        .create_session_cookie("id-token", MAX_SESSION_COOKIE_DURATION)
        .await
        .unwrap();

    // A millisecond outside either bound is rejected locally.
    let err = client
        .create_session_cookie(
            "id-token",
            MIN_SESSION_COOKIE_DURATION - Duration::from_millis(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidSessionCookieDuration));

    let err = client
        .create_session_cookie(
            "id-token",
            MAX_SESSION_COOKIE_DURATION + Duration::from_millis(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidSessionCookieDuration));
}

#[tokio::test]
async fn tenant_scoped_cookie_minting_verifies_the_id_token() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    mount_key_set(&server, "/keys/id", &keys).await;

    Mock::given(method("POST"))
        .and(path(format!(
            "/v1/projects/{PROJECT_ID}/tenants/tenant-a:createSessionCookie"
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"sessionCookie": "cookie"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_against(&server, &keys).tenant("tenant-a");

    // An ID token from the wrong tenant never reaches the backend.
    let mut payload = keys.id_token_payload("user-123");
    payload["identikit"] = json!({"tenant": "tenant-b"});
    let wrong_tenant = keys.sign_token(KID, &payload);
    let err = client
        .create_session_cookie(&wrong_tenant, Duration::from_secs(3600))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TenantMismatch { .. }), "{err:?}");

    let mut payload = keys.id_token_payload("user-123");
    payload["identikit"] = json!({"tenant": "tenant-a"});
    let right_tenant = keys.sign_token(KID, &payload);
    client
        .create_session_cookie(&right_tenant, Duration::from_secs(3600))
        .await
        .unwrap();
}

#[tokio::test]
async fn custom_token_carries_developer_claims() {
    let keys = TestKeys::generate();
    let server = MockServer::start().await;
    let client = client_against(&server, &keys);

    let mut claims = HashMap::new();
    claims.insert("premium".to_string(), json!(true));

    let token = client
        .create_custom_token_with_claims("user-123", Some(&claims))
        .await
        .unwrap();

    let payload = identikit_auth::custom_token::decode_unverified(&token).unwrap();
    assert_eq!(payload["uid"], "user-123");
    assert_eq!(payload["claims"]["premium"], true);
    assert_eq!(
        payload["exp"].as_i64().unwrap() - payload["iat"].as_i64().unwrap(),
        identikit_auth::CUSTOM_TOKEN_LIFETIME_SECS
    );
}
