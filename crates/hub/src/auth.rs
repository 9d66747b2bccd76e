use anyhow::{Context, Result};
use hmac::Hmac;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use pbkdf2::pbkdf2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::Store;
use crate::errors::AuthError;

const MIN_PASSWORD_LEN: usize = 8;

/// JWT claims for authenticated client sessions.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username).
    pub sub: String,
    /// Whether this principal may manage other accounts and view the
    /// `/api/admin/*` surface.
    pub admin: bool,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
    /// Issued at (Unix timestamp).
    pub iat: u64,
}

const PBKDF2_SALT_LEN: usize = 16;
const PBKDF2_HASH_LEN: usize = 64;

/// Hash a password with PBKDF2-HMAC-SHA512, returning `iterations$salt_hex$hash_hex`.
pub fn hash_password(password: &str, iterations: u32) -> String {
    let mut salt = [0u8; PBKDF2_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hash = [0u8; PBKDF2_HASH_LEN];
    pbkdf2::<Hmac<Sha512>>(password.as_bytes(), &salt, iterations, &mut hash)
        .expect("HMAC can be initialized with any key length");
    format!("{iterations}${}${}", hex::encode(salt), hex::encode(hash))
}

/// Verify a password against a hash produced by [`hash_password`].
///
/// Returns `false` (rather than erroring) on a malformed stored hash, so a
/// corrupted credential record fails closed instead of panicking.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(iterations), Some(salt_hex), Some(hash_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(hash_hex) else {
        return false;
    };

    let mut computed = vec![0u8; expected.len()];
    if pbkdf2::<Hmac<Sha512>>(password.as_bytes(), &salt, iterations, &mut computed).is_err() {
        return false;
    }

    constant_time_eq(&computed, &expected)
}

/// Constant-time byte comparison, used for both token and password-hash
/// comparisons to avoid timing side channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a JWT token for an authenticated principal.
pub fn generate_jwt(username: &str, admin: bool, secret: &str, ttl_seconds: u64) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();

    let claims = Claims {
        sub: username.to_string(),
        admin,
        iat: now,
        exp: now + ttl_seconds,
    };

    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to encode JWT")?;

    Ok(token)
}

/// Validate a JWT token and return the claims.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);

    let token_data: TokenData<Claims> = jsonwebtoken::decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("invalid or expired token")?;

    Ok(token_data.claims)
}

/// Generate a cryptographically secure random hex secret, used both for the
/// JWT signing secret and for generated setup tokens.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(out, "{b:02x}").unwrap();
        }
        out
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        if s.len() % 2 != 0 {
            return Err(());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
            .collect()
    }
}

/// Loopback-or-setup-ticket gate on `POST /api/auth/setup` (spec §4.1).
pub fn is_loopback_peer(addr: IpAddr) -> bool {
    addr.is_loopback()
}

/// Constant-time comparison of a presented setup ticket against the
/// configured one. `None` on either side never matches.
pub fn setup_ticket_matches(provided: Option<&str>, configured: Option<&str>) -> bool {
    match (provided, configured) {
        (Some(p), Some(c)) => constant_time_eq(p.as_bytes(), c.as_bytes()),
        _ => false,
    }
}

/// The single administrative [`Principal`] (spec §3, §4.1): `status`,
/// `setup`, `login`, `change`, `verify_bearer`.
pub struct CredentialStore {
    store: Arc<Store>,
    jwt_secret: String,
    jwt_ttl_seconds: u64,
    pbkdf2_iterations: u32,
    setup_token: Option<String>,
}

impl CredentialStore {
    pub fn new(
        store: Arc<Store>,
        jwt_secret: String,
        jwt_ttl_seconds: u64,
        pbkdf2_iterations: u32,
        setup_token: Option<String>,
    ) -> Self {
        Self {
            store,
            jwt_secret,
            jwt_ttl_seconds,
            pbkdf2_iterations,
            setup_token,
        }
    }

    pub async fn needs_setup(&self) -> Result<bool> {
        Ok(self.store.load_auth().await?.is_none())
    }

    /// `setup(password, setup_ticket?)`. Caller has already applied the
    /// loopback-or-ticket gate (needs the peer address, which this type does
    /// not see) before invoking this.
    pub async fn setup(&self, password: &str) -> Result<String, AuthError> {
        if self
            .store
            .load_auth()
            .await
            .map_err(|_| AuthError::NotConfigured)?
            .is_some()
        {
            return Err(AuthError::AlreadyConfigured);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let hash = hash_password(password, self.pbkdf2_iterations);
        self.store
            .save_auth(&hash, self.pbkdf2_iterations)
            .await
            .map_err(|_| AuthError::NotConfigured)?;

        generate_jwt("admin", true, &self.jwt_secret, self.jwt_ttl_seconds)
            .map_err(|_| AuthError::InvalidCredentials)
    }

    pub async fn login(&self, password: &str) -> Result<String, AuthError> {
        let record = self
            .store
            .load_auth()
            .await
            .map_err(|_| AuthError::NotConfigured)?
            .ok_or(AuthError::NotConfigured)?;

        if !verify_password(password, &record.hash) {
            return Err(AuthError::InvalidCredentials);
        }

        generate_jwt("admin", true, &self.jwt_secret, self.jwt_ttl_seconds)
            .map_err(|_| AuthError::InvalidCredentials)
    }

    pub async fn change(&self, current: &str, new_password: &str) -> Result<(), AuthError> {
        let record = self
            .store
            .load_auth()
            .await
            .map_err(|_| AuthError::NotConfigured)?
            .ok_or(AuthError::NotConfigured)?;

        if !verify_password(current, &record.hash) {
            return Err(AuthError::InvalidCredentials);
        }
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let hash = hash_password(new_password, self.pbkdf2_iterations);
        self.store
            .save_auth(&hash, self.pbkdf2_iterations)
            .await
            .map_err(|_| AuthError::NotConfigured)?;
        Ok(())
    }

    pub fn verify_bearer(&self, token: &str) -> Result<Claims, AuthError> {
        validate_jwt(token, &self.jwt_secret).map_err(|_| AuthError::InvalidBearer)
    }

    pub fn setup_ticket(&self) -> Option<&str> {
        self.setup_token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_roundtrip() {
        let secret = "test-secret-for-jwt";
        let token = generate_jwt("testuser", false, secret, 3600).unwrap();
        let claims = validate_jwt(&token, secret).unwrap();
        assert_eq!(claims.sub, "testuser");
        assert!(!claims.admin);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn jwt_carries_admin_flag() {
        let secret = "test-secret";
        let token = generate_jwt("root", true, secret, 3600).unwrap();
        let claims = validate_jwt(&token, secret).unwrap();
        assert!(claims.admin);
    }

    #[test]
    fn jwt_rejects_wrong_secret() {
        let token = generate_jwt("testuser", false, "correct-secret", 3600).unwrap();
        assert!(validate_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn jwt_rejects_garbage() {
        assert!(validate_jwt("not.a.token", "secret").is_err());
    }

    #[test]
    fn generate_secret_is_64_hex_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_secret_is_unique() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse battery staple", 1_000);
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn password_hash_is_salted() {
        let a = hash_password("same-password", 1_000);
        let b = hash_password("same-password", 1_000);
        assert_ne!(a, b, "two hashes of the same password must use different salts");
    }

    #[test]
    fn verify_password_rejects_malformed_hash() {
        assert!(!verify_password("anything", "not-a-valid-hash"));
        assert!(!verify_password("anything", "1000$zz$zz"));
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn loopback_v4_and_v6_are_recognised() {
        assert!(is_loopback_peer("127.0.0.1".parse().unwrap()));
        assert!(is_loopback_peer("::1".parse().unwrap()));
        assert!(!is_loopback_peer("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn setup_ticket_matching_is_constant_time_and_exact() {
        assert!(setup_ticket_matches(Some("abc"), Some("abc")));
        assert!(!setup_ticket_matches(Some("abc"), Some("abd")));
        assert!(!setup_ticket_matches(None, Some("abc")));
        assert!(!setup_ticket_matches(Some("abc"), None));
    }

    async fn memory_credential_store() -> CredentialStore {
        let store = Arc::new(crate::db::Store::open(":memory:").await.unwrap());
        CredentialStore::new(store, "test-secret".to_string(), 3600, 1_000, None)
    }

    #[tokio::test]
    async fn needs_setup_is_true_before_first_setup() {
        let store = memory_credential_store().await;
        assert!(store.needs_setup().await.unwrap());
    }

    #[tokio::test]
    async fn setup_then_login_succeeds_with_right_password() {
        let store = memory_credential_store().await;
        let token = store.setup("hunter2hunter").await.unwrap();
        assert!(store.verify_bearer(&token).is_ok());
        assert!(!store.needs_setup().await.unwrap());

        let login_token = store.login("hunter2hunter").await.unwrap();
        assert!(store.verify_bearer(&login_token).is_ok());
    }

    #[tokio::test]
    async fn setup_twice_fails() {
        let store = memory_credential_store().await;
        store.setup("hunter2hunter").await.unwrap();
        let err = store.setup("another-password").await.unwrap_err();
        assert!(matches!(err, AuthError::AlreadyConfigured));
    }

    #[tokio::test]
    async fn setup_rejects_weak_password() {
        let store = memory_credential_store().await;
        let err = store.setup("short").await.unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword));
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let store = memory_credential_store().await;
        store.setup("hunter2hunter").await.unwrap();
        let err = store.login("wrong-password").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn change_password_then_login_with_new_password() {
        let store = memory_credential_store().await;
        store.setup("hunter2hunter").await.unwrap();
        store
            .change("hunter2hunter", "new-password-1")
            .await
            .unwrap();
        assert!(store.login("new-password-1").await.is_ok());
        assert!(store.login("hunter2hunter").await.is_err());
    }
}
