//! Password hashing, opaque bearer tokens and the authenticated-user extractor.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::service::{ApiError, AppState, unauthorized_error};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

#[cfg(not(test))]
const PBKDF2_ITERATIONS: u32 = 600_000;
#[cfg(test)]
const PBKDF2_ITERATIONS: u32 = 1_000;
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;
const HASH_SCHEME: &str = "pbkdf2_sha256";
/// Expired tokens are swept once every this many issues
const SWEEP_EVERY: u64 = 64;

/// Hash as `pbkdf2_sha256$<iterations>$<salt>$<hash>` with a fresh random salt
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt, PBKDF2_ITERATIONS);
    format!(
        "{HASH_SCHEME}${PBKDF2_ITERATIONS}${}${}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(hash)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != HASH_SCHEME {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<u32>(),
        URL_SAFE_NO_PAD.decode(salt),
        URL_SAFE_NO_PAD.decode(hash),
    ) else {
        return false;
    };
    if expected.len() != HASH_LENGTH {
        return false;
    }
    let actual = derive(password, &salt, iterations);
    actual[..].ct_eq(&expected[..]).into()
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LENGTH] {
    let mut out = [0u8; HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// 256 random bits, URL-safe base64
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time string comparison
pub fn secrets_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Caller identity resolved from a bearer token
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
}

struct IssuedToken {
    user: AuthUser,
    expires_at: DateTime<Utc>,
}

/// Process-local registry of issued access tokens
pub struct TokenRegistry {
    tokens: Arc<DashMap<String, IssuedToken>>,
    ttl: Duration,
    issued: AtomicU64,
}

impl TokenRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            ttl,
            issued: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, user: AuthUser) -> String {
        if self.issued.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_expired();
        }
        let token = random_token();
        self.tokens.insert(
            token.clone(),
            IssuedToken {
                user,
                expires_at: Utc::now() + self.ttl,
            },
        );
        token
    }

    /// Owner of a live token. Expired tokens are dropped on lookup.
    pub fn resolve(&self, token: &str) -> Option<AuthUser> {
        let now = Utc::now();
        let user = {
            let entry = self.tokens.get(token)?;
            (entry.expires_at > now).then(|| entry.user.clone())
        };
        if user.is_none() {
            debug!("Dropping expired access token");
            self.tokens.remove(token);
        }
        user
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Drop every expired token; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, issued| issued.expires_at > now);
        let removed = before.saturating_sub(self.tokens.len());
        if removed > 0 {
            debug!(removed, "Swept expired access tokens");
        }
        removed
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn bearer_value(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Credential from the access-token cookie, else the `Authorization: Bearer` header
pub fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    cookie_value(headers, ACCESS_TOKEN_COOKIE).or_else(|| bearer_value(headers))
}

/// `Set-Cookie` value carrying a fresh access token
pub fn access_cookie(token: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{ACCESS_TOKEN_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax; Max-Age={max_age_seconds}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn expired_cookie(secure: bool) -> String {
    access_cookie("", 0, secure)
}

/// Authenticated caller, extracted from the request credential
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: AuthUser,
    pub token: String,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        // A stale cookie must not hide a valid bearer header
        let candidates = [
            cookie_value(&parts.headers, ACCESS_TOKEN_COOKIE),
            bearer_value(&parts.headers),
        ];
        if candidates.iter().all(Option::is_none) {
            return Err(unauthorized_error("Not authenticated"));
        }
        candidates
            .into_iter()
            .flatten()
            .find_map(|token| {
                state
                    .tokens
                    .resolve(&token)
                    .map(|user| CurrentUser { user, token })
            })
            .ok_or_else(|| unauthorized_error("Invalid or expired token"))
    }
}
