//! Shared-secret authentication.
//!
//! The daemon is protected by a single token. Browsers log in once and carry
//! a cookie holding the SHA-256 of the token; scripted clients send the token
//! itself as a bearer header or, for websockets, a `token` query parameter.
//! All comparisons are constant time.

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Name of the session cookie set by `/auth/login`.
pub const AUTH_COOKIE: &str = "webterm_auth";

/// Identity a request acts as. Sessions are owned by principals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Authentication is disabled; every caller is the same principal.
    Anonymous,
    /// Holder of the shared token, identified by its hash.
    Token(String),
}

impl Principal {
    /// Whether this principal may use a session owned by `owner`.
    pub fn may_access(&self, owner: &Principal) -> bool {
        self == owner
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "anonymous"),
            // Short prefix only; never log the full hash
            Principal::Token(hash) => write!(f, "token:{}", &hash[..hash.len().min(8)]),
        }
    }
}

/// Resolves request credentials to a [`Principal`].
#[derive(Clone)]
pub struct AuthGate {
    token_hash: Option<String>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("required", &self.is_required())
            .finish()
    }
}

impl AuthGate {
    /// Build a gate for `token`; `None` disables authentication.
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token_hash: token.map(hash_token),
        }
    }

    pub fn is_required(&self) -> bool {
        self.token_hash.is_some()
    }

    /// Checks a plaintext token, as submitted to the login endpoint.
    pub fn verify_token(&self, token: &str) -> Option<Principal> {
        let expected = self.token_hash.as_ref()?;
        constant_time_eq(&hash_token(token), expected).then(|| self.principal())
    }

    /// Checks a cookie value (the token hash).
    pub fn verify_cookie(&self, value: &str) -> Option<Principal> {
        let expected = self.token_hash.as_ref()?;
        constant_time_eq(value, expected).then(|| self.principal())
    }

    /// Resolves a request. Cookie, then bearer header, then query token.
    ///
    /// Returns `None` when authentication is required and no credential matches.
    pub fn resolve(&self, headers: &HeaderMap, query_token: Option<&str>) -> Option<Principal> {
        if !self.is_required() {
            return Some(Principal::Anonymous);
        }

        if let Some(principal) = cookie_value(headers, AUTH_COOKIE)
            .as_deref()
            .and_then(|value| self.verify_cookie(value))
        {
            return Some(principal);
        }

        if let Some(principal) = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(|token| self.verify_token(token))
        {
            return Some(principal);
        }

        query_token.and_then(|token| self.verify_token(token))
    }

    /// Value of the `Set-Cookie` header issued after a successful login.
    pub fn login_cookie(&self) -> Option<String> {
        self.token_hash.as_ref().map(|hash| {
            format!("{AUTH_COOKIE}={hash}; HttpOnly; SameSite=Strict; Path=/")
        })
    }

    fn principal(&self) -> Principal {
        match &self.token_hash {
            Some(hash) => Principal::Token(hash.clone()),
            None => Principal::Anonymous,
        }
    }
}

/// `Set-Cookie` value that clears the auth cookie.
pub fn logout_cookie() -> String {
    format!("{AUTH_COOKIE}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0")
}

/// SHA-256 of a token, hex encoded.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a random 32-byte token, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
