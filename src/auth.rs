/* modelgate/src/auth.rs

Access guard for the model-facing endpoints.

- When an operator token is configured (API_KEY / --api-key), every guarded
  route requires `Authorization: Bearer <token>`.
- When no token is configured the guard lets everything through. This is an
  operational default for private networks and local development, NOT a
  security recommendation: anything that can reach the port can use every
  configured backend.

Tokens are compared through their SHA-256 digests in constant time so the
comparison does not leak the length of the matching prefix.

*/

#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};

/// Result of inspecting an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// No token configured; access is open.
    Open,
    Valid,
    Missing,
    InvalidTokenFormat,
    Mismatch,
}

#[derive(Clone)]
pub struct AccessGuard {
    digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AccessGuard {
    /// Build a guard for `token`. Empty or whitespace-only tokens disable it.
    pub fn new(token: Option<&str>) -> Self {
        let digest = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(sha256);
        Self { digest }
    }

    /// A guard that never rejects.
    pub fn open() -> Self {
        Self { digest: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.digest.is_some()
    }

    pub fn verify(&self, auth_header: Option<&str>) -> Verification {
        let Some(expected) = self.digest.as_ref() else {
            return Verification::Open;
        };
        let token = match parse_bearer(auth_header) {
            Ok(token) => token,
            Err(v) => return v,
        };
        if ct_eq(&sha256(token), expected) {
            Verification::Valid
        } else {
            Verification::Mismatch
        }
    }

    /// Map the verification outcome onto the gateway error taxonomy.
    pub fn authorize(&self, auth_header: Option<&str>) -> Result<()> {
        match self.verify(auth_header) {
            Verification::Open | Verification::Valid => Ok(()),
            Verification::Missing | Verification::InvalidTokenFormat => {
                Err(GatewayError::Unauthorized("Missing token".into()))
            }
            Verification::Mismatch => Err(GatewayError::Unauthorized("Invalid token".into())),
        }
    }

    /// Convenience wrapper over the inbound actix header map.
    pub fn authorize_headers(&self, headers: &actix_web::http::header::HeaderMap) -> Result<()> {
        let auth = headers
            .get(actix_web::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        self.authorize(auth)
    }
}

fn parse_bearer(auth_header: Option<&str>) -> std::result::Result<&str, Verification> {
    let raw = auth_header.ok_or(Verification::Missing)?;
    let s = raw.trim();
    if s.len() < 7 {
        return Err(Verification::InvalidTokenFormat);
    }
    let (Some(scheme), Some(rest)) = (s.get(..6), s.get(6..)) else {
        return Err(Verification::InvalidTokenFormat);
    };
    if !scheme.eq_ignore_ascii_case("bearer") || !rest.starts_with(char::is_whitespace) {
        return Err(Verification::InvalidTokenFormat);
    }
    let token = rest.trim();
    if token.is_empty() {
        return Err(Verification::InvalidTokenFormat);
    }
    Ok(token)
}

fn sha256(data: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data.as_bytes()));
    out
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_guard_accepts_everything() {
        let guard = AccessGuard::new(None);
        assert!(!guard.is_enabled());
        assert_eq!(guard.verify(None), Verification::Open);
        assert!(guard.authorize(Some("Bearer whatever")).is_ok());
        assert!(!AccessGuard::new(Some("   ")).is_enabled());
    }

    #[test]
    fn configured_guard_checks_bearer_token() {
        let guard = AccessGuard::new(Some("secret"));
        assert_eq!(guard.verify(None), Verification::Missing);
        assert_eq!(guard.verify(Some("Basic abc")), Verification::InvalidTokenFormat);
        assert_eq!(guard.verify(Some("Bearer")), Verification::InvalidTokenFormat);
        assert_eq!(guard.verify(Some("Bearersecret")), Verification::InvalidTokenFormat);
        assert_eq!(guard.verify(Some("Bearer wrong")), Verification::Mismatch);
        assert_eq!(guard.verify(Some("Bearer secret")), Verification::Valid);
        assert_eq!(guard.verify(Some("  bearer   secret ")), Verification::Valid);
    }

    #[test]
    fn authorize_maps_to_unauthorized() {
        let guard = AccessGuard::new(Some("secret"));
        match guard.authorize(None) {
            Err(GatewayError::Unauthorized(msg)) => assert_eq!(msg, "Missing token"),
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        match guard.authorize(Some("Bearer nope")) {
            Err(GatewayError::Unauthorized(msg)) => assert_eq!(msg, "Invalid token"),
            other => panic!("expected Unauthorized, got {other:?}"),
        }
    }

    #[test]
    fn ct_eq_compares_length_and_content() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}
