//! Edge authorization.
//!
//! Sessions are owned by the upstream session layer, which forwards the
//! authenticated user and role as headers. Core operations only ever see a
//! `Session` that passed `require_role`.

use crate::errors::AppError;
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const SESSION_USER_HEADER: &str = "x-session-user";
pub const SESSION_ROLE_HEADER: &str = "x-session-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Photographer,
    Parent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Admin => "admin",
            Role::Photographer => "photographer",
            Role::Parent => "parent",
        })
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "photographer" => Ok(Role::Photographer),
            "parent" => Ok(Role::Parent),
            other => Err(AuthError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("role `{0}` is not allowed to perform this action")]
    Forbidden(Role),
    #[error("unknown role `{0}`")]
    UnknownRole(String),
    #[error("invalid trigger credentials")]
    BadCredentials,
    #[error("trigger secret is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
}

impl Session {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let user_id = header(SESSION_USER_HEADER).ok_or(AuthError::Unauthenticated)?;
        let role = header(SESSION_ROLE_HEADER)
            .ok_or(AuthError::Unauthenticated)?
            .parse()?;
        Ok(Self {
            user_id: user_id.to_string(),
            role,
        })
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Session::from_headers(&parts.headers)?)
    }
}

/// The single capability check run before any core operation.
pub fn require_role<'a>(session: &'a Session, allowed: &[Role]) -> Result<&'a Session, AuthError> {
    if allowed.contains(&session.role) {
        Ok(session)
    } else {
        Err(AuthError::Forbidden(session.role))
    }
}

/// Check `Authorization: Bearer <secret>` against the configured trigger secret.
pub fn verify_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthError> {
    let expected = expected.ok_or(AuthError::NotConfigured)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AuthError::BadCredentials)?;

    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::BadCredentials)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn session_requires_user_and_known_role() {
        let ok = Session::from_headers(&headers(&[
            (SESSION_USER_HEADER, "u-1"),
            (SESSION_ROLE_HEADER, "Photographer"),
        ]))
        .unwrap();
        assert_eq!(ok.role, Role::Photographer);

        assert!(matches!(
            Session::from_headers(&headers(&[(SESSION_ROLE_HEADER, "admin")])),
            Err(AuthError::Unauthenticated)
        ));
        assert!(matches!(
            Session::from_headers(&headers(&[
                (SESSION_USER_HEADER, "u-1"),
                (SESSION_ROLE_HEADER, "janitor"),
            ])),
            Err(AuthError::UnknownRole(_))
        ));
    }

    #[test]
    fn require_role_checks_membership() {
        let parent = Session {
            user_id: "p".into(),
            role: Role::Parent,
        };
        assert!(require_role(&parent, &[Role::Parent, Role::Admin]).is_ok());
        assert!(matches!(
            require_role(&parent, &[Role::Admin]),
            Err(AuthError::Forbidden(Role::Parent))
        ));
    }

    #[test]
    fn bearer_secret_must_match_exactly() {
        let good = headers(&[("authorization", "Bearer s3cret")]);
        let bad = headers(&[("authorization", "Bearer s3cre")]);
        let other_scheme = headers(&[("authorization", "Basic s3cret")]);

        assert!(verify_bearer(&good, Some("s3cret")).is_ok());
        assert!(matches!(verify_bearer(&bad, Some("s3cret")), Err(AuthError::BadCredentials)));
        assert!(matches!(
            verify_bearer(&other_scheme, Some("s3cret")),
            Err(AuthError::BadCredentials)
        ));
        assert!(matches!(
            verify_bearer(&HeaderMap::new(), Some("s3cret")),
            Err(AuthError::BadCredentials)
        ));
        assert!(matches!(verify_bearer(&good, None), Err(AuthError::NotConfigured)));
    }
}
