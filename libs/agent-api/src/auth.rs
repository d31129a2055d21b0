//! Shared-secret basic authentication for the agent surface.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::warn;

use crate::error::ErrorBody;
use crate::types::AgentCredential;

const REALM: &str = "Basic realm=\"cachefleet\"";

/// Middleware rejecting requests whose basic credential does not match.
pub async fn require_basic_auth(
    State(expected): State<Arc<AgentCredential>>,
    req: Request,
    next: Next,
) -> Response {
    match basic_credential(req.headers()) {
        Some(given) if credentials_match(&given, &expected) => next.run(req).await,
        Some(given) => {
            warn!(
                username = %given.username,
                path = %req.uri().path(),
                "Rejected agent credential"
            );
            unauthorized()
        }
        None => unauthorized(),
    }
}

/// Parse `Authorization: Basic ...` into a credential.
pub fn basic_credential(headers: &HeaderMap) -> Option<AgentCredential> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.trim().strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(AgentCredential::new(username, password))
}

fn credentials_match(given: &AgentCredential, expected: &AgentCredential) -> bool {
    // Both comparisons always run.
    let user_ok = constant_time_eq(given.username.as_bytes(), expected.username.as_bytes());
    let pass_ok = constant_time_eq(given.password.as_bytes(), expected.password.as_bytes());
    user_ok & pass_ok
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized() -> Response {
    let body = ErrorBody {
        code: "unauthorized".to_string(),
        message: "missing or invalid agent credential".to_string(),
        limit: None,
        instance_id: None,
    };
    let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_parse_basic_credential() {
        let encoded = STANDARD.encode("admin:p:ss");
        let parsed = basic_credential(&headers_with(&format!("Basic {encoded}"))).unwrap();
        assert_eq!(parsed.username, "admin");
        assert_eq!(parsed.password, "p:ss");
    }

    #[test]
    fn test_rejects_non_basic_scheme() {
        assert!(basic_credential(&headers_with("Bearer abc")).is_none());
        assert!(basic_credential(&headers_with("Basic !!!not-base64")).is_none());
        assert!(basic_credential(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_credentials_match() {
        let expected = AgentCredential::new("admin", "secret");
        assert!(credentials_match(&AgentCredential::new("admin", "secret"), &expected));
        assert!(!credentials_match(&AgentCredential::new("admin", "secreT"), &expected));
        assert!(!credentials_match(&AgentCredential::new("root", "secret"), &expected));
    }
}
