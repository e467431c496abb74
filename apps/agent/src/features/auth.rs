//! Bearer-token middleware for the agent API.
//!
//! Health probes and POAP bootstrap fetches are exempt: the controller's
//! load balancer has no token, and a booting switch certainly doesn't.
//! An empty configured secret disables auth entirely.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::config::settings;

const EXEMPT_PREFIXES: &[&str] = &["/health", "/healthz", "/poap/"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PREFIXES
        .iter()
        .any(|prefix| path == prefix.trim_end_matches('/') || path.starts_with(prefix))
}

pub async fn bearer_auth(request: Request, next: Next) -> Result<Response, (StatusCode, String)> {
    let secret = &settings().controller_secret;
    if secret.is_empty() || is_exempt(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let authorized = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == secret)
        .unwrap_or(false);
    if !authorized {
        return Err((StatusCode::UNAUTHORIZED, "invalid or missing bearer token".into()));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exemptions_cover_health_and_poap() {
        assert!(is_exempt("/health"));
        assert!(is_exempt("/healthz"));
        assert!(is_exempt("/poap/lab1/n9k1/script.py"));
        assert!(!is_exempt("/deploy"));
        assert!(!is_exempt("/labs/lab1/links"));
    }
}
