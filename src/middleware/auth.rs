//! Shared-token authentication.
//!
//! The media endpoint accepts the token from the `token` query parameter or
//! the `x-relay-token` header; the control plane accepts the header only.
//! Comparison is constant-time.

use subtle::ConstantTimeEq;

use crate::errors::ApiError;

/// Header carrying the relay token on HTTP requests and outgoing webhooks.
pub const RELAY_TOKEN_HEADER: &str = "x-relay-token";

/// Check a presented token against the configured one. When no token is
/// configured, authentication is disabled and every request passes.
pub fn authorize(expected: Option<&str>, presented: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match presented {
        Some(presented) if token_matches(expected, presented) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn token_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_no_token_configured() {
        assert!(authorize(None, None).is_ok());
        assert!(authorize(None, Some("anything")).is_ok());
    }

    #[test]
    fn requires_exact_match_when_configured() {
        assert!(authorize(Some("secret"), Some("secret")).is_ok());
        assert_eq!(
            authorize(Some("secret"), Some("wrong")),
            Err(ApiError::Unauthorized)
        );
        assert_eq!(
            authorize(Some("secret"), Some("secre")),
            Err(ApiError::Unauthorized)
        );
        assert_eq!(authorize(Some("secret"), None), Err(ApiError::Unauthorized));
    }
}
