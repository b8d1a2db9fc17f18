use thiserror::Error;

/// Maximum bytes of an error response body carried into a message
const MAX_BODY_SNIPPET: usize = 256;

/// Failure taxonomy for the sync endpoints.
///
/// `Network` covers everything below HTTP (DNS, connect, TLS,
/// timeout); the other variants map the statuses the server emits.
/// Anything outside that set lands in `UnexpectedResponse`, as does a
/// 2xx whose body does not match the endpoint contract.
#[derive(Error, Debug)]
pub enum ApiError {
    /// 401: the bearer token was rejected
    #[error("Session rejected by the server - device may need to pair again")]
    SessionRejected,

    /// 403
    #[error("Request denied: {0}")]
    Denied(String),

    /// 429
    #[error("Rate limited by the server")]
    RateLimited,

    /// 5xx
    #[error("Server error: {0}")]
    Server(String),

    #[error("Could not reach the server: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let snippet = body_snippet(body);
        match status.as_u16() {
            401 => ApiError::SessionRejected,
            403 => ApiError::Denied(snippet),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::Server(snippet),
            _ => ApiError::UnexpectedResponse(format!(
                "HTTP {}: {}",
                status.as_u16(),
                snippet
            )),
        }
    }
}

/// Bound the body so a misbehaving server cannot flood the logs.
fn body_snippet(body: &str) -> String {
    if body.len() <= MAX_BODY_SNIPPET {
        return body.to_string();
    }
    let mut end = MAX_BODY_SNIPPET;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &body[..end], body.len())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::SessionRejected
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "nope"),
            ApiError::Denied(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "down"),
            ApiError::Server(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::IM_A_TEAPOT, ""),
            ApiError::UnexpectedResponse(_)
        ));
    }

    #[test]
    fn test_body_snippet_is_bounded() {
        let long = "x".repeat(1000);
        let snippet = body_snippet(&long);
        assert!(snippet.len() < 320);
        assert!(snippet.contains("1000 bytes total"));
    }

    #[test]
    fn test_body_snippet_respects_char_boundaries() {
        // 3-byte chars put the cut inside a code point.
        let multi = "日".repeat(200);
        let snippet = body_snippet(&multi);
        assert!(snippet.contains("600 bytes total"));
    }
}
