use http::{HeaderMap, header};

use keyrelay_storage::ClientToken;

use crate::error::ProxyError;
use crate::tokens::TokenRegistry;

/// `Authorization: Bearer <value>`, trimmed. Scheme match is case-insensitive.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if auth.len() <= prefix.len() || !auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    let token = auth[prefix.len()..].trim();
    (!token.is_empty()).then_some(token)
}

/// Checks the caller's bearer token against the freshly loaded client tokens.
#[allow(clippy::result_large_err)]
pub fn authenticate_client<'a>(
    headers: &HeaderMap,
    registry: &'a TokenRegistry,
) -> Result<&'a ClientToken, ProxyError> {
    let presented = extract_bearer(headers).ok_or_else(ProxyError::missing_credentials)?;
    registry
        .find_enabled(presented)
        .ok_or_else(ProxyError::invalid_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer(&headers("Bearer abc")), Some("abc"));
        assert_eq!(extract_bearer(&headers("bearer   abc  ")), Some("abc"));
        assert_eq!(extract_bearer(&headers("Basic abc")), None);
        assert_eq!(extract_bearer(&headers("Bearer ")), None);
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn client_auth_distinguishes_missing_and_invalid() {
        let mut registry = TokenRegistry::default();
        let token = registry.create("t", None).unwrap();

        let err = authenticate_client(&HeaderMap::new(), &registry).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(String::from_utf8_lossy(&err.body).contains("missing credentials"));

        let err = authenticate_client(&headers("Bearer sk-nope"), &registry).unwrap_err();
        assert!(String::from_utf8_lossy(&err.body).contains("invalid API key"));

        let ok = authenticate_client(&headers(&format!("Bearer {}", token.token)), &registry);
        assert_eq!(ok.unwrap().name, "t");
    }
}
