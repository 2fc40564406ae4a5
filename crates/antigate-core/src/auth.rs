use http::HeaderMap;

use crate::error::GatewayError;

const KEY_HEADERS: [&str; 4] = ["x-api-key", "api-key", "x-api_key", "api_key"];

/// The API-key gate covers `/v1/...` and the forced-credential prefix form
/// `/{credential}/v1/...` where the prefix segment is word characters and
/// dashes.
pub fn requires_api_key(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.starts_with("v1/") {
        return true;
    }
    match rest.split_once('/') {
        Some((segment, tail)) => {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                && tail.starts_with("v1/")
        }
        None => false,
    }
}

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    for name in KEY_HEADERS {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    if auth.is_empty() {
        return None;
    }
    for prefix in ["Bearer ", "bearer "] {
        if let Some(token) = auth.strip_prefix(prefix) {
            return Some(token.trim().to_string());
        }
    }
    Some(auth.to_string())
}

pub fn check_api_key(configured: &str, headers: &HeaderMap) -> Result<(), GatewayError> {
    if configured.is_empty() {
        return Err(GatewayError::AuthMissing);
    }
    match extract_api_key(headers) {
        Some(candidate) if candidate == configured => Ok(()),
        _ => Err(GatewayError::AuthInvalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn gate_matches_v1_paths_with_optional_prefix() {
        assert!(requires_api_key("/v1/chat/completions"));
        assert!(requires_api_key("/v1/messages"));
        assert!(requires_api_key("/my-project_1/v1/chat/completions"));
        assert!(!requires_api_key("/admin/logs"));
        assert!(!requires_api_key("/auth/accounts"));
        assert!(!requires_api_key("/a/b/v1/chat"));
        assert!(!requires_api_key("/v1beta/models/gemini:generateContent"));
    }

    #[test]
    fn key_extracted_from_every_accepted_header() {
        for name in ["x-api-key", "api-key", "x-api_key", "api_key"] {
            let map = headers(&[(name, "sk-1")]);
            assert_eq!(extract_api_key(&map).as_deref(), Some("sk-1"), "{name}");
        }
        let map = headers(&[("authorization", "Bearer sk-2")]);
        assert_eq!(extract_api_key(&map).as_deref(), Some("sk-2"));
        let map = headers(&[("authorization", "sk-3")]);
        assert_eq!(extract_api_key(&map).as_deref(), Some("sk-3"));
    }

    #[test]
    fn check_rejects_mismatch_and_missing_config() {
        let map = headers(&[("x-api-key", "sk-1")]);
        assert!(check_api_key("sk-1", &map).is_ok());
        assert!(matches!(
            check_api_key("sk-other", &map),
            Err(GatewayError::AuthInvalid)
        ));
        assert!(matches!(
            check_api_key("", &map),
            Err(GatewayError::AuthMissing)
        ));
    }
}
