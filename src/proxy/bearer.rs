use axum::http::HeaderValue;

/// Normalize a token cell or configured credential to a raw token string.
///
/// Token sheets sometimes hold values like `Bearer <token>` or quoted cells
/// exported from spreadsheets. Internally we always keep the bare token.
pub fn normalize_token(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim();
    let without_prefix = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed);
    without_prefix.trim().to_string()
}

pub fn bearer_header_value(raw_token: &str) -> Result<HeaderValue, String> {
    let token = normalize_token(raw_token);
    if token.is_empty() {
        return Err("Missing bearer token".to_string());
    }
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| "Invalid token value (cannot be used as an HTTP header)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_bearer_prefix_quotes_and_whitespace() {
        assert_eq!(normalize_token("Bearer abc"), "abc");
        assert_eq!(normalize_token("bearer abc"), "abc");
        assert_eq!(normalize_token("  Bearer   abc  "), "abc");
        assert_eq!(normalize_token("\"abc\""), "abc");
        assert_eq!(normalize_token("abc"), "abc");
    }

    #[test]
    fn bearer_header_rejects_empty_and_control_chars() {
        assert!(bearer_header_value("   ").is_err());
        assert!(bearer_header_value("abc\ndef").is_err());
        assert_eq!(bearer_header_value("abc").unwrap(), "Bearer abc");
    }
}
