/// Mask a bearer token for display/logging without leaking the full value.
/// Example: `eyJhbGciOiJIUzI1NiJ9.payload.sig` -> `eyJh…sig`.
pub fn mask_token(token: &str) -> String {
    let s = token.trim();
    if s.is_empty() {
        return "<empty>".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 12 {
        return "<redacted>".to_string();
    }
    let start: String = chars.iter().take(4).collect();
    let end: String = chars.iter().skip(chars.len() - 4).collect();
    format!("{start}…{end}")
}

/// Stable short SHA-256 fingerprint so log lines about the same token can be
/// correlated without printing it.
pub fn token_fingerprint(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(token.trim().as_bytes());
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

/// Human-readable label for a pool slot, used in every dispatcher log line.
pub fn slot_label(index: usize, token: &str) -> String {
    format!("#{}({})", index, token_fingerprint(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_tokens_are_fully_redacted() {
        assert_eq!(mask_token(""), "<empty>");
        assert_eq!(mask_token("abc"), "<redacted>");
        assert_eq!(mask_token("abcdefghijkl"), "<redacted>");
    }

    #[test]
    fn long_tokens_keep_edges_only() {
        let masked = mask_token("abcd1234567890wxyz");
        assert_eq!(masked, "abcd…wxyz");
        assert!(!masked.contains("1234"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = token_fingerprint("token-a");
        assert_eq!(a, token_fingerprint(" token-a "));
        assert_ne!(a, token_fingerprint("token-b"));
        assert_eq!(a.len(), 12);
        assert_eq!(slot_label(3, "token-a"), format!("#3({})", a));
    }
}
