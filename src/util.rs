use axum::http::HeaderMap;

/// Masked form of a credential for logs and reports: first and last seven
/// characters kept, bullets between. Anything too short to have a safe
/// middle is fully masked.
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 14 {
        return "•".repeat(chars.len());
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 7..].iter().collect();
    format!("{}••••••{}", head, tail)
}

/// Extract the inbound credential list from `Authorization: Bearer …` or
/// `x-goog-api-key`. Comma-separated, whitespace-trimmed, de-duplicated
/// preserving first occurrence. `Authorization` wins when both are present.
pub fn extract_credentials(headers: &HeaderMap) -> Vec<String> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .or_else(|| headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()));

    let Some(raw) = raw else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.to_string()))
        .map(str::to_string)
        .collect()
}
