//! Endpoint path normalization.
//!
//! Identifier-like segments collapse to `{id}` so per-resource URLs share one
//! traffic window.

/// Placeholder substituted for identifier segments
pub const ID_PLACEHOLDER: &str = "{id}";

/// Normalize a request path (query stripped) into an endpoint key.
pub fn normalize_endpoint(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");

    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if is_identifier(s) { ID_PLACEHOLDER } else { s })
        .collect();

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut out = String::with_capacity(path.len());
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Numeric ids, UUIDs and long hex strings (object ids, hashes)
fn is_identifier(segment: &str) -> bool {
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    if is_uuid(segment) {
        return true;
    }
    segment.len() >= 16 && segment.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_uuid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

/// Raw or percent-encoded `..` segments
pub fn has_path_traversal(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.split('/').any(|s| s == "..")
        || lower.contains("%2e%2e")
        || lower.contains("..%2f")
        || lower.contains("..\\")
}
