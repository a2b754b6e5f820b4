use http::HeaderMap;

/// Resolve the client IP from proxy headers: leftmost `X-Forwarded-For`
/// entry, then `X-Real-IP`, then `CF-Connecting-IP`, else `"unknown"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    for name in ["x-real-ip", "cf-connecting-ip"] {
        if let Some(v) = headers.get(name).and_then(|h| h.to_str().ok()) {
            let v = v.trim();
            if !v.is_empty() {
                return v.to_string();
            }
        }
    }

    "unknown".to_string()
}
