/// Extract the token from an `Authorization` header value.
///
/// Only the `Bearer ` scheme is accepted, case-sensitively. Whitespace around
/// the token is trimmed; a token that is empty after trimming is treated as
/// absent.
pub fn extract_bearer(header_value: &str) -> Option<&str> {
    let rest = header_value.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() { None } else { Some(token) }
}
