//! RFC 7617 Basic authentication: a single `Authorization` header value,
//! computed once and reused on every request until a 401 says otherwise.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn authorization_header(user: &str, password: &str) -> String {
    let raw = format!("{user}:{password}");
    format!("Basic {}", STANDARD.encode(raw.as_bytes()))
}
