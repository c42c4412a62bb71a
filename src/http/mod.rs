//! C5: GET/HEAD/PUT/DELETE/OPTIONS/NOOP as pure procedures over
//! `{Hmr, MessageReader, AuthState}`. Each verb builds a request, sends
//! it, reads the status line and headers with [`crate::reader`], and
//! folds the result back into the HMR fields that survive to the next
//! call (`http_options`, `etag`, `filename`, ...).

pub mod status;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, warn};

use crate::auth::{digest, AuthState};
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::hmr::{ETag, Hmr, VerbMask};
use crate::reader::MessageReader;

/// Outcome of a successful `GET`. `NothingToFetch`/error cases are
/// reported through `Result` rather than folded in here.
pub struct GetOutcome {
    pub status: u16,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub filename_override: Option<String>,
    pub etag: Option<ETag>,
}

pub struct HeadOutcome {
    pub status: u16,
    pub content_length: Option<u64>,
    pub date: Option<String>,
}

fn resource_url(hmr: &Hmr, path: &str) -> String {
    if hmr.http_proxy().is_some() {
        let scheme = "http";
        format!("{scheme}://{}:{}{}", hmr.hostname(), hmr.port(), path)
    } else {
        path.to_owned()
    }
}

fn write_request(
    hmr: &mut Hmr,
    method: &str,
    path: &str,
    extra_headers: &[(String, String)],
    body_len: Option<u64>,
) -> Result<()> {
    let url = resource_url(hmr, path);
    let mut head = format!("{method} {url} HTTP/1.1\r\nHost: {}\r\n", hmr.hostname());
    for (k, v) in extra_headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    if let Some(len) = body_len {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("Connection: keep-alive\r\n\r\n");
    hmr.conn_mut()?.write_all_vectored(&[head.as_bytes()])
}

struct StatusLine {
    status: u16,
}

fn parse_status_line(line: &str) -> Result<StatusLine> {
    let mut parts = line.splitn(3, ' ');
    let _version = parts.next().ok_or(Error::ListError)?;
    let status: u16 = parts.next().ok_or(Error::ListError)?.parse().map_err(|_| Error::ListError)?;
    Ok(StatusLine { status })
}

struct Headers(Vec<(String, String)>);

impl Headers {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn raw_dump(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}: {v}\n")).collect()
    }
}

fn read_response_head(reader: &mut MessageReader, hmr: &mut Hmr, deadline: Instant) -> Result<(u16, Headers)> {
    let status_line = reader.read_line(hmr.conn_mut()?, deadline)?;
    let status = parse_status_line(&status_line)?.status;
    let mut headers = Vec::new();
    loop {
        let line = reader.read_line(hmr.conn_mut()?, deadline)?;
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_owned(), v.trim().to_owned()));
        }
    }
    Ok((status, Headers(headers)))
}

fn apply_response_metadata(hmr: &mut Hmr, headers: &Headers) {
    hmr.close = headers
        .get("Connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false);
    hmr.chunked = headers
        .get("Transfer-Encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    hmr.content_length = if hmr.chunked {
        None
    } else {
        headers.get("Content-Length").and_then(|v| v.parse().ok())
    };
    hmr.date = headers.get("Date").map(|s| s.to_owned());
    hmr.etag = headers.get("ETag").and_then(parse_etag);
    hmr.filename = headers.get("Content-Disposition").and_then(parse_content_disposition_filename);
    if let Some(info) = headers.get("Authentication-Info") {
        if let (AuthState::Digest(state), Some(nonce)) = (hmr.auth_mut(), parse_nextnonce(info)) {
            state.accept_nextnonce(nonce);
        }
    }
    hmr.status_received(hmr.close);
}

/// Extracts `nextnonce` from an `Authentication-Info` header (RFC 7616
/// §3.5), carried on a successful response so the next request on this
/// connection reuses the server's fresh nonce instead of triggering
/// another 401 round trip.
fn parse_nextnonce(value: &str) -> Option<String> {
    for part in value.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("nextnonce=") {
            return Some(v.trim_matches('"').to_owned());
        }
    }
    None
}

fn parse_etag(value: &str) -> Option<ETag> {
    let (weak, rest) = if let Some(stripped) = value.strip_prefix("W/") {
        (true, stripped)
    } else {
        (false, value)
    };
    let trimmed = rest.trim().trim_matches('"');
    if trimmed.is_empty() {
        None
    } else {
        Some(ETag { value: trimmed.to_owned(), weak })
    }
}

/// Extracts a filename from `Content-Disposition: attachment;
/// filename=...` (quoted or bare), rejecting names that would escape the
/// destination directory.
fn parse_content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        let name = part.strip_prefix("filename=").or_else(|| part.strip_prefix("filename*=UTF-8''"))?;
        let name = name.trim_matches('"');
        if name.is_empty() || name.starts_with('.') || name.starts_with('/') || name.contains('/') {
            return None;
        }
        return Some(name.to_owned());
    }
    None
}

static CNONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh, non-repeating seed for the client nonce Digest auth must send
/// with every request. Uniqueness, not unpredictability, is what the
/// protocol needs here: the server only rejects a *reused* cnonce.
fn next_cnonce_seed() -> String {
    use sha2::{Digest, Sha256};
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = CNONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    hex::encode(Sha256::digest(format!("{nanos}:{counter}").as_bytes()))
}

fn maybe_reconnect_precheck(hmr: &mut Hmr, config: &HostConfig) -> Result<()> {
    if hmr.peer_half_closed() {
        hmr.reconnect(config)?;
    }
    Ok(())
}

/// Parses a `WWW-Authenticate` header and rebuilds the connection's auth
/// state for a single retried request, per the 401 handler in §4.5.
fn handle_unauthorized(hmr: &mut Hmr, www_authenticate: Option<&str>) -> Result<()> {
    let header = www_authenticate.ok_or(Error::AuthProtocol)?;
    match hmr.auth_mut() {
        AuthState::Digest(state) => {
            let challenge = digest::Challenge::parse(header)?;
            state.accept_challenge(challenge);
            Ok(())
        }
        AuthState::None => Err(Error::AuthRequired),
        _ => Ok(()),
    }
}

/// Builds the auth header(s) a request needs, if any. Digest and Basic
/// each contribute a single `Authorization` header; SigV4 contributes
/// three (`x-amz-date`, `x-amz-content-sha256`, `Authorization`), so this
/// returns a `Vec` rather than a single pair.
fn authorization_header(hmr: &mut Hmr, method: &str, uri: &str) -> Result<Vec<(String, String)>> {
    let host = hmr.hostname().to_owned();
    match hmr.auth_mut() {
        AuthState::None => Ok(Vec::new()),
        AuthState::Basic { user, password } => {
            Ok(vec![("Authorization".to_owned(), crate::auth::basic::authorization_header(user, password))])
        }
        AuthState::Digest(state) => {
            if !state.has_challenge() {
                return Ok(Vec::new());
            }
            let seed = format!("{method}:{uri}:{}", next_cnonce_seed());
            let header = state.authorization_header(method, uri, b"", &seed)?;
            Ok(vec![("Authorization".to_owned(), header)])
        }
        AuthState::AwsSigV4(ctx) => {
            let amz_date = crate::protocol::amz_date_now();
            let signed = ctx.sign(method, &host, uri, "", &amz_date)?;
            Ok(signed.headers)
        }
    }
}

pub fn get(
    hmr: &mut Hmr,
    reader: &mut MessageReader,
    config: &HostConfig,
    path: &str,
    offset: u64,
    if_none_match: Option<&str>,
) -> Result<GetOutcome> {
    maybe_reconnect_precheck(hmr, config)?;
    let deadline = hmr.deadline(config.transfer_timeout());
    hmr.begin_request()?;
    reader.reset();

    let mut attempt_offset = offset;
    let mut attempted_close_retry = false;
    let mut attempted_unauthorized_retry = false;
    hmr.retries = 0;

    loop {
        let mut headers = Vec::new();
        if attempt_offset > 0 {
            headers.push(("Range".to_owned(), format!("bytes={attempt_offset}-")));
        }
        if let Some(etag) = if_none_match {
            headers.push(("If-None-Match".to_owned(), format!("\"{etag}\"")));
        }
        headers.extend(authorization_header(hmr, "GET", path)?);
        write_request(hmr, "GET", path, &headers, None)?;
        let (status, resp_headers) = read_response_head(reader, hmr, deadline)?;
        apply_response_metadata(hmr, &resp_headers);

        if status == 401 {
            if attempted_unauthorized_retry {
                warn!("GET {path}: 401 after retry, giving up");
                return Err(Error::AuthRequired);
            }
            attempted_unauthorized_retry = true;
            hmr.retries += 1;
            debug!("GET {path}: 401, re-authenticating");
            handle_unauthorized(hmr, resp_headers.get("WWW-Authenticate"))?;
            continue;
        }
        if status == 416 && attempt_offset > 0 {
            debug!("GET {path}: range {attempt_offset}- rejected, retrying at offset 0");
            attempt_offset = 0;
            continue;
        }
        if status == 304 {
            return Err(Error::NothingToFetch);
        }
        if status::is_get_success(status) {
            if hmr.close && !attempted_close_retry {
                attempted_close_retry = true;
                hmr.reconnect(config)?;
                continue;
            }
            reader.begin_body();
            return Ok(GetOutcome {
                status,
                content_length: hmr.content_length,
                chunked: hmr.chunked,
                filename_override: hmr.filename.clone(),
                etag: hmr.etag.clone(),
            });
        }
        warn!("GET {path}: unexpected status {status}");
        return Err(Error::HttpStatus { code: status, headers: crate::error::BoundedHeaderDump::new(&resp_headers.raw_dump()) });
    }
}

pub fn head(hmr: &mut Hmr, reader: &mut MessageReader, config: &HostConfig, path: &str) -> Result<HeadOutcome> {
    maybe_reconnect_precheck(hmr, config)?;
    let deadline = hmr.deadline(config.transfer_timeout());
    hmr.begin_request()?;
    reader.reset();

    let mut headers = Vec::new();
    headers.extend(authorization_header(hmr, "HEAD", path)?);
    write_request(hmr, "HEAD", path, &headers, None)?;
    let (status, resp_headers) = read_response_head(reader, hmr, deadline)?;
    apply_response_metadata(hmr, &resp_headers);
    hmr.response_complete();

    if status::is_get_success(status) {
        Ok(HeadOutcome {
            status,
            content_length: hmr.content_length,
            date: hmr.date.clone(),
        })
    } else {
        if status::marks_verb_unsupported(status) {
            hmr.http_options_not_working |= VerbMask::HEAD;
        }
        Err(Error::Unsupported)
    }
}

/// `size>0` and `Expect: 100-continue` together make this a two-phase
/// send: headers first, then wait for `100 Continue` before streaming
/// the body. The body itself is streamed by the caller via
/// [`crate::wire::Conn::write_all_vectored`] once this returns `Ok(())`;
/// [`put_response`] then consumes the terminal status.
pub fn put(
    hmr: &mut Hmr,
    reader: &mut MessageReader,
    config: &HostConfig,
    path: &str,
    size: u64,
    expect_continue: bool,
) -> Result<()> {
    maybe_reconnect_precheck(hmr, config)?;
    let deadline = hmr.deadline(config.transfer_timeout());
    hmr.begin_request()?;
    reader.reset();

    let mut headers = Vec::new();
    if size > 0 && expect_continue {
        headers.push(("Expect".to_owned(), "100-continue".to_owned()));
    }
    headers.extend(authorization_header(hmr, "PUT", path)?);
    write_request(hmr, "PUT", path, &headers, Some(size))?;

    if size > 0 && expect_continue {
        let line = reader.read_line(hmr.conn_mut()?, deadline)?;
        let status = parse_status_line(&line)?.status;
        // Drain the (empty) header block following a 100-continue.
        loop {
            let h = reader.read_line(hmr.conn_mut()?, deadline)?;
            if h.is_empty() {
                break;
            }
        }
        if status != 100 {
            return Err(Error::HttpStatus { code: status, headers: crate::error::BoundedHeaderDump::new("") });
        }
    }
    Ok(())
}

pub fn put_response(hmr: &mut Hmr, reader: &mut MessageReader, config: &HostConfig) -> Result<u16> {
    let deadline = hmr.deadline(config.transfer_timeout());
    let (status, resp_headers) = read_response_head(reader, hmr, deadline)?;
    apply_response_metadata(hmr, &resp_headers);
    hmr.response_complete();
    match status {
        200 | 201 | 204 => Ok(status),
        _ => Err(Error::HttpStatus { code: status, headers: crate::error::BoundedHeaderDump::new(&resp_headers.raw_dump()) }),
    }
}

pub fn delete(hmr: &mut Hmr, reader: &mut MessageReader, config: &HostConfig, path: &str) -> Result<u16> {
    maybe_reconnect_precheck(hmr, config)?;
    let deadline = hmr.deadline(config.transfer_timeout());
    hmr.begin_request()?;
    reader.reset();

    let mut headers = Vec::new();
    headers.extend(authorization_header(hmr, "DELETE", path)?);
    write_request(hmr, "DELETE", path, &headers, None)?;
    let (status, resp_headers) = read_response_head(reader, hmr, deadline)?;
    apply_response_metadata(hmr, &resp_headers);
    hmr.response_complete();

    match status {
        200 | 204 => Ok(status),
        _ => Err(Error::HttpStatus { code: status, headers: crate::error::BoundedHeaderDump::new(&resp_headers.raw_dump()) }),
    }
}

/// Populates `hmr.http_options`; a discovery refusal (403/405/500) is not
/// fatal, the mask is simply left empty.
pub fn options(hmr: &mut Hmr, reader: &mut MessageReader, config: &HostConfig, path: &str) -> Result<()> {
    maybe_reconnect_precheck(hmr, config)?;
    let deadline = hmr.deadline(config.transfer_timeout());
    hmr.begin_request()?;
    reader.reset();

    write_request(hmr, "OPTIONS", path, &[], None)?;
    let (status, resp_headers) = read_response_head(reader, hmr, deadline)?;
    apply_response_metadata(hmr, &resp_headers);
    hmr.response_complete();

    if matches!(status, 403 | 405 | 500) {
        hmr.http_options = VerbMask::empty();
        return Ok(());
    }
    let mut mask = VerbMask::empty();
    if let Some(allow) = resp_headers.get("Allow") {
        for verb in allow.split(',') {
            match verb.trim().to_ascii_uppercase().as_str() {
                "GET" => mask |= VerbMask::GET,
                "HEAD" => mask |= VerbMask::HEAD,
                "PUT" => mask |= VerbMask::PUT,
                "DELETE" => mask |= VerbMask::DELETE,
                "OPTIONS" => mask |= VerbMask::OPTIONS,
                _ => {}
            }
        }
    }
    hmr.http_options = mask;
    Ok(())
}

/// HTTP has no NOOP; a `HEAD` against the bucket/path root keeps an idle
/// connection warm without side effects.
pub fn noop(hmr: &mut Hmr, reader: &mut MessageReader, config: &HostConfig) -> Result<()> {
    match head(hmr, reader, config, "/") {
        Ok(_) | Err(Error::Unsupported) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_quoted_and_bare() {
        assert_eq!(
            parse_content_disposition_filename("attachment; filename=\"report.csv\""),
            Some("report.csv".to_owned())
        );
        assert_eq!(
            parse_content_disposition_filename("attachment; filename=report.csv"),
            Some("report.csv".to_owned())
        );
    }

    #[test]
    fn content_disposition_rejects_path_escapes() {
        assert_eq!(parse_content_disposition_filename("attachment; filename=\"../etc/passwd\""), None);
        assert_eq!(parse_content_disposition_filename("attachment; filename=\".hidden\""), None);
        assert_eq!(parse_content_disposition_filename("attachment; filename=\"/abs\""), None);
    }

    #[test]
    fn nextnonce_parses_from_authentication_info() {
        assert_eq!(parse_nextnonce(r#"nextnonce="abc123", qop=auth"#), Some("abc123".to_owned()));
        assert_eq!(parse_nextnonce("qop=auth"), None);
    }

    #[test]
    fn etag_parses_weak_flag() {
        let strong = parse_etag("\"abc123\"").unwrap();
        assert!(!strong.weak);
        assert_eq!(strong.value, "abc123");
        let weak = parse_etag("W/\"abc123\"").unwrap();
        assert!(weak.weak);
    }

}
