//! The directory-listing capability the fetch orchestrator (C8) consumes.
//! `open_dir`/`readdir`/`close_dir`/`delete_remote_file`/`quit` describe
//! the SFTP-shaped surface from §6; the HTTP-backed implementation here
//! maps that surface onto SigV4 bucket listing plus plain GET/HEAD/DELETE,
//! so the orchestrator never has to know which wire protocol it is
//! driving.

use log::{debug, warn};

use crate::auth::AuthState;
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::hmr::Hmr;
use crate::reader::MessageReader;
use crate::retrieve_list::RemoteStat;

/// One remote directory entry as reported by a listing.
pub struct RemoteEntry {
    pub name: String,
    pub stat: RemoteStat,
}

/// Capability surface the orchestrator drives against a remote
/// directory: open it, stream entries, close it, and (when configured)
/// delete unknown files. `quit` tears down the underlying connection.
pub trait RemoteDirectory {
    fn open_dir(&mut self, remote_path: &str) -> Result<()>;
    fn readdir(&mut self) -> Result<Option<RemoteEntry>>;
    fn close_dir(&mut self) -> Result<()>;
    fn delete_remote_file(&mut self, remote_path: &str, name: &str) -> Result<()>;
    fn quit(&mut self);
}

/// S3-style listing over the HTTP command layer, paging through
/// `ListingVersion::V1`/`V2` as configured.
pub struct HttpDirectory<'a> {
    hmr: &'a mut Hmr,
    reader: MessageReader,
    config: &'a HostConfig,
    pending: Vec<RemoteEntry>,
    continuation: Option<String>,
    exhausted: bool,
    prefix: String,
}

impl<'a> HttpDirectory<'a> {
    pub fn new(hmr: &'a mut Hmr, config: &'a HostConfig) -> HttpDirectory<'a> {
        HttpDirectory {
            hmr,
            reader: MessageReader::new(),
            config,
            pending: Vec::new(),
            continuation: None,
            exhausted: true,
            prefix: String::new(),
        }
    }

    /// Fetches and parses one listing page, appending decoded entries to
    /// `pending` and recording the continuation token/marker for the
    /// next page, if any.
    fn fetch_page(&mut self, amz_date: &str) -> Result<()> {
        let sigv4 = match self.hmr.auth() {
            AuthState::AwsSigV4(ctx) => ctx,
            _ => return Err(Error::ListError),
        };
        let query = sigv4.listing_query(&self.prefix, self.continuation.as_deref(), 1000);
        let signed = sigv4.sign("GET", self.hmr.hostname(), "/", &query, amz_date)?;

        let path = format!("/?{query}");
        let mut headers = signed.headers;
        headers.push(("Host".to_owned(), self.hmr.hostname().to_owned()));

        self.hmr.begin_request()?;
        let head = format!(
            "GET {path} HTTP/1.1\r\n{}\r\n\r\n",
            headers.iter().map(|(k, v)| format!("{k}: {v}")).collect::<Vec<_>>().join("\r\n")
        );
        self.hmr.conn_mut()?.write_all_vectored(&[head.as_bytes()]).map_err(|_| Error::ListError)?;

        let deadline = self.hmr.deadline(self.config.transfer_timeout());
        let status_line = self.reader.read_line(self.hmr.conn_mut()?, deadline).map_err(|_| Error::ListError)?;
        if !status_line.contains("200") {
            return Err(Error::ListError);
        }
        let mut content_length = None;
        loop {
            let line = self.reader.read_line(self.hmr.conn_mut()?, deadline).map_err(|_| Error::ListError)?;
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:").or_else(|| line.strip_prefix("content-length:")) {
                content_length = v.trim().parse::<usize>().ok();
            }
        }
        let len = content_length.ok_or(Error::ListError)?;
        self.reader.begin_body();
        let mut body = vec![0u8; len];
        self.reader.read_body_exact(self.hmr.conn_mut()?, &mut body, deadline).map_err(|_| Error::ListError)?;
        self.hmr.response_complete();

        let xml = String::from_utf8(body).map_err(|_| Error::ListError)?;
        let (entries, next_token, truncated) = parse_listing_xml(&xml)?;
        debug!("listing page: {} entries, truncated={truncated}", entries.len());
        self.pending.extend(entries);
        self.continuation = next_token;
        self.exhausted = !truncated;
        Ok(())
    }
}

impl<'a> RemoteDirectory for HttpDirectory<'a> {
    fn open_dir(&mut self, remote_path: &str) -> Result<()> {
        self.prefix = remote_path.trim_start_matches('/').to_owned();
        self.pending.clear();
        self.continuation = None;
        self.exhausted = false;
        Ok(())
    }

    fn readdir(&mut self) -> Result<Option<RemoteEntry>> {
        if self.pending.is_empty() {
            if self.exhausted {
                return Ok(None);
            }
            let amz_date = amz_date_now();
            self.fetch_page(&amz_date)?;
        }
        Ok(self.pending.pop())
    }

    fn close_dir(&mut self) -> Result<()> {
        self.pending.clear();
        self.exhausted = true;
        Ok(())
    }

    fn delete_remote_file(&mut self, remote_path: &str, name: &str) -> Result<()> {
        let path = format!("/{}/{}", remote_path.trim_matches('/'), name);
        if let Err(e) = crate::http::delete(self.hmr, &mut self.reader, self.config, &path) {
            warn!("failed to delete remote file {path}: {e}");
            return Err(e);
        }
        Ok(())
    }

    fn quit(&mut self) {
        self.hmr.quit();
    }
}

/// Parses the handful of fields the orchestrator needs out of an S3
/// `ListBucketResult` document: `Key`, `LastModified`, `Size`,
/// `IsTruncated`, and `NextContinuationToken`/`NextMarker`. A hand-rolled
/// scan rather than a full XML parser dependency, since the schema used
/// here is fixed and flat.
fn parse_listing_xml(xml: &str) -> Result<(Vec<RemoteEntry>, Option<String>, bool)> {
    let mut entries = Vec::new();
    for contents in xml.split("<Contents>").skip(1) {
        let end = contents.find("</Contents>").unwrap_or(contents.len());
        let block = &contents[..end];
        let name = tag_value(block, "Key").ok_or(Error::ListError)?;
        let size: u64 = tag_value(block, "Size").and_then(|s| s.parse().ok()).ok_or(Error::ListError)?;
        let mtime = tag_value(block, "LastModified").map(|s| parse_iso8601_epoch(&s)).unwrap_or(0);
        entries.push(RemoteEntry { name, stat: RemoteStat { mtime, size } });
    }
    let truncated = tag_value(xml, "IsTruncated").map(|v| v == "true").unwrap_or(false);
    let next_token = tag_value(xml, "NextContinuationToken").or_else(|| tag_value(xml, "NextMarker"));
    Ok((entries, next_token, truncated))
}

fn tag_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_owned())
}

/// Best-effort `YYYY-MM-DDTHH:MM:SS.sssZ` to Unix-epoch-seconds
/// conversion without pulling in a date/time crate for one field.
fn parse_iso8601_epoch(s: &str) -> i64 {
    let digits: Vec<i64> = s
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect();
    if digits.len() < 6 {
        return 0;
    }
    let (y, mo, d, h, mi, se) = (digits[0], digits[1], digits[2], digits[3], digits[4], digits[5]);
    days_from_civil(y, mo, d) * 86_400 + h * 3600 + mi * 60 + se
}

/// Howard Hinnant's civil-from-days algorithm; avoids a chrono
/// dependency for a handful of best-effort date conversions.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// The inverse of [`days_from_civil`]: days-since-epoch to `(year,
/// month, day)`.
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Formats the current wall-clock time as `YYYYMMDDTHHMMSSZ`, the
/// timestamp every SigV4 request carries in `x-amz-date`.
pub(crate) fn amz_date_now() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86_400);
    let of_day = secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    let (h, mi, s) = (of_day / 3600, (of_day % 3600) / 60, of_day % 60);
    format!("{y:04}{m:02}{d:02}T{h:02}{mi:02}{s:02}Z")
}
