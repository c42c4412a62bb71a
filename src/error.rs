//! Crate-wide error type.
//!
//! One flat enum covers every failure surface named in the design: wire
//! I/O, HTTP verb dispatch, authentication, and the retrieve-list/ledger
//! persistence layer. Variants are named after the *kind* of failure, not
//! its underlying type, so callers can match on them without reaching into
//! `std::io::Error` or `openssl::error::ErrorStack` directly.

use std::fmt;
use std::io;

/// Bounded dump of response headers kept alongside an [`Error::HttpStatus`]
/// so the owning daemon can log the failure without unbounded memory use.
pub const HEADER_DUMP_CAP: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedHeaderDump(String);

impl BoundedHeaderDump {
    pub fn new(raw: &str) -> Self {
        if raw.len() > HEADER_DUMP_CAP {
            Self(format!("{}... ({} bytes truncated)", &raw[..HEADER_DUMP_CAP], raw.len() - HEADER_DUMP_CAP))
        } else {
            Self(raw.to_owned())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Every failure mode the core can surface.
#[derive(Debug)]
pub enum Error {
    /// An I/O operation did not complete within the configured deadline.
    Timeout,
    /// The peer reset the connection (EPIPE/ECONNRESET observed mid-verb).
    ConnectionReset,
    /// The peer refused the connection outright.
    ConnectionRefused,
    /// Name resolution failed.
    Dns,
    /// The TLS handshake itself failed (protocol mismatch, no shared cipher, ...).
    TlsHandshake,
    /// The handshake completed but certificate verification rejected the peer.
    TlsVerify,
    /// Any other I/O failure not covered by a more specific variant.
    Io(io::Error),
    /// The server answered with an HTTP status outside the success range
    /// for the verb being run. Headers observed on that response are kept,
    /// truncated, for diagnostics.
    HttpStatus { code: u16, headers: BoundedHeaderDump },
    /// The server demanded authentication and no usable credentials were
    /// configured for the scheme it offered.
    AuthRequired,
    /// A `WWW-Authenticate` or `Authentication-Info` header could not be
    /// parsed into a usable challenge.
    AuthProtocol,
    /// The server rejected this verb (4xx/5xx on an `OPTIONS`-probed verb,
    /// or a verb outside `Allow`); sticky for the lifetime of the HMR.
    Unsupported,
    /// A verb was called after `quit()`; the connection is terminally closed.
    PermanentDisconnect,
    /// Listing the remote directory failed.
    ListError,
    /// A conditional GET (`If-None-Match`) found the object unchanged.
    NothingToFetch,
    /// A fetch pass stopped short of exhausting the remote listing because
    /// a configured budget was reached.
    BudgetExceeded { more_files_in_list: bool },
    /// Attaching the retrieve list failed (bad header, lock contention that
    /// exceeded retry budget, backing file missing).
    LsDataAttach,
    /// The retrieve list's on-disk format version does not match this build.
    LsDataVersion,
    /// A byte-range or whole-file advisory lock could not be acquired.
    LockBusy,
    /// The append ledger's `OPT:`/`restart` block could not be parsed.
    LedgerParse,
    /// An I/O failure specific to editing the append ledger file.
    LedgerIo,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out"),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::ConnectionRefused => write!(f, "connection refused"),
            Error::Dns => write!(f, "name resolution failed"),
            Error::TlsHandshake => write!(f, "TLS handshake failed"),
            Error::TlsVerify => write!(f, "TLS certificate verification failed"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::HttpStatus { code, headers } => {
                write!(f, "HTTP status {code}: {}", headers.as_str())
            }
            Error::AuthRequired => write!(f, "authentication required but no credentials configured"),
            Error::AuthProtocol => write!(f, "malformed authentication challenge"),
            Error::Unsupported => write!(f, "verb not supported by this server"),
            Error::PermanentDisconnect => write!(f, "verb called on a connection that already quit"),
            Error::ListError => write!(f, "remote directory listing failed"),
            Error::NothingToFetch => write!(f, "object unchanged, nothing to fetch"),
            Error::BudgetExceeded { more_files_in_list } => {
                write!(f, "per-pass budget exceeded (more_files_in_list={more_files_in_list})")
            }
            Error::LsDataAttach => write!(f, "failed to attach retrieve list"),
            Error::LsDataVersion => write!(f, "retrieve list on-disk version mismatch"),
            Error::LockBusy => write!(f, "advisory lock unavailable"),
            Error::LedgerParse => write!(f, "append ledger parse error"),
            Error::LedgerIo => write!(f, "append ledger I/O error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            _ => Error::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
