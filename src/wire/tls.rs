//! TLS handshake, SNI, and strict/basic/none verification modes, via
//! `openssl` — the TLS stack the pack's own remote-filesystem server
//! already depends on (`openssl = { version = "0.10", features =
//! ["vendored"] }`), carried over here for the client side.

use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::warn;
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslOptions, SslStream, SslVerifyMode};

use super::raw;
use super::{Endpoint, TlsVerifyMode, WireFeatures};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct TlsContext {
    stream: SslStream<TcpStream>,
}

impl TlsContext {
    pub fn handshake(tcp: TcpStream, endpoint: &Endpoint) -> Result<TlsContext> {
        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|_| Error::TlsHandshake)?;
        match endpoint.tls {
            TlsVerifyMode::Strict => builder.set_verify(SslVerifyMode::PEER),
            TlsVerifyMode::Basic => builder.set_verify(SslVerifyMode::NONE),
            TlsVerifyMode::None => unreachable!("plain connections never reach TlsContext"),
        }
        if endpoint.features.contains(WireFeatures::LEGACY_RENEGOTIATION) {
            builder.set_options(SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION);
        }
        let connector = builder.build();

        // `connect` always sends SNI for the given domain name.
        match connector.connect(&endpoint.hostname, tcp) {
            Ok(stream) => Ok(TlsContext { stream }),
            Err(HandshakeError::SetupFailure(_)) => Err(Error::TlsHandshake),
            Err(HandshakeError::Failure(mid)) => {
                let err = mid.into_error();
                if is_verify_failure(&err) {
                    warn!("TLS verify failure against {}: {err}", endpoint.hostname);
                    Err(Error::TlsVerify)
                } else {
                    warn!("TLS handshake failure against {}: {err}", endpoint.hostname);
                    Err(Error::TlsHandshake)
                }
            }
            Err(HandshakeError::WouldBlock(_)) => Err(Error::Timeout),
        }
    }

    pub fn write_all_vectored(&mut self, chunks: &[&[u8]]) -> Result<()> {
        use std::io::Write;
        for chunk in chunks {
            if !chunk.is_empty() {
                self.stream.write_all(chunk).map_err(Error::from)?;
            }
        }
        Ok(())
    }

    /// Reads under a wall-clock deadline that spans OpenSSL's own internal
    /// retry loop (`SSL_read` can perform several hidden `recv(2)`s for one
    /// logical read when the peer trickles record fragments). Each attempt
    /// re-arms `SO_RCVTIMEO` to whatever time remains in the budget, so the
    /// aggregate time across all hidden retries is bounded rather than
    /// just the final syscall.
    pub fn read_timed(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        use std::io::Read;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let remaining = deadline - now;
            self.stream
                .get_ref()
                .set_read_timeout(Some(remaining))
                .map_err(Error::from)?;
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    pub fn peer_closed(&self) -> bool {
        raw::peer_closed(self.stream.get_ref())
    }
}

fn is_verify_failure(err: &openssl::ssl::Error) -> bool {
    if let Some(stack) = err.ssl_error() {
        return stack
            .errors()
            .iter()
            .any(|e| e.reason().map(|r| r.contains("certificate verify failed")).unwrap_or(false));
    }
    false
}

/// Helper kept for tests that want to exercise `Duration`-bounded reads
/// without a real TLS peer.
#[allow(dead_code)]
pub(crate) const ZERO: Duration = Duration::from_secs(0);
