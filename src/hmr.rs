//! C3: per-connection mutable state and the `Fresh -> Connected ->
//! (Requesting -> Responding)* -> Closed` lifecycle.
//!
//! Kept as a single owned struct the way the design notes ask: the
//! ancestor server kept its whole per-request cycle (header state,
//! fuse opcode, reply channel) in one struct rather than scattering it
//! across several; HMR plays the same role for one HTTP connection.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::debug;

use crate::auth::AuthState;
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::wire::{Conn, Endpoint};

bitflags! {
    /// One bit per HTTP verb this crate issues; used for both
    /// `http_options` (verbs the server advertised via `Allow`) and
    /// `http_options_not_working` (verbs that came back 4xx/5xx).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VerbMask: u8 {
        const GET     = 0b0000_0001;
        const HEAD    = 0b0000_0010;
        const PUT     = 0b0000_0100;
        const DELETE  = 0b0000_1000;
        const OPTIONS = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Fresh,
    Connected,
    Requesting,
    Responding,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct ETag {
    pub value: String,
    pub weak: bool,
}

/// Per-connection state. Fields set at `connect` time are immutable
/// afterward; everything else mutates across the request/response cycle.
pub struct Hmr {
    // Immutable after connect.
    hostname: String,
    http_proxy: Option<String>,
    port: u16,

    // Connection + auth, owned exclusively by this struct.
    conn: Option<Conn>,
    auth: AuthState,

    state: ConnState,

    // Mutable response-cycle fields.
    pub http_version: (u8, u8),
    pub content_length: Option<u64>,
    pub date: Option<String>,
    pub etag: Option<ETag>,
    pub chunked: bool,
    pub close: bool,
    pub filename: Option<String>,
    pub retries: u32,
    pub http_options: VerbMask,
    pub http_options_not_working: VerbMask,
}

impl Hmr {
    /// `Fresh -> Connected`.
    pub fn connect(config: &HostConfig) -> Result<Hmr> {
        let endpoint = Endpoint {
            hostname: config.hostname.clone(),
            port: config.port,
            tls: config.tls_auth,
            features: wire_features(config),
            connect_timeout: config.transfer_timeout(),
            transfer_timeout: config.transfer_timeout(),
        };
        let conn = Conn::connect(&endpoint)?;
        let auth = AuthState::new(config)?;
        Ok(Hmr {
            hostname: config.hostname.clone(),
            http_proxy: config.http_proxy.clone(),
            port: config.port,
            conn: Some(conn),
            auth,
            state: ConnState::Connected,
            http_version: (1, 1),
            content_length: None,
            date: None,
            etag: None,
            chunked: false,
            close: false,
            filename: None,
            retries: 0,
            http_options: VerbMask::empty(),
            http_options_not_working: VerbMask::empty(),
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn http_proxy(&self) -> Option<&str> {
        self.http_proxy.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn auth_mut(&mut self) -> &mut AuthState {
        &mut self.auth
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn conn_mut(&mut self) -> Result<&mut Conn> {
        self.conn.as_mut().ok_or(Error::PermanentDisconnect)
    }

    /// `Connected -> Requesting`, or `Responding -> Requesting` once the
    /// previous body has been fully drained by the caller. Rejects any
    /// call once `Closed`.
    pub fn begin_request(&mut self) -> Result<()> {
        match self.state {
            ConnState::Closed => Err(Error::PermanentDisconnect),
            ConnState::Connected | ConnState::Requesting | ConnState::Responding => {
                self.reset_response_fields();
                self.state = ConnState::Requesting;
                Ok(())
            }
            ConnState::Fresh => Err(Error::PermanentDisconnect),
        }
    }

    /// Status line received. Still `Responding` until the caller finishes
    /// draining any body.
    pub fn status_received(&mut self, close: bool) {
        self.close = close;
        self.state = ConnState::Responding;
    }

    /// Body (if any) fully consumed. `Responding -> Requesting`, unless
    /// the server asked for `Connection: close`, in which case the
    /// connection is torn down and marked `Closed` so the next verb call
    /// triggers an automatic reconnect.
    pub fn response_complete(&mut self) {
        if self.close {
            self.teardown();
        } else {
            self.state = ConnState::Requesting;
        }
    }

    /// `Closed -> Connected` after EPIPE mid-verb or a peer-observed
    /// half-close, reusing the same host/port/auth configuration.
    pub fn reconnect(&mut self, config: &HostConfig) -> Result<()> {
        debug!("reconnecting to {}:{}", config.hostname, config.port);
        let endpoint = Endpoint {
            hostname: config.hostname.clone(),
            port: config.port,
            tls: config.tls_auth,
            features: wire_features(config),
            connect_timeout: config.transfer_timeout(),
            transfer_timeout: config.transfer_timeout(),
        };
        self.conn = Some(Conn::connect(&endpoint)?);
        self.state = ConnState::Connected;
        self.retries = 1;
        Ok(())
    }

    /// Non-blocking peek for a peer-initiated half-close, used before
    /// issuing the next verb on a connection believed to still be open.
    pub fn peer_half_closed(&self) -> bool {
        self.conn.as_ref().map(Conn::peer_closed).unwrap_or(true)
    }

    /// Terminal teardown: `quit()`. Any further verb call must fail with
    /// `PermanentDisconnect`.
    pub fn quit(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        debug!("connection to {} torn down", self.hostname);
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.state = ConnState::Closed;
    }

    fn reset_response_fields(&mut self) {
        self.content_length = None;
        self.date = None;
        self.etag = None;
        self.chunked = false;
        self.close = false;
        self.filename = None;
    }

    pub fn deadline(&self, timeout: Duration) -> Instant {
        Instant::now() + timeout
    }
}

fn wire_features(config: &HostConfig) -> crate::wire::WireFeatures {
    let mut features = crate::wire::WireFeatures::TCP_NODELAY;
    if config.allow_legacy_renegotiation {
        features |= crate::wire::WireFeatures::LEGACY_RENEGOTIATION;
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_mask_tracks_allowed_and_failed_verbs() {
        let mut allowed = VerbMask::empty();
        allowed |= VerbMask::GET | VerbMask::HEAD;
        assert!(allowed.contains(VerbMask::GET));
        assert!(!allowed.contains(VerbMask::PUT));
    }

    #[test]
    fn connect_then_quit_reaches_closed() {
        use std::net::TcpListener;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });

        let mut config = HostConfig::default();
        config.hostname = addr.ip().to_string();
        config.port = addr.port();
        config.tls_auth = crate::wire::TlsVerifyMode::None;

        let mut hmr = Hmr::connect(&config).unwrap();
        assert_eq!(hmr.state(), ConnState::Connected);
        hmr.begin_request().unwrap();
        assert_eq!(hmr.state(), ConnState::Requesting);
        hmr.status_received(false);
        assert_eq!(hmr.state(), ConnState::Responding);
        hmr.response_complete();
        assert_eq!(hmr.state(), ConnState::Requesting);
        hmr.quit();
        assert_eq!(hmr.state(), ConnState::Closed);
        assert!(matches!(hmr.begin_request(), Err(Error::PermanentDisconnect)));
        server.join().unwrap();
    }
}
