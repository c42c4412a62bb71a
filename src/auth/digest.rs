//! RFC 7616 Digest authentication.
//!
//! Six algorithm variants (MD5, MD5-sess, SHA-256, SHA-256-sess,
//! SHA-512-256, SHA-512-256-sess) and both `qop=auth` and `qop=auth-int`
//! share one HA1/HA2/response pipeline; only the hash function and
//! whether HA1 gets the extra nonce/cnonce fold differ. A boxed
//! `DynDigest` lets the pipeline stay algorithm-agnostic instead of
//! duplicating it six times, the same trade the wire layer makes by
//! boxing `TlsContext` behind `Conn` rather than monomorphizing every
//! caller over a TLS-or-not type parameter.

use digest::{Digest as _, DynDigest};
use log::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512_256,
    Sha512_256Sess,
}

impl Algorithm {
    fn parse(token: &str) -> Option<Algorithm> {
        match token.to_ascii_uppercase().as_str() {
            "MD5" => Some(Algorithm::Md5),
            "MD5-SESS" => Some(Algorithm::Md5Sess),
            "SHA-256" => Some(Algorithm::Sha256),
            "SHA-256-SESS" => Some(Algorithm::Sha256Sess),
            "SHA-512-256" => Some(Algorithm::Sha512_256),
            "SHA-512-256-SESS" => Some(Algorithm::Sha512_256Sess),
            _ => None,
        }
    }

    fn is_sess(self) -> bool {
        matches!(
            self,
            Algorithm::Md5Sess | Algorithm::Sha256Sess | Algorithm::Sha512_256Sess
        )
    }

    fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => Box::new(md5::Md5::new()),
            Algorithm::Sha256 | Algorithm::Sha256Sess => Box::new(sha2::Sha256::new()),
            Algorithm::Sha512_256 | Algorithm::Sha512_256Sess => Box::new(sha2::Sha512_256::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Algorithm,
    pub qop: Option<Qop>,
    pub stale: bool,
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Challenge> {
        let rest = header
            .trim()
            .strip_prefix("Digest ")
            .ok_or(Error::AuthProtocol)?;
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = Algorithm::Md5;
        let mut qop = None;
        let mut stale = false;

        for field in split_challenge_fields(rest) {
            let (key, value) = field.split_once('=').ok_or(Error::AuthProtocol)?;
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_owned()),
                "nonce" => nonce = Some(value.to_owned()),
                "opaque" => opaque = Some(value.to_owned()),
                "algorithm" => algorithm = Algorithm::parse(value).ok_or(Error::AuthProtocol)?,
                "qop" => {
                    // May list several space/comma separated options; we
                    // prefer auth-int when offered, else plain auth.
                    if value.split(',').any(|q| q.trim() == "auth-int") {
                        qop = Some(Qop::AuthInt);
                    } else if value.split(',').any(|q| q.trim() == "auth") {
                        qop = Some(Qop::Auth);
                    }
                }
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Ok(Challenge {
            realm: realm.ok_or(Error::AuthProtocol)?,
            nonce: nonce.ok_or(Error::AuthProtocol)?,
            opaque,
            algorithm,
            qop,
            stale,
        })
    }
}

fn split_challenge_fields(rest: &str) -> Vec<&str> {
    // Commas inside quoted strings must not split a field; realm values
    // routinely contain spaces but rarely commas, so a simple quote-depth
    // scan is enough.
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => depth ^= 1,
            ',' if depth == 0 => {
                fields.push(rest[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = rest[start..].trim();
    if !tail.is_empty() {
        fields.push(tail);
    }
    fields
}

/// Per-connection Digest state: the outstanding challenge, and the
/// nonce-count we must strictly increment for every request reusing it.
pub struct DigestState {
    user: String,
    password: String,
    challenge: Option<Challenge>,
    nonce_count: u32,
    cnonce: Option<String>,
}

impl DigestState {
    pub fn new(user: String, password: String) -> DigestState {
        DigestState {
            user,
            password,
            challenge: None,
            nonce_count: 0,
            cnonce: None,
        }
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Accepts a fresh challenge from a 401 response's `WWW-Authenticate`
    /// header, or a server-issued `nextnonce` from `Authentication-Info`.
    pub fn accept_challenge(&mut self, challenge: Challenge) {
        debug!("digest auth: accepted challenge for realm {:?}", challenge.realm);
        self.nonce_count = 0;
        self.cnonce = None;
        self.challenge = Some(challenge);
    }

    pub fn accept_nextnonce(&mut self, nonce: String) {
        if let Some(c) = &mut self.challenge {
            debug!("digest auth: rotating to server-issued nextnonce");
            c.nonce = nonce;
            self.nonce_count = 0;
            self.cnonce = None;
        }
    }

    /// Builds the `Authorization` header for one request against the
    /// current challenge. `body` is only hashed when the challenge asked
    /// for `qop=auth-int`.
    pub fn authorization_header(&mut self, method: &str, uri: &str, body: &[u8], cnonce_seed: &str) -> Result<String> {
        let challenge = self.challenge.clone().ok_or(Error::AuthProtocol)?;
        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);
        self.cnonce = Some(cnonce_seed.to_owned());
        let cnonce = cnonce_seed;

        let ha1 = self.ha1(&challenge, cnonce);
        let ha2 = ha2(challenge.algorithm, method, uri, challenge.qop, body);

        let response = match challenge.qop {
            Some(qop) => {
                let qop_str = match qop {
                    Qop::Auth => "auth",
                    Qop::AuthInt => "auth-int",
                };
                hash_hex(challenge.algorithm, format!("{ha1}:{}:{nc}:{cnonce}:{qop_str}:{ha2}", challenge.nonce).as_bytes())
            }
            None => hash_hex(challenge.algorithm, format!("{ha1}:{}:{ha2}", challenge.nonce).as_bytes()),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.user, challenge.realm, challenge.nonce, uri, response
        );
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header.push_str(&format!(", algorithm={}", algorithm_token(challenge.algorithm)));
        if let Some(qop) = challenge.qop {
            let qop_str = match qop {
                Qop::Auth => "auth",
                Qop::AuthInt => "auth-int",
            };
            header.push_str(&format!(", qop={qop_str}, nc={nc}, cnonce=\"{cnonce}\""));
        }
        Ok(header)
    }

    fn ha1(&self, challenge: &Challenge, cnonce: &str) -> String {
        let base = hash_hex(
            challenge.algorithm,
            format!("{}:{}:{}", self.user, challenge.realm, self.password).as_bytes(),
        );
        if challenge.algorithm.is_sess() {
            hash_hex(challenge.algorithm, format!("{base}:{}:{cnonce}", challenge.nonce).as_bytes())
        } else {
            base
        }
    }
}

fn ha2(algorithm: Algorithm, method: &str, uri: &str, qop: Option<Qop>, body: &[u8]) -> String {
    match qop {
        Some(Qop::AuthInt) => {
            let body_hash = hash_hex(algorithm, body);
            hash_hex(algorithm, format!("{method}:{uri}:{body_hash}").as_bytes())
        }
        _ => hash_hex(algorithm, format!("{method}:{uri}").as_bytes()),
    }
}

fn hash_hex(algorithm: Algorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hex::encode(hasher.finalize_reset())
}

fn algorithm_token(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::Md5 => "MD5",
        Algorithm::Md5Sess => "MD5-sess",
        Algorithm::Sha256 => "SHA-256",
        Algorithm::Sha256Sess => "SHA-256-sess",
        Algorithm::Sha512_256 => "SHA-512-256",
        Algorithm::Sha512_256Sess => "SHA-512-256-sess",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc7616_md5_challenge() {
        let header = r#"Digest realm="http-auth@example.org", qop="auth, auth-int", algorithm=MD5, nonce="7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v", opaque="FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS""#;
        let c = Challenge::parse(header).unwrap();
        assert_eq!(c.realm, "http-auth@example.org");
        assert_eq!(c.algorithm, Algorithm::Md5);
        assert_eq!(c.qop, Some(Qop::AuthInt));
        assert!(!c.stale);
    }

    #[test]
    fn rfc7616_md5_worked_example() {
        // RFC 7616 section 3.9.1.
        let mut state = DigestState::new("Mufasa".to_owned(), "Circle of Life".to_owned());
        state.accept_challenge(Challenge {
            realm: "http-auth@example.org".to_owned(),
            nonce: "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v".to_owned(),
            opaque: Some("FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS".to_owned()),
            algorithm: Algorithm::Md5,
            qop: Some(Qop::Auth),
            stale: false,
        });
        state.cnonce = Some("f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzUJd0kyfH1HMI".to_owned());
        let header = state
            .authorization_header("GET", "/dir/index.html", b"", "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzUJd0kyfH1HMI")
            .unwrap();
        assert!(header.contains("response=\"8ca523f5e9506fed4657c9700eebdbec\""));
    }

    #[test]
    fn sha256_variant_computes_distinct_response() {
        let mut state = DigestState::new("Mufasa".to_owned(), "Circle of Life".to_owned());
        state.accept_challenge(Challenge {
            realm: "http-auth@example.org".to_owned(),
            nonce: "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v".to_owned(),
            opaque: Some("FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS".to_owned()),
            algorithm: Algorithm::Sha256,
            qop: Some(Qop::Auth),
            stale: false,
        });
        state.cnonce = Some("f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzUJd0kyfH1HMI".to_owned());
        let header = state
            .authorization_header("GET", "/dir/index.html", b"", "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzUJd0kyfH1HMI")
            .unwrap();
        assert!(header.contains("response=\"753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1\""));
    }

    #[test]
    fn cnonce_is_regenerated_every_call_not_cached() {
        let mut state = DigestState::new("user".to_owned(), "pass".to_owned());
        state.accept_challenge(Challenge {
            realm: "realm".to_owned(),
            nonce: "servernonce".to_owned(),
            opaque: None,
            algorithm: Algorithm::Md5,
            qop: Some(Qop::Auth),
            stale: false,
        });

        let first = state.authorization_header("GET", "/a", b"", "cnonce-one").unwrap();
        let second = state.authorization_header("GET", "/a", b"", "cnonce-two").unwrap();

        assert!(first.contains("cnonce=\"cnonce-one\""));
        assert!(second.contains("cnonce=\"cnonce-two\""));
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }
}
