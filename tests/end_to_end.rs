//! End-to-end scenarios driven against a real loopback `TcpListener`
//! standing in for the remote server, matching the teacher's preference
//! for direct syscall-level testing over a mocking framework.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use afd_core::auth::digest::{Algorithm, Challenge, Qop};
use afd_core::auth::sigv4::ListingVersion;
use afd_core::auth::AuthState;
use afd_core::auth::AuthType;
use afd_core::config::HostConfig;
use afd_core::hmr::Hmr;
use afd_core::http;
use afd_core::orchestrator::{run_pass, PassMode};
use afd_core::protocol::{HttpDirectory, RemoteDirectory, RemoteEntry};
use afd_core::reader::MessageReader;
use afd_core::retrieve_list::{Rl, RemoteStat};
use afd_core::wire::TlsVerifyMode;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_request_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn loopback_config() -> (TcpListener, HostConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = HostConfig {
        hostname: addr.ip().to_string(),
        port: addr.port(),
        tls_auth: TlsVerifyMode::None,
        transfer_timeout_secs: 5,
        ..Default::default()
    };
    (listener, config)
}

/// Seed scenario 1: resuming a partial GET picks up at the requested
/// offset and the caller reads exactly `Content-Length` bytes back.
#[test]
fn get_with_resume_returns_declared_range() {
    init_logging();
    let (listener, config) = loopback_config();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let req = read_request_head(&mut sock);
        assert!(req.contains("Range: bytes=512-"));
        let body = vec![b'x'; 512];
        let head = "HTTP/1.1 206 Partial Content\r\n\
             Content-Range: bytes 512-1023/1024\r\n\
             Content-Length: 512\r\n\
             Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT\r\n\r\n";
        sock.write_all(head.as_bytes()).unwrap();
        sock.write_all(&body).unwrap();
    });

    let mut hmr = Hmr::connect(&config).unwrap();
    let mut reader = MessageReader::new();
    let outcome = http::get(&mut hmr, &mut reader, &config, "/a/x", 512, None).unwrap();
    assert_eq!(outcome.status, 206);
    assert_eq!(outcome.content_length, Some(512));

    let mut body = vec![0u8; 512];
    let deadline = hmr.deadline(Duration::from_secs(5));
    reader.read_body_exact(hmr.conn_mut().unwrap(), &mut body, deadline).unwrap();
    assert_eq!(body, vec![b'x'; 512]);

    server.join().unwrap();
}

/// Seed scenario 2: once the server hands out a fresh nonce via
/// `Authentication-Info: nextnonce`, the next request on the connection
/// carries that nonce with a reset nonce-count.
#[test]
fn digest_reauth_picks_up_server_issued_nextnonce() {
    init_logging();
    let (listener, mut config) = loopback_config();
    config.auth_type = AuthType::Digest;
    config.user = Some("Mufasa".to_owned());
    config.password = Some("Circle of Life".to_owned());

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();

        let req1 = read_request_head(&mut sock);
        assert!(req1.contains("nonce=\"N1\""));
        assert!(req1.contains("nc=00000001"));
        let resp1 = "HTTP/1.1 200 OK\r\nAuthentication-Info: nextnonce=\"N2\"\r\nContent-Length: 0\r\n\r\n";
        sock.write_all(resp1.as_bytes()).unwrap();

        let req2 = read_request_head(&mut sock);
        assert!(req2.contains("nonce=\"N2\""));
        assert!(req2.contains("nc=00000001"));
        let resp2 = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        sock.write_all(resp2.as_bytes()).unwrap();
    });

    let mut hmr = Hmr::connect(&config).unwrap();
    if let AuthState::Digest(state) = hmr.auth_mut() {
        state.accept_challenge(Challenge {
            realm: "realm".to_owned(),
            nonce: "N1".to_owned(),
            opaque: None,
            algorithm: Algorithm::Md5,
            qop: Some(Qop::Auth),
            stale: false,
        });
    } else {
        panic!("expected digest auth state");
    }
    let mut reader = MessageReader::new();

    let first = http::get(&mut hmr, &mut reader, &config, "/secure", 0, None).unwrap();
    assert_eq!(first.status, 200);
    let second = http::get(&mut hmr, &mut reader, &config, "/secure", 0, None).unwrap();
    assert_eq!(second.status, 200);

    server.join().unwrap();
}

fn listing_body(entries: &[(&str, u64)], truncated: bool, next_token: Option<&str>) -> String {
    let mut body = String::from("<ListBucketResult>");
    for (name, size) in entries {
        body.push_str(&format!(
            "<Contents><Key>{name}</Key><LastModified>2024-01-02T03:04:05.000Z</LastModified><Size>{size}</Size></Contents>"
        ));
    }
    body.push_str(&format!("<IsTruncated>{truncated}</IsTruncated>"));
    if let Some(tok) = next_token {
        body.push_str(&format!("<NextContinuationToken>{tok}</NextContinuationToken>"));
    }
    body.push_str("</ListBucketResult>");
    body
}

/// Seed scenario 3: a truncated V2 listing is followed with the
/// continuation token until the caller has seen every entry exactly once.
#[test]
fn s3_listing_v2_pages_through_continuation_token() {
    init_logging();
    let (listener, mut config) = loopback_config();
    config.auth_type = AuthType::AwsSigV4;
    config.aws_access_key_id = Some("AKIDEXAMPLE".to_owned());
    config.aws_secret_access_key = Some("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_owned());
    config.sigv4_listing_version = ListingVersion::V2;

    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();

        let req1 = read_request_head(&mut sock);
        assert!(req1.contains("list-type=2"));
        assert!(!req1.contains("continuation-token"));
        let body1 = listing_body(&[("a.txt", 10), ("b.txt", 20)], true, Some("tok-2"));
        let resp1 = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body1}", body1.len());
        sock.write_all(resp1.as_bytes()).unwrap();

        let req2 = read_request_head(&mut sock);
        assert!(req2.contains("continuation-token=tok-2"));
        let body2 = listing_body(&[("c.txt", 30)], false, None);
        let resp2 = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body2}", body2.len());
        sock.write_all(resp2.as_bytes()).unwrap();
    });

    let mut hmr = Hmr::connect(&config).unwrap();
    let mut dir = HttpDirectory::new(&mut hmr, &config);
    dir.open_dir("/").unwrap();

    let mut seen = Vec::new();
    while let Some(RemoteEntry { name, .. }) = dir.readdir().unwrap() {
        seen.push(name);
    }
    dir.close_dir().unwrap();

    seen.sort();
    assert_eq!(seen, vec!["a.txt".to_owned(), "b.txt".to_owned(), "c.txt".to_owned()]);

    server.join().unwrap();
}

struct FixedDirectory {
    entries: Vec<RemoteEntry>,
}

impl RemoteDirectory for FixedDirectory {
    fn open_dir(&mut self, _remote_path: &str) -> afd_core::Result<()> {
        Ok(())
    }
    fn readdir(&mut self) -> afd_core::Result<Option<RemoteEntry>> {
        Ok(self.entries.pop())
    }
    fn close_dir(&mut self) -> afd_core::Result<()> {
        Ok(())
    }
    fn delete_remote_file(&mut self, _remote_path: &str, _name: &str) -> afd_core::Result<()> {
        Ok(())
    }
    fn quit(&mut self) {}
}

fn make_entries(names: &[&str]) -> Vec<RemoteEntry> {
    names
        .iter()
        .rev()
        .map(|n| RemoteEntry { name: (*n).to_owned(), stat: RemoteStat { mtime: 100, size: 1 } })
        .collect()
}

/// Seed scenario 4: two workers, a ten-file listing split into disjoint
/// halves, and a per-worker budget of four each admit exactly four and
/// report `more_files_in_list`, for eight admitted in total with no name
/// assigned by both.
///
/// Real cross-*process* lock contention is exercised by
/// `retrieve_list::lock`'s own unit tests; a single test process can't
/// demonstrate that (POSIX record locks are scoped per-process, so two
/// `Rl` handles opened by the same PID never actually contend). This test
/// instead validates the budget/admission bookkeeping the scenario cares
/// about, over a shared on-disk retrieve list.
#[test]
fn two_workers_split_budget_across_disjoint_listing_halves() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let list_path = dir.path().join("shared.list");

    let names: Vec<String> = (0..10).map(|i| format!("file{i}.dat")).collect();
    let (half_a, half_b) = names.split_at(5);

    let config = afd_core::config::DirectoryConfig {
        remote_path: "/incoming".to_owned(),
        file_masks: vec!["*.dat".to_owned()],
        max_copied_files: 4,
        ..Default::default()
    };

    let mut rl_a = Rl::attach(&list_path).unwrap();
    let mut remote_a = FixedDirectory { entries: make_entries(&half_a.iter().map(String::as_str).collect::<Vec<_>>()) };
    let summary_a = run_pass(&mut rl_a, &mut remote_a, &config, 1, PassMode::Fresh, 1000).unwrap();

    let mut rl_b = Rl::attach(&list_path).unwrap();
    let mut remote_b = FixedDirectory { entries: make_entries(&half_b.iter().map(String::as_str).collect::<Vec<_>>()) };
    let summary_b = run_pass(&mut rl_b, &mut remote_b, &config, 2, PassMode::Resume, 1000).unwrap();

    assert_eq!(summary_a.admitted_files, 4);
    assert!(summary_a.more_files_in_list);
    assert_eq!(summary_b.admitted_files, 4);
    assert!(summary_b.more_files_in_list);
    assert_eq!(summary_a.admitted_files + summary_b.admitted_files, 8);
}

/// Seed scenario 6: a chunked response with chunk sizes `[5, 9, 0]`
/// yields exactly those sizes, then `ChunkOutcome::Last`.
#[test]
fn chunked_get_yields_declared_chunk_sizes() {
    init_logging();
    let (listener, config) = loopback_config();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let _req = read_request_head(&mut sock);
        let head = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        sock.write_all(head.as_bytes()).unwrap();
        sock.write_all(b"5\r\nhello\r\n9\r\nworld!!!!\r\n0\r\n\r\n").unwrap();
    });

    let mut hmr = Hmr::connect(&config).unwrap();
    let mut reader = MessageReader::new();
    let outcome = http::get(&mut hmr, &mut reader, &config, "/stream", 0, None).unwrap();
    assert!(outcome.chunked);

    let deadline = hmr.deadline(Duration::from_secs(5));
    let conn = hmr.conn_mut().unwrap();

    let first = reader.read_chunk(conn, deadline).unwrap();
    let afd_core::reader::ChunkOutcome::Data(data) = first else { panic!("expected data chunk") };
    assert_eq!(data.len(), 5);

    let conn = hmr.conn_mut().unwrap();
    let second = reader.read_chunk(conn, deadline).unwrap();
    let afd_core::reader::ChunkOutcome::Data(data) = second else { panic!("expected data chunk") };
    assert_eq!(data.len(), 9);

    let conn = hmr.conn_mut().unwrap();
    let third = reader.read_chunk(conn, deadline).unwrap();
    assert!(matches!(third, afd_core::reader::ChunkOutcome::Last));

    server.join().unwrap();
}
