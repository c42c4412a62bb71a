//! C2: reassembles CRLF header lines and HTTP chunked bodies out of a
//! single fixed-size buffer, carrying leftover bytes from one raw read
//! across header parsing into the first body read.
//!
//! The buffer-carryover is expressed as an explicit cursor pair
//! (`start..filled`) rather than a raw pointer, the same shape as the
//! ancestor's binary argument decomposer: each `fetch` narrows the live
//! slice and returns a reference into it, never handing out a pointer
//! the caller could outlive.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::wire::Conn;

const DEFAULT_BUF_SIZE: usize = 16 * 1024;

/// Whether the reader currently expects header lines or body bytes.
/// Interleaving the two is a caller bug; debug builds catch it eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Header,
    Body,
}

pub struct MessageReader {
    buf: Vec<u8>,
    start: usize,
    filled: usize,
    mode: Mode,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUF_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        MessageReader {
            buf: vec![0u8; cap],
            start: 0,
            filled: 0,
            mode: Mode::Header,
        }
    }

    /// Resets the reader for a fresh request/response cycle. Any leftover
    /// carryover bytes from the previous response are discarded; callers
    /// must fully consume a response body before starting the next verb.
    pub fn reset(&mut self) {
        self.start = 0;
        self.filled = 0;
        self.mode = Mode::Header;
    }

    fn carryover(&self) -> &[u8] {
        &self.buf[self.start..self.filled]
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.filled, 0);
            self.filled -= self.start;
            self.start = 0;
        }
    }

    fn fill_more(&mut self, conn: &mut Conn, deadline: Instant) -> Result<usize> {
        self.compact();
        if self.filled == self.buf.len() {
            // Line longer than the buffer; grow rather than fail outright.
            self.buf.resize(self.buf.len() * 2, 0);
        }
        let n = conn.read_timed(&mut self.buf[self.filled..], deadline)?;
        if n == 0 {
            return Err(Error::ConnectionReset);
        }
        self.filled += n;
        Ok(n)
    }

    /// Reads one CRLF-terminated header line with the terminator stripped.
    pub fn read_line(&mut self, conn: &mut Conn, deadline: Instant) -> Result<String> {
        debug_assert_eq!(self.mode, Mode::Header, "read_line called while in body mode");
        loop {
            if let Some(pos) = memchr::memchr(b'\n', self.carryover()) {
                let line_end = self.start + pos;
                let mut line = &self.buf[self.start..line_end];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                let owned = String::from_utf8_lossy(line).into_owned();
                self.start = line_end + 1;
                return Ok(owned);
            }
            self.fill_more(conn, deadline)?;
        }
    }

    /// Switches the reader into body-reading mode. Must be called exactly
    /// once per response, after the header block's terminating blank line.
    pub fn begin_body(&mut self) {
        self.mode = Mode::Body;
    }

    /// Returns how many already-buffered bytes are available for the body
    /// reader without another raw read (the carryover from header
    /// parsing).
    pub fn buffered_len(&self) -> usize {
        self.filled - self.start
    }

    /// Reads exactly `buf.len()` body bytes, first draining carryover.
    pub fn read_body_exact(&mut self, conn: &mut Conn, out: &mut [u8], deadline: Instant) -> Result<()> {
        debug_assert_eq!(self.mode, Mode::Body, "read_body_exact called while in header mode");
        let mut written = 0;
        while written < out.len() {
            let avail = self.carryover();
            if !avail.is_empty() {
                let take = avail.len().min(out.len() - written);
                out[written..written + take].copy_from_slice(&avail[..take]);
                self.start += take;
                written += take;
                continue;
            }
            self.fill_more(conn, deadline)?;
        }
        Ok(())
    }

    /// Reads up to `out.len()` body bytes in a single underlying call,
    /// preferring carryover; returns the number of bytes placed.
    pub fn read_body_some(&mut self, conn: &mut Conn, out: &mut [u8], deadline: Instant) -> Result<usize> {
        debug_assert_eq!(self.mode, Mode::Body, "read_body_some called while in header mode");
        let avail = self.carryover();
        if !avail.is_empty() {
            let take = avail.len().min(out.len());
            out[..take].copy_from_slice(&avail[..take]);
            self.start += take;
            return Ok(take);
        }
        let n = conn.read_timed(out, deadline)?;
        Ok(n)
    }

    /// Reads one chunk of an HTTP chunked body: the hex size line, the
    /// payload, and the trailing CRLF. An empty chunk (`HTTP_LAST_CHUNK`)
    /// terminates the body.
    pub fn read_chunk(&mut self, conn: &mut Conn, deadline: Instant) -> Result<ChunkOutcome> {
        // The size line is itself CRLF-terminated, so momentarily borrow
        // header-line framing even though we are logically mid-body.
        self.mode = Mode::Header;
        let size_line = self.read_line(conn, deadline)?;
        self.mode = Mode::Body;

        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| Error::ListError)?;

        if size == 0 {
            // Trailing CRLF after the zero-size chunk; trailers (if any)
            // are not surfaced to callers, matching the Non-goal of not
            // treating chunked trailers as first-class response metadata.
            self.mode = Mode::Header;
            loop {
                let trailer = self.read_line(conn, deadline)?;
                if trailer.is_empty() {
                    break;
                }
            }
            self.mode = Mode::Body;
            return Ok(ChunkOutcome::Last);
        }

        let mut data = vec![0u8; size];
        self.read_body_exact(conn, &mut data, deadline)?;

        // Trailing CRLF after the chunk data.
        self.mode = Mode::Header;
        let trailer = self.read_line(conn, deadline)?;
        self.mode = Mode::Body;
        if !trailer.is_empty() {
            return Err(Error::ListError);
        }

        Ok(ChunkOutcome::Data(data))
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

pub enum ChunkOutcome {
    Data(Vec<u8>),
    Last,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn connected_pair(server_writes: Vec<u8>) -> Conn {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&server_writes).unwrap();
            // Keep the socket open briefly so reads don't race a close.
            let mut scratch = [0u8; 1];
            let _ = sock.read(&mut scratch);
        });
        let client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(handle);
        Conn::Plain(client)
    }

    #[test]
    fn read_line_splits_crlf() {
        let mut conn = connected_pair(b"first line\r\nsecond\r\n".to_vec());
        let mut reader = MessageReader::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(reader.read_line(&mut conn, deadline).unwrap(), "first line");
        assert_eq!(reader.read_line(&mut conn, deadline).unwrap(), "second");
    }

    #[test]
    fn carryover_feeds_body_reader() {
        // Headers and first body bytes arrive in the same raw read.
        let mut conn = connected_pair(b"X: 1\r\n\r\nHELLO".to_vec());
        let mut reader = MessageReader::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(reader.read_line(&mut conn, deadline).unwrap(), "X: 1");
        assert_eq!(reader.read_line(&mut conn, deadline).unwrap(), "");
        reader.begin_body();
        let mut body = [0u8; 5];
        reader.read_body_exact(&mut conn, &mut body, deadline).unwrap();
        assert_eq!(&body, b"HELLO");
    }

    #[test]
    fn chunked_body_yields_sizes_then_last() {
        let mut reader = MessageReader::new();
        let mut raw = Vec::new();
        raw.extend_from_slice(b"5\r\nhello\r\n");
        raw.extend_from_slice(b"9\r\nbeautiful\r\n");
        raw.extend_from_slice(b"0\r\n\r\n");
        let mut conn = connected_pair(raw);
        let deadline = Instant::now() + Duration::from_secs(2);
        reader.begin_body();

        match reader.read_chunk(&mut conn, deadline).unwrap() {
            ChunkOutcome::Data(d) => assert_eq!(d, b"hello"),
            ChunkOutcome::Last => panic!("expected data"),
        }
        match reader.read_chunk(&mut conn, deadline).unwrap() {
            ChunkOutcome::Data(d) => assert_eq!(d, b"beautiful"),
            ChunkOutcome::Last => panic!("expected data"),
        }
        match reader.read_chunk(&mut conn, deadline).unwrap() {
            ChunkOutcome::Data(_) => panic!("expected last chunk"),
            ChunkOutcome::Last => {}
        }
    }
}
