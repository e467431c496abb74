//! PtyInjector: minimal pattern-matching I/O on a raw PTY file descriptor.
//!
//! The console driver needs four primitives — write, write-line, drain, and
//! expect — and explicit result values instead of exception control flow:
//! `expect` returns the text before the match or a typed error.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpectError {
    #[error("timed out after {0:?} waiting for pattern")]
    Timeout(Duration),
    #[error("PTY fd returned empty read (closed)")]
    Eof,
    #[error("PTY I/O error: {0}")]
    Io(#[from] nix::errno::Errno),
    #[error("invalid expect pattern: {0}")]
    BadPattern(String),
}

/// Result of a successful `expect_capture`.
#[derive(Debug, Clone)]
pub struct ExpectMatch {
    pub index: usize,
    pub before: String,
    pub matched: String,
}

pub struct PtyInjector {
    fd: RawFd,
    /// Everything read so far that has not been consumed by a match.
    buffer: Vec<u8>,
    /// Forward raw reads to the WebSocket so the user watches automation
    /// output live during piggyback extraction.
    forward: Option<Box<dyn Fn(&[u8]) + Send>>,
}

impl PtyInjector {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buffer: Vec::new(),
            forward: None,
        }
    }

    pub fn with_forward(fd: RawFd, forward: Box<dyn Fn(&[u8]) + Send>) -> Self {
        Self {
            fd,
            buffer: Vec::new(),
            forward: Some(forward),
        }
    }

    pub fn send(&mut self, text: &str) -> Result<(), ExpectError> {
        let bytes = text.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            written += nix::unistd::write(
                unsafe { BorrowedFd::borrow_raw(self.fd) },
                &bytes[written..],
            )?;
        }
        Ok(())
    }

    pub fn sendline(&mut self, text: &str) -> Result<(), ExpectError> {
        self.send(text)?;
        self.send("\r")
    }

    fn read_available(&mut self, wait: Duration) -> Result<usize, ExpectError> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout = PollTimeout::from(wait.as_millis().min(u16::MAX as u128) as u16);
        let n = poll(&mut fds, timeout)?;
        if n == 0 {
            return Ok(0);
        }
        let mut chunk = [0u8; 4096];
        let read = match nix::unistd::read(self.fd, &mut chunk) {
            Ok(0) => return Err(ExpectError::Eof),
            Ok(read) => read,
            // A PTY master reports EIO once the slave side is gone.
            Err(nix::errno::Errno::EIO) => return Err(ExpectError::Eof),
            Err(err) => return Err(err.into()),
        };
        if let Some(forward) = &self.forward {
            forward(&chunk[..read]);
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Read whatever arrives for `duration`, forwarding to the WebSocket.
    /// Returns the bytes drained.
    pub fn drain(&mut self, duration: Duration) -> Vec<u8> {
        let deadline = Instant::now() + duration;
        let start = self.buffer.len();
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_available(remaining.min(Duration::from_millis(100))) {
                Ok(_) => {}
                Err(_) => break,
            }
        }
        self.buffer.split_off(start.min(self.buffer.len()))
    }

    /// Accumulate reads until `pattern` matches, returning everything
    /// before the match. The matched text itself is consumed.
    pub fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<String, ExpectError> {
        let patterns = [pattern];
        self.expect_any(&patterns, timeout).map(|(_, before)| before)
    }

    /// Like `expect` but races several patterns; returns the index of the
    /// one that matched and the text before it.
    pub fn expect_any(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(usize, String), ExpectError> {
        self.expect_capture(patterns, timeout)
            .map(|m| (m.index, m.before))
    }

    /// Full-detail expect: which pattern matched, the text before it, and
    /// the matched text itself (the prompt, usually).
    pub fn expect_capture(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<ExpectMatch, ExpectError> {
        let compiled: Vec<Regex> = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?m){p}"))
                    .map_err(|err| ExpectError::BadPattern(err.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let deadline = Instant::now() + timeout;
        loop {
            let text = String::from_utf8_lossy(&self.buffer).to_string();
            let mut best: Option<(usize, usize, usize)> = None;
            for (index, regex) in compiled.iter().enumerate() {
                if let Some(found) = regex.find(&text) {
                    let candidate = (found.start(), index, found.end());
                    if best.map(|b| candidate.0 < b.0).unwrap_or(true) {
                        best = Some(candidate);
                    }
                }
            }
            if let Some((start, index, end)) = best {
                let before = text[..start].to_string();
                let matched = text[start..end].to_string();
                // Consume through the match; the remainder stays buffered.
                let consumed = text[..end].len();
                self.buffer.drain(..consumed.min(self.buffer.len()));
                return Ok(ExpectMatch {
                    index,
                    before,
                    matched,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ExpectError::Timeout(timeout));
            }
            let wait = (deadline - now).min(Duration::from_millis(200));
            self.read_available(wait)?;
        }
    }

    /// Text currently buffered but not yet matched.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buffer).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, OwnedFd};

    /// A connected pipe pair standing in for the PTY.
    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        (read_end, write_end)
    }

    #[test]
    fn expect_returns_text_before_match() {
        let (read_end, write_end) = pipe_pair();
        nix::unistd::write(&write_end, b"some banner\r\nswitch# ").unwrap();

        let mut injector = PtyInjector::new(read_end.as_raw_fd());
        let before = injector
            .expect(r"[\w.\-]+(?:\([^)\r\n]+\))?[>#]\s*$", Duration::from_secs(2))
            .unwrap();
        assert!(before.contains("some banner"));
    }

    #[test]
    fn expect_times_out_without_match() {
        let (read_end, _write_end) = pipe_pair();
        let mut injector = PtyInjector::new(read_end.as_raw_fd());
        let err = injector
            .expect("never-appears", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ExpectError::Timeout(_)));
    }

    #[test]
    fn expect_reports_eof_on_closed_fd() {
        let (read_end, write_end) = pipe_pair();
        drop(write_end);
        let mut injector = PtyInjector::new(read_end.as_raw_fd());
        let err = injector
            .expect("anything", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ExpectError::Eof));
    }

    #[test]
    fn expect_any_picks_earliest_match() {
        let (read_end, write_end) = pipe_pair();
        nix::unistd::write(&write_end, b"login: ").unwrap();
        let mut injector = PtyInjector::new(read_end.as_raw_fd());
        let (index, _) = injector
            .expect_any(&[r"[Pp]assword:", r"[Ll]ogin:"], Duration::from_secs(2))
            .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn sendline_appends_carriage_return() {
        let (read_end, write_end) = pipe_pair();
        let mut injector = PtyInjector::new(write_end.as_raw_fd());
        injector.sendline("enable").unwrap();
        let mut buf = [0u8; 16];
        let n = nix::unistd::read(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"enable\r");
    }

    #[test]
    fn drain_forwards_and_returns_bytes() {
        let (read_end, write_end) = pipe_pair();
        nix::unistd::write(&write_end, b"boot noise").unwrap();
        let forwarded = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = forwarded.clone();
        let mut injector = PtyInjector::with_forward(
            read_end.as_raw_fd(),
            Box::new(move |bytes| sink.lock().unwrap().extend_from_slice(bytes)),
        );
        let drained = injector.drain(Duration::from_millis(200));
        assert_eq!(drained, b"boot noise");
        assert_eq!(forwarded.lock().unwrap().as_slice(), b"boot noise");
    }
}
