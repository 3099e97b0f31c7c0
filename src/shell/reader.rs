//! Background draining of a shell process's output pipe.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, trace, warn};

use super::process::{OutputSink, Shared, failed_wait_status};

/// Incremental UTF-8 decoder for a byte stream read in arbitrary chunks.
///
/// A multi-byte sequence split across two chunks is held back until the rest
/// arrives; bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + bytes` as possible.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Flush a dangling incomplete sequence at end-of-stream.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Start the reader thread for one shell process.
pub(crate) fn spawn_reader(
    shared: Arc<Shared>,
    source: Arc<File>,
    sink: OutputSink,
    buffer_size: usize,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("shell-reader-{}", shared.pid()))
        .spawn(move || drain(&shared, &source, sink, buffer_size))
}

fn drain(shared: &Shared, source: &File, sink: OutputSink, buffer_size: usize) {
    let pid = shared.pid();
    let mut reader: &File = source;
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut decoder = Utf8Decoder::new();
    let mut sink = Some(sink);

    loop {
        // Once cancelled, keep draining so the child never blocks on a full
        // pipe, but deliver nothing more.
        if sink.is_some() && shared.is_cancelled() {
            debug!(pid, "output reader cancelled; discarding output until the child exits");
            sink = None;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!(pid, bytes = n, "output chunk");
                let Some(sink) = sink.as_mut() else {
                    continue;
                };
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() {
                    sink(text.as_str());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(pid, error = %e, "reading shell output failed; treating as end of stream");
                break;
            }
        }
    }

    if let (Some(sink), Some(tail)) = (sink.as_mut(), decoder.finish()) {
        sink(tail.as_str());
    }
    drop(buf);

    // Reap even after cancellation so no zombie is left behind.
    let status = match shared.wait() {
        Ok(status) => status,
        Err(err) => {
            error!(pid, command = %shared.command(), error = %err, "failed to wait for shell process");
            failed_wait_status()
        }
    };
    if shared.is_cancelled() {
        debug!(pid, %status, "reaped cancelled shell process; completion suppressed");
        return;
    }
    debug!(pid, %status, "shell output drained");
    shared.finish(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_sequence_is_reassembled() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'a', 0xC3]), "a");
        assert_eq!(decoder.push(&[0xA9, b'b']), "éb");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_sequence_split_over_three_chunks() {
        let euro = "€".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&euro[..1]), "");
        assert_eq!(decoder.push(&euro[1..2]), "");
        assert_eq!(decoder.push(&euro[2..]), "€");
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'x', 0xFF, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn test_dangling_tail_is_flushed_lossily() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'o', b'k', 0xE2, 0x82]), "ok");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[test]
    fn test_nul_bytes_are_kept() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\0b"), "a\0b");
    }
}
