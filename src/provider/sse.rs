//! Server-sent events over a blocking reader.

use crate::error::BackendError;
use std::io::Read;

/// Minimal SSE parser.
///
/// - Collects UTF-8 lines
/// - Emits the accumulated `data:` payload when a blank line ends an event
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
    cur_data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, BackendError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }

            if line.is_empty() {
                if let Some(data) = self.take_event() {
                    out.push(Ok(data));
                }
                continue;
            }

            let s = match std::str::from_utf8(&line) {
                Ok(s) => s,
                Err(e) => {
                    out.push(Err(BackendError::ProtocolError(format!(
                        "SSE line is not valid UTF-8: {e}"
                    ))));
                    continue;
                }
            };

            // Other fields (event:, id:, retry:, comments) carry nothing we use.
            if let Some(rest) = s.strip_prefix("data:") {
                let rest = rest.strip_prefix(' ').unwrap_or(rest);
                self.cur_data.push_str(rest);
                self.cur_data.push('\n');
            }
        }

        out
    }

    /// Flush a final line and event that were not terminated.
    pub fn finish(&mut self) -> Vec<Result<String, BackendError>> {
        let mut out = if self.buf.is_empty() {
            Vec::new()
        } else {
            self.push(b"\n")
        };
        if let Some(data) = self.take_event() {
            out.push(Ok(data));
        }
        out
    }

    fn take_event(&mut self) -> Option<String> {
        if self.cur_data.is_empty() {
            return None;
        }
        if self.cur_data.ends_with('\n') {
            self.cur_data.pop();
        }
        Some(std::mem::take(&mut self.cur_data))
    }
}

/// Blocking iterator over the `data:` payloads of an SSE body.
///
/// Empty payloads are skipped and `[DONE]` ends the sequence.
pub(crate) struct SseEvents<R> {
    reader: R,
    parser: SseParser,
    pending: std::collections::VecDeque<Result<String, BackendError>>,
    done: bool,
}

impl<R: Read> SseEvents<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: SseParser::new(),
            pending: Default::default(),
            done: false,
        }
    }

    fn fill(&mut self) {
        let mut buf = [0u8; 8192];
        match self.reader.read(&mut buf) {
            Ok(0) => {
                self.done = true;
                self.pending.extend(self.parser.finish());
            }
            Ok(n) => self.pending.extend(self.parser.push(&buf[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.done = true;
                self.pending
                    .push_back(Err(BackendError::ProviderUnavailable(format!("network stream error: {e}"))));
            }
        }
    }
}

impl<R: Read> Iterator for SseEvents<R> {
    type Item = Result<String, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                match item {
                    Ok(data) if data.trim() == "[DONE]" => {
                        self.done = true;
                        self.pending.clear();
                        return None;
                    }
                    Ok(data) if data.trim().is_empty() => continue,
                    other => return Some(other),
                }
            }
            if self.done {
                return None;
            }
            self.fill();
        }
    }
}
