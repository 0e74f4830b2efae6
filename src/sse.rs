//! Server-Sent Events (SSE) parser.
//!
//! Parses an incrementally-arriving byte stream into `SseEvent`s. Lines are
//! split on raw bytes (`\n`, `\r\n`, or a lone `\r`), which is always safe
//! for valid UTF-8: continuation bytes of a multi-byte sequence never equal
//! `0x0A` or `0x0D`, so a line boundary can never fall mid-codepoint. Decoding
//! happens per complete line, not per network chunk - chunk boundaries may
//! still split a line's bytes, so decoding chunk-by-chunk (as opposed to
//! line-by-line) can corrupt multi-byte characters that straddle a chunk.

/// SSE event types.
#[derive(Debug, Clone)]
pub enum SseEvent {
    /// Data event with payload.
    Data(String),
    /// Control event with metadata.
    Control {
        stream_next_offset: String,
        stream_cursor: Option<String>,
        up_to_date: bool,
        stream_closed: bool,
    },
}

/// Incremental SSE parser fed raw bytes as they arrive off the wire.
pub struct SseParser {
    buf: Vec<u8>,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    /// Create a new, empty parser.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            event_type: None,
            data_lines: Vec::new(),
        }
    }

    /// Feed newly-received bytes and return any events completed by them.
    ///
    /// Multiple events may complete from a single `push` call; none will be
    /// lost if the caller exhausts the returned `Vec` before calling again.
    /// A malformed `event:control` body (not valid JSON / missing
    /// `streamNextOffset`) is reported as `Err` and the parser is otherwise
    /// left usable for subsequent events.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((line, consumed)) = next_line(&self.buf) {
            self.buf.drain(..consumed);

            if line.is_empty() {
                if let Some(event) = self.dispatch_event()? {
                    events.push(event);
                }
                continue;
            }

            let line = String::from_utf8_lossy(line);
            if let Some(rest) = line.strip_prefix("event:") {
                self.event_type = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.trim_start().to_string());
            }
            // Ignore other fields (id:, retry:, comments starting with :)
        }

        Ok(events)
    }

    /// True if bytes remain buffered that do not yet form a complete line.
    ///
    /// A non-empty remainder when the underlying connection closes means the
    /// body ended mid-event - the caller should surface a `Parse` error
    /// rather than silently dropping the partial data.
    pub fn has_pending_bytes(&self) -> bool {
        !self.buf.is_empty()
    }

    fn dispatch_event(&mut self) -> Result<Option<SseEvent>, String> {
        if self.data_lines.is_empty() {
            self.event_type = None;
            return Ok(None);
        }

        let data = self.data_lines.join("\n");
        let event_type = self.event_type.take();
        self.data_lines.clear();

        match event_type.as_deref() {
            Some("control") => {
                let json: serde_json::Value = serde_json::from_str(&data)
                    .map_err(|e| format!("malformed control event: {e}"))?;

                let stream_next_offset = json
                    .get("streamNextOffset")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();

                let stream_cursor = json
                    .get("streamCursor")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());

                let up_to_date = json
                    .get("upToDate")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let stream_closed = json
                    .get("streamClosed")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                Ok(Some(SseEvent::Control {
                    stream_next_offset,
                    stream_cursor,
                    up_to_date,
                    stream_closed,
                }))
            }
            None | Some("data") => Ok(Some(SseEvent::Data(data))),
            // Any other named event type is not part of this protocol and
            // is dropped rather than routed to data consumers.
            Some(_) => Ok(None),
        }
    }
}

/// Find the next complete line in `buf`, normalizing `\r\n` and lone `\r` to
/// a line boundary. Returns `(line_bytes, bytes_consumed_including_terminator)`.
/// `None` means no complete line is buffered yet (including the ambiguous
/// case of a trailing `\r` that might be the start of `\r\n`).
fn next_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'\n' => return Some((&buf[..i], i + 1)),
            b'\r' => {
                if i + 1 < buf.len() {
                    if buf[i + 1] == b'\n' {
                        return Some((&buf[..i], i + 2));
                    }
                    return Some((&buf[..i], i + 1));
                }
                // Could be the start of "\r\n" - wait for more bytes.
                return None;
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: hello world\n\n").unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SseEvent::Data(data) => assert_eq!(data, "hello world"),
            _ => panic!("expected data event"),
        }
    }

    #[test]
    fn test_parse_control_event() {
        let mut parser = SseParser::new();
        let input = b"event: control\ndata: {\"streamNextOffset\":\"123\",\"upToDate\":true}\n\n";
        let events = parser.push(input).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SseEvent::Control {
                stream_next_offset,
                up_to_date,
                stream_closed,
                ..
            } => {
                assert_eq!(stream_next_offset, "123");
                assert!(up_to_date);
                assert!(!stream_closed);
            }
            _ => panic!("expected control event"),
        }
    }

    #[test]
    fn test_multi_data_lines_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line one\ndata: line two\n\n").unwrap();
        match &events[0] {
            SseEvent::Data(data) => assert_eq!(data, "line one\nline two"),
            _ => panic!("expected data event"),
        }
    }

    #[test]
    fn test_event_split_across_chunk_boundary() {
        let mut parser = SseParser::new();
        let first = parser.push(b"data: hel").unwrap();
        assert!(first.is_empty());
        let second = parser.push(b"lo\n\n").unwrap();
        assert_eq!(second.len(), 1);
        match &second[0] {
            SseEvent::Data(data) => assert_eq!(data, "hello"),
            _ => panic!("expected data event"),
        }
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: hi\r\n\r\n").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_lone_cr_at_chunk_boundary_waits_for_more_data() {
        let mut parser = SseParser::new();
        let first = parser.push(b"data: hi\r").unwrap();
        assert!(first.is_empty());
        assert!(parser.has_pending_bytes());
        let second = parser.push(b"\r").unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_malformed_control_event_is_error() {
        let mut parser = SseParser::new();
        let result = parser.push(b"event: control\ndata: not json\n\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_event_type_is_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: heartbeat\ndata: ping\n\n").unwrap();
        assert!(events.is_empty());
    }
}
