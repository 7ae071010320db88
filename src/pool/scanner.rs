//! Incremental lexer for the marker protocol.
//!
//! Interpreter output arrives in arbitrary chunks, so a marker such as
//! `end:3f2a...` may be split across two reads. [`MarkerScanner`] buffers
//! output and only releases text once it is certain that no marker can begin
//! inside it. Marker bytes are never part of emitted text.
//!
//! # Grammar
//!
//! ```text
//! marker := kind ":" token
//! kind   := "begin" | "end" | "error" | "ready"      (case-insensitive)
//! token  := 8hex "-" 4hex "-" 4hex "-" 4hex "-" 12hex (case-insensitive)
//! ```

use std::fmt;
use std::sync::OnceLock;

use regex::bytes::Regex;

use super::token::{Token, TOKEN_LEN, TOKEN_PATTERN};

/// Marker prefixes, including the separating colon.
const KIND_PREFIXES: [&[u8]; 4] = [b"begin:", b"end:", b"error:", b"ready:"];

/// Longest possible marker in bytes (`error:` or `ready:` plus a token).
const MAX_MARKER_LEN: usize = 6 + TOKEN_LEN;

/// Positions of the hyphens inside a token.
const TOKEN_HYPHENS: [usize; 4] = [8, 13, 18, 23];

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(&format!("(?i)(begin|end|error|ready):({})", TOKEN_PATTERN))
            .expect("marker pattern is a valid regex")
    })
}

/// The lifecycle event a marker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Script evaluation is about to start.
    Begin,
    /// Script evaluation finished, successfully or not.
    End,
    /// Script evaluation raised an error.
    Error,
    /// Instance finished its startup handshake.
    Ready,
}

impl MarkerKind {
    fn from_bytes(kind: &[u8]) -> Option<Self> {
        match kind.to_ascii_lowercase().as_slice() {
            b"begin" => Some(MarkerKind::Begin),
            b"end" => Some(MarkerKind::End),
            b"error" => Some(MarkerKind::Error),
            b"ready" => Some(MarkerKind::Ready),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKind::Begin => "begin",
            MarkerKind::End => "end",
            MarkerKind::Error => "error",
            MarkerKind::Ready => "ready",
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub token: Token,
}

impl Marker {
    pub fn new(kind: MarkerKind, token: Token) -> Self {
        Self { kind, token }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.token)
    }
}

/// One unit of scanner output, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Plain output with all markers removed.
    Text(String),
    /// A complete marker.
    Marker(Marker),
}

/// Streaming scanner over one instance's stdout.
#[derive(Debug, Default)]
pub struct MarkerScanner {
    pending: Vec<u8>,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of output and returns every event that can be resolved.
    ///
    /// Bytes that could still be the beginning of a marker, or of a UTF-8
    /// sequence, stay buffered until a later chunk resolves them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ScanEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;

        for caps in marker_regex().captures_iter(&self.pending) {
            let (Some(whole), Some(kind), Some(token)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let Some(kind) = MarkerKind::from_bytes(kind.as_bytes()) else {
                continue;
            };
            let Some(token) = std::str::from_utf8(token.as_bytes())
                .ok()
                .and_then(|t| t.parse::<Token>().ok())
            else {
                continue;
            };

            push_text(&mut events, &self.pending[consumed..whole.start()]);
            events.push(ScanEvent::Marker(Marker::new(kind, token)));
            consumed = whole.end();
        }

        let tail = &self.pending[consumed..];
        let releasable = complete_utf8_prefix(&tail[..tail.len() - marker_prefix_len(tail)]);
        push_text(&mut events, &tail[..releasable]);

        self.pending.drain(..consumed + releasable);
        events
    }

    /// Number of bytes currently held back.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Releases whatever is still buffered as text.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

fn push_text(events: &mut Vec<ScanEvent>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(bytes).into_owned();
    match events.last_mut() {
        Some(ScanEvent::Text(prev)) => prev.push_str(&text),
        _ => events.push(ScanEvent::Text(text)),
    }
}

/// Length of the longest suffix of `tail` that could still grow into a
/// marker. Zero when the tail can be released entirely.
fn marker_prefix_len(tail: &[u8]) -> usize {
    let window = tail.len().saturating_sub(MAX_MARKER_LEN - 1);
    (window..tail.len())
        .find(|&start| is_marker_prefix(&tail[start..]))
        .map(|start| tail.len() - start)
        .unwrap_or(0)
}

fn is_marker_prefix(candidate: &[u8]) -> bool {
    if candidate.is_empty() {
        return false;
    }
    KIND_PREFIXES.iter().any(|kind| {
        if candidate.len() <= kind.len() {
            return kind[..candidate.len()].eq_ignore_ascii_case(candidate);
        }
        if !candidate[..kind.len()].eq_ignore_ascii_case(kind) {
            return false;
        }
        let rest = &candidate[kind.len()..];
        rest.len() < TOKEN_LEN && is_token_prefix(rest)
    })
}

fn is_token_prefix(rest: &[u8]) -> bool {
    rest.iter().enumerate().all(|(i, b)| {
        if TOKEN_HYPHENS.contains(&i) {
            *b == b'-'
        } else {
            b.is_ascii_hexdigit()
        }
    })
}

/// Length of `bytes` excluding a trailing, incomplete UTF-8 sequence.
pub(crate) fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A UTF-8 sequence is at most 4 bytes, so only the last 3 can be a
    // truncated one.
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if back < needed { len - back } else { len };
    }
    len
}

/// Decodes a byte stream to text without splitting multi-byte characters.
///
/// Used for stderr, which is never scanned for markers.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let complete = complete_utf8_prefix(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(events: &[ScanEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Text(t) => Some(t.as_str()),
                ScanEvent::Marker(_) => None,
            })
            .collect()
    }

    fn markers_of(events: &[ScanEvent]) -> Vec<Marker> {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Marker(m) => Some(*m),
                ScanEvent::Text(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut scanner = MarkerScanner::new();
        let events = scanner.feed(b"[1] 2\n");
        assert_eq!(events, vec![ScanEvent::Text("[1] 2\n".to_string())]);
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_markers_are_stripped_from_surrounding_text() {
        let token = Token::new();
        let chunk = format!("begin:{token}[1] 2\nend:{token}");

        let mut scanner = MarkerScanner::new();
        let events = scanner.feed(chunk.as_bytes());

        assert_eq!(
            events,
            vec![
                ScanEvent::Marker(Marker::new(MarkerKind::Begin, token)),
                ScanEvent::Text("[1] 2\n".to_string()),
                ScanEvent::Marker(Marker::new(MarkerKind::End, token)),
            ]
        );
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let token = Token::new();
        let full = format!("out\nend:{token}tail");
        let (first, second) = full.as_bytes().split_at(12);

        let mut scanner = MarkerScanner::new();
        let mut events = scanner.feed(first);
        assert_eq!(text_of(&events), "out\n");
        assert!(markers_of(&events).is_empty());
        assert!(scanner.buffered() > 0);

        events.extend(scanner.feed(second));
        assert_eq!(markers_of(&events), vec![Marker::new(MarkerKind::End, token)]);
        assert_eq!(text_of(&events), "out\ntail");
        assert!(!text_of(&events).contains(&token.to_string()));
    }

    #[test]
    fn test_marker_split_one_byte_at_a_time() {
        let token = Token::new();
        let full = format!("x error:{token} y end:{token}");

        let mut scanner = MarkerScanner::new();
        let mut events = Vec::new();
        for byte in full.as_bytes() {
            events.extend(scanner.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(
            markers_of(&events),
            vec![
                Marker::new(MarkerKind::Error, token),
                Marker::new(MarkerKind::End, token),
            ]
        );
        assert_eq!(text_of(&events), "x  y ");
    }

    #[test]
    fn test_markers_match_case_insensitively() {
        let token = Token::new();
        let chunk = format!("END:{}", token.to_string().to_uppercase());

        let mut scanner = MarkerScanner::new();
        let events = scanner.feed(chunk.as_bytes());
        assert_eq!(markers_of(&events), vec![Marker::new(MarkerKind::End, token)]);
        assert_eq!(text_of(&events), "");
    }

    #[test]
    fn test_false_prefix_is_released_once_resolved() {
        let mut scanner = MarkerScanner::new();

        let events = scanner.feed(b"the end");
        assert_eq!(text_of(&events), "the ");
        assert_eq!(scanner.buffered(), 3);

        let events = scanner.feed(b" of it\n");
        assert_eq!(text_of(&events), "end of it\n");
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_malformed_token_is_plain_text() {
        let mut scanner = MarkerScanner::new();
        let events = scanner.feed(b"end:not-a-token-at-all\n");
        assert_eq!(text_of(&events), "end:not-a-token-at-all\n");
        assert!(markers_of(&events).is_empty());
    }

    #[test]
    fn test_ready_marker_after_banner() {
        let token = Token::new();
        let chunk = format!("R version 4.3\nready:{token}");

        let mut scanner = MarkerScanner::new();
        let events = scanner.feed(chunk.as_bytes());
        assert_eq!(
            events,
            vec![
                ScanEvent::Text("R version 4.3\n".to_string()),
                ScanEvent::Marker(Marker::new(MarkerKind::Ready, token)),
            ]
        );
    }

    #[test]
    fn test_split_utf8_sequence_is_held_back() {
        let bytes = "héllo".as_bytes();
        let mut scanner = MarkerScanner::new();

        let first = scanner.feed(&bytes[..2]);
        assert_eq!(text_of(&first), "h");

        let second = scanner.feed(&bytes[2..]);
        assert_eq!(text_of(&second), "éllo");
    }

    #[test]
    fn test_finish_flushes_buffer() {
        let mut scanner = MarkerScanner::new();
        scanner.feed(b"almost begin:1234");
        assert_eq!(scanner.finish(), Some("begin:1234".to_string()));
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_is_marker_prefix() {
        assert!(is_marker_prefix(b"e"));
        assert!(is_marker_prefix(b"ERR"));
        assert!(is_marker_prefix(b"ready:0123abcd-"));
        assert!(!is_marker_prefix(b"ready:0123abcdx"));
        assert!(!is_marker_prefix(b"xend"));
        assert!(!is_marker_prefix(b""));
    }

    #[test]
    fn test_utf8_decoder() {
        let bytes = "€ warning".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..2]), "");
        assert_eq!(decoder.decode(&bytes[2..]), "€ warning");
    }

    #[test]
    fn test_complete_utf8_prefix() {
        assert_eq!(complete_utf8_prefix(b"abc"), 3);
        assert_eq!(complete_utf8_prefix(&"é".as_bytes()[..1]), 0);
        assert_eq!(complete_utf8_prefix("é".as_bytes()), 2);
        assert_eq!(complete_utf8_prefix(b""), 0);
    }
}
