//! Control protocol framing.
//!
//! Outgoing requests are either sent verbatim ([`Request::Raw`]) or framed
//! as control protocol commands ([`Request::Formatted`]). Incoming bytes are
//! split into [`ControlMessage`]s by [`ReplyParser`], which only understands
//! the framing fields of each line:
//!
//! ```text
//! 250-version=0.4.8.9          status "250", divider '-' (more lines follow)
//! 250+config-text=             status "250", divider '+' (data block follows)
//! ControlPort 9051
//! .                            end of data block
//! 250 OK                       status "250", divider ' ' (end of message)
//! ```
//!
//! Asynchronous events use the `6xx` status class (`650 BW 1024 2048`);
//! everything else is a reply to a request.

use std::fmt;

use crate::error::{ControlError, Result};

/// Longest line accepted from the daemon, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Largest message accepted from the daemon, data blocks included.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// A request to write to the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A command that gets control protocol line framing applied.
    Formatted(String),
    /// Bytes written to the wire exactly as given.
    Raw(Vec<u8>),
}

impl Request {
    pub fn formatted(command: impl Into<String>) -> Self {
        Self::Formatted(command.into())
    }

    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Raw(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Formatted(text) => text.is_empty(),
            Self::Raw(bytes) => bytes.is_empty(),
        }
    }

    /// The exact bytes this request puts on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Self::Raw(bytes) => bytes.clone(),
            Self::Formatted(text) => format_command(text).into_bytes(),
        }
    }
}

impl From<&str> for Request {
    fn from(command: &str) -> Self {
        Self::Formatted(command.to_string())
    }
}

impl From<String> for Request {
    fn from(command: String) -> Self {
        Self::Formatted(command)
    }
}

/// Apply control protocol framing to a command.
///
/// Single-line commands are CRLF terminated. Multi-line commands become a
/// `+` data command whose body ends with a lone `.`; body lines starting
/// with `.` are dot-escaped.
fn format_command(text: &str) -> String {
    let body = text
        .strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text);

    if !body.contains('\n') {
        return format!("{body}\r\n");
    }

    let mut lines = body.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let mut out = String::with_capacity(body.len() + 16);
    out.push('+');
    out.push_str(lines.next().unwrap_or_default());
    out.push_str("\r\n");
    for line in lines {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

/// The character following a line's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divider {
    /// `' '` — last line of the message.
    End,
    /// `'-'` — more lines follow.
    Continue,
    /// `'+'` — a dot-terminated data block follows.
    Data,
}

impl Divider {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b' ' => Some(Self::End),
            b'-' => Some(Self::Continue),
            b'+' => Some(Self::Data),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::End => ' ',
            Self::Continue => '-',
            Self::Data => '+',
        }
    }
}

/// One logical line of a message. Data blocks are folded into the content
/// of the line that opened them, joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: String,
    pub divider: Divider,
    pub content: String,
}

/// A complete reply or pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    lines: Vec<ReplyLine>,
    raw: Vec<u8>,
}

impl ControlMessage {
    /// Parse exactly one complete message from a byte buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut parser = ReplyParser::new();
        let mut message = None;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            if message.is_some() {
                return Err(ControlError::Protocol(
                    "trailing data after end of message".to_string(),
                ));
            }
            message = parser.push_line(line)?;
        }
        message.ok_or_else(|| ControlError::Protocol("incomplete message".to_string()))
    }

    pub fn lines(&self) -> &[ReplyLine] {
        &self.lines
    }

    /// Bytes exactly as received, including terminators.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Status code of the final line.
    pub fn status_code(&self) -> &str {
        self.lines
            .last()
            .map(|line| line.status.as_str())
            .unwrap_or_default()
    }

    /// Every line carries status `250`.
    pub fn is_ok(&self) -> bool {
        !self.lines.is_empty() && self.lines.iter().all(|line| line.status == "250")
    }

    /// The message is an asynchronous event rather than a reply.
    pub fn is_event(&self) -> bool {
        self.lines
            .first()
            .is_some_and(|line| line.status.starts_with('6'))
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(&line.content)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PendingData {
    status: String,
    content: String,
}

/// Incremental parser fed one `\n`-terminated line at a time.
///
/// After an error the partial message is discarded and the parser is ready
/// for the next message.
#[derive(Debug)]
pub struct ReplyParser {
    lines: Vec<ReplyLine>,
    raw: Vec<u8>,
    data: Option<PendingData>,
    max_message_len: usize,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::with_max_message_len(MAX_MESSAGE_LEN)
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser that rejects messages larger than `max` bytes.
    pub fn with_max_message_len(max: usize) -> Self {
        Self {
            lines: Vec::new(),
            raw: Vec::new(),
            data: None,
            max_message_len: max,
        }
    }

    /// Whether a message has been started but not finished.
    pub fn in_progress(&self) -> bool {
        !self.raw.is_empty()
    }

    /// Feed one line, including its terminator. Returns the message once its
    /// final line has been seen.
    pub fn push_line(&mut self, line: &[u8]) -> Result<Option<ControlMessage>> {
        match self.parse_line(line) {
            Ok(done) => Ok(done),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<Option<ControlMessage>> {
        if self.raw.len() + line.len() > self.max_message_len {
            return Err(ControlError::Protocol(format!(
                "message longer than {} bytes",
                self.max_message_len
            )));
        }
        self.raw.extend_from_slice(line);

        let Some(body) = line.strip_suffix(b"\r\n") else {
            return Err(ControlError::Protocol(format!(
                "line not terminated with CRLF: {:?}",
                String::from_utf8_lossy(line)
            )));
        };

        if body == b"." {
            if let Some(data) = self.data.take() {
                self.lines.push(ReplyLine {
                    status: data.status,
                    divider: Divider::Data,
                    content: data.content,
                });
                return Ok(None);
            }
        }

        if let Some(data) = self.data.as_mut() {
            // ".." at the start of a data line is an escaped "."
            let unescaped = body.strip_prefix(b".").filter(|rest| rest.starts_with(b"."));
            data.content.push('\n');
            data.content
                .push_str(&String::from_utf8_lossy(unescaped.unwrap_or(body)));
            return Ok(None);
        }

        if body.len() < 4 {
            return Err(ControlError::Protocol(format!(
                "line too short: {:?}",
                String::from_utf8_lossy(body)
            )));
        }

        let (status, rest) = body.split_at(3);
        if !status.iter().all(u8::is_ascii_digit) {
            return Err(ControlError::Protocol(format!(
                "invalid status code: {:?}",
                String::from_utf8_lossy(status)
            )));
        }
        let status = String::from_utf8_lossy(status).into_owned();
        let divider = Divider::from_byte(rest[0]).ok_or_else(|| {
            ControlError::Protocol(format!("unrecognized divider {:?}", rest[0] as char))
        })?;
        let content = String::from_utf8_lossy(&rest[1..]).into_owned();

        match divider {
            Divider::Continue => {
                self.lines.push(ReplyLine {
                    status,
                    divider,
                    content,
                });
                Ok(None)
            }
            Divider::Data => {
                self.data = Some(PendingData { status, content });
                Ok(None)
            }
            Divider::End => {
                self.lines.push(ReplyLine {
                    status,
                    divider,
                    content,
                });
                Ok(Some(ControlMessage {
                    lines: std::mem::take(&mut self.lines),
                    raw: std::mem::take(&mut self.raw),
                }))
            }
        }
    }

    /// Drop any partially parsed message.
    pub(crate) fn reset(&mut self) {
        self.lines.clear();
        self.raw.clear();
        self.data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_single_line() {
        assert_eq!(Request::from("GETINFO version").to_wire(), b"GETINFO version\r\n");
        assert_eq!(Request::from("SIGNAL NEWNYM\r\n").to_wire(), b"SIGNAL NEWNYM\r\n");
        assert_eq!(Request::from("SIGNAL NEWNYM\n").to_wire(), b"SIGNAL NEWNYM\r\n");
    }

    #[test]
    fn test_format_multi_line() {
        let request = Request::formatted("LOADCONF\nSocksPort 9050\n.hidden\nLog notice");
        assert_eq!(
            String::from_utf8(request.to_wire()).unwrap(),
            "+LOADCONF\r\nSocksPort 9050\r\n..hidden\r\nLog notice\r\n.\r\n"
        );
    }

    #[test]
    fn test_format_multi_line_crlf_input() {
        let request = Request::formatted("LOADCONF\r\nSocksPort 9050\r\n");
        assert_eq!(
            String::from_utf8(request.to_wire()).unwrap(),
            "+LOADCONF\r\nSocksPort 9050\r\n.\r\n"
        );
    }

    #[test]
    fn test_raw_is_verbatim() {
        let request = Request::raw(b"PROTOCOLINFO".to_vec());
        assert_eq!(request.to_wire(), b"PROTOCOLINFO");
        assert!(!request.is_empty());
        assert!(Request::raw(Vec::new()).is_empty());
        assert!(Request::formatted("").is_empty());
    }

    #[test]
    fn test_parse_single_line_reply() {
        let msg = ControlMessage::from_bytes(b"250 OK\r\n").unwrap();
        assert!(msg.is_ok());
        assert!(!msg.is_event());
        assert_eq!(msg.status_code(), "250");
        assert_eq!(msg.to_string(), "OK");
        assert_eq!(msg.raw(), b"250 OK\r\n");
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let raw = b"250-version=0.4.8.9\r\n250-config-file=/etc/tor/torrc\r\n250 OK\r\n";
        let msg = ControlMessage::from_bytes(raw).unwrap();
        assert_eq!(msg.lines().len(), 3);
        assert_eq!(msg.lines()[0].divider, Divider::Continue);
        assert_eq!(msg.lines()[0].content, "version=0.4.8.9");
        assert_eq!(msg.lines()[2].divider, Divider::End);
        assert!(msg.is_ok());
    }

    #[test]
    fn test_parse_data_block() {
        let raw = b"250+config-text=\r\nControlPort 9051\r\n..dotted\r\n.\r\n250 OK\r\n";
        let msg = ControlMessage::from_bytes(raw).unwrap();
        assert_eq!(msg.lines().len(), 2);
        assert_eq!(msg.lines()[0].divider, Divider::Data);
        assert_eq!(
            msg.lines()[0].content,
            "config-text=\nControlPort 9051\n.dotted"
        );
        assert_eq!(msg.raw(), raw);
    }

    #[test]
    fn test_parse_event() {
        let msg = ControlMessage::from_bytes(b"650 BW 1024 2048\r\n").unwrap();
        assert!(msg.is_event());
        assert!(!msg.is_ok());
        assert_eq!(msg.status_code(), "650");
    }

    #[test]
    fn test_parse_error_reply() {
        let msg = ControlMessage::from_bytes(b"552 Unrecognized key \"foo\"\r\n").unwrap();
        assert!(!msg.is_ok());
        assert!(!msg.is_event());
        assert_eq!(msg.status_code(), "552");
    }

    #[test]
    fn test_rejects_malformed_lines() {
        for raw in [
            &b"250 OK\n"[..],
            b"25\r\n",
            b"2x0 OK\r\n",
            b"250*OK\r\n",
        ] {
            assert!(
                matches!(ControlMessage::from_bytes(raw), Err(ControlError::Protocol(_))),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_rejects_incomplete_and_trailing() {
        assert!(ControlMessage::from_bytes(b"250-partial\r\n").is_err());
        assert!(ControlMessage::from_bytes(b"250 OK\r\n250 OK\r\n").is_err());
        assert!(ControlMessage::from_bytes(b"").is_err());
    }

    #[test]
    fn test_parser_recovers_after_error() {
        let mut parser = ReplyParser::new();
        assert!(parser.push_line(b"250-first\r\n").unwrap().is_none());
        assert!(parser.in_progress());
        assert!(parser.push_line(b"garbage\r\n").is_err());
        assert!(!parser.in_progress());

        let msg = parser.push_line(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(msg.lines().len(), 1);
        assert_eq!(msg.raw(), b"250 OK\r\n");
    }

    #[test]
    fn test_unterminated_data_block_is_capped() {
        let mut parser = ReplyParser::with_max_message_len(64);
        assert!(parser.push_line(b"250+config-text=\r\n").unwrap().is_none());
        assert!(parser.push_line(b"SocksPort 9050\r\n").unwrap().is_none());

        let mut overflowed = false;
        for _ in 0..8 {
            if let Err(e) = parser.push_line(b"ControlPort 9051\r\n") {
                assert!(matches!(e, ControlError::Protocol(_)));
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
        assert!(!parser.in_progress());

        let msg = parser.push_line(b"250 OK\r\n").unwrap().unwrap();
        assert!(msg.is_ok());
    }
}
