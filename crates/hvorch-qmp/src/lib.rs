//! QEMU Machine Protocol (QMP) types for hvorch.
//!
//! This crate defines the wire protocol spoken with a QEMU process started
//! with `-qmp stdio`. Every message is a single JSON object terminated by a
//! newline (QEMU emits `\r\n`).
//!
//! ```text
//! host  -> qemu : {"execute": "qmp_capabilities"}\n
//! qemu  -> host : {"return": {}}\r\n
//! qemu  -> host : {"event": "RESET", "data": {...}, "timestamp": {...}}\r\n
//! ```
//!
//! Messages coming back from QEMU are one of four shapes (greeting, command
//! return, command error, asynchronous event), modelled by [`Message`].

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum accepted line length (16 MB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Snapshot tag reserved for suspend-to-disk images.
pub const SUSPEND_TAG: &str = "suspend";

/// Prefix reserved for user snapshot tags, so they never collide with [`SUSPEND_TAG`].
pub const SNAPSHOT_TAG_PREFIX: char = '@';

/// Build the QEMU-side tag for the user snapshot with the given index.
pub fn snapshot_tag(index: u32) -> String {
    format!("{}s{}", SNAPSHOT_TAG_PREFIX, index)
}

// ============================================================================
// Host -> QEMU
// ============================================================================

/// A QMP command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub execute: String,
    /// Optional command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Optional correlation id echoed back in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Command {
    /// Create a command without arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
            id: None,
        }
    }

    /// Attach arguments.
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Leave capabilities negotiation mode. Must be the first command sent.
    pub fn capabilities() -> Self {
        Self::new("qmp_capabilities")
    }

    /// ACPI power button press.
    pub fn system_powerdown() -> Self {
        Self::new("system_powerdown")
    }

    /// Hard reset of the guest.
    pub fn system_reset() -> Self {
        Self::new("system_reset")
    }

    /// Terminate QEMU immediately.
    pub fn quit() -> Self {
        Self::new("quit")
    }

    /// Pause guest execution.
    pub fn stop() -> Self {
        Self::new("stop")
    }

    /// Resume guest execution.
    pub fn cont() -> Self {
        Self::new("cont")
    }

    /// Query run state.
    pub fn query_status() -> Self {
        Self::new("query-status")
    }

    /// Run a human monitor (HMP) command line, e.g. `savevm suspend`.
    pub fn human_monitor(command_line: impl Into<String>) -> Self {
        Self::new("human-monitor-command").with_arguments(serde_json::json!({
            "command-line": command_line.into()
        }))
    }

    /// Save the full VM state under `tag`.
    pub fn savevm(tag: &str) -> Self {
        Self::human_monitor(format!("savevm {}", tag))
    }

    /// Load VM state saved under `tag`.
    pub fn loadvm(tag: &str) -> Self {
        Self::human_monitor(format!("loadvm {}", tag))
    }

    /// Delete VM state saved under `tag`.
    pub fn delvm(tag: &str) -> Self {
        Self::human_monitor(format!("delvm {}", tag))
    }
}

// ============================================================================
// QEMU -> Host
// ============================================================================

/// Greeting sent by QEMU when the monitor is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    /// QEMU version information.
    pub version: Value,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Error payload of a failed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmpError {
    /// Error class, e.g. `GenericError`.
    pub class: String,
    /// Human readable description.
    pub desc: String,
}

impl std::fmt::Display for QmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

/// Event timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub seconds: i64,
    /// Microseconds part.
    pub microseconds: i64,
}

/// Any message QEMU may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Initial greeting.
    Greeting {
        /// Greeting body.
        #[serde(rename = "QMP")]
        qmp: Greeting,
    },

    /// Successful command completion.
    Return {
        /// Return value (often `{}`).
        #[serde(rename = "return")]
        value: Value,
        /// Correlation id, if the command had one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Failed command.
    Error {
        /// Error payload.
        error: QmpError,
        /// Correlation id, if the command had one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Asynchronous event.
    Event {
        /// Event name, e.g. `RESET`.
        event: String,
        /// Event payload.
        #[serde(default)]
        data: Value,
        /// When the event was emitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
}

impl Message {
    /// The event kind, if this message is an event.
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            Message::Event { event, .. } => Some(EventKind::from_name(event)),
            _ => None,
        }
    }

    /// Correlation id of a reply; `None` for events and unnumbered replies.
    pub fn reply_id(&self) -> Option<u64> {
        match self {
            Message::Return { id, .. } | Message::Error { id, .. } => *id,
            _ => None,
        }
    }
}

/// Events the lifecycle layer reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Guest reset (reboot).
    Reset,
    /// ACPI power button pressed.
    Powerdown,
    /// Guest shut down.
    Shutdown,
    /// Guest execution paused.
    Stop,
    /// Guest execution resumed.
    Resume,
    /// Anything else.
    Other(String),
}

impl EventKind {
    /// Map a QMP event name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "RESET" => EventKind::Reset,
            "POWERDOWN" => EventKind::Powerdown,
            "SHUTDOWN" => EventKind::Shutdown,
            "STOP" => EventKind::Stop,
            "RESUME" => EventKind::Resume,
            other => EventKind::Other(other.to_string()),
        }
    }
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a command to wire format (JSON followed by a newline).
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(cmd)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line of QMP output.
pub fn decode_line(line: &[u8]) -> Result<Message, DecodeError> {
    if line.len() > MAX_LINE_SIZE {
        return Err(DecodeError::TooLarge(line.len()));
    }

    let trimmed = trim_ascii(line);
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    serde_json::from_slice(trimmed).map_err(DecodeError::Json)
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &data[start..end]
}

/// Incremental decoder for a QMP byte stream.
///
/// QEMU may split or merge lines across reads; feed whatever was read and
/// collect the complete messages.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning one result per complete non-empty line.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Message, DecodeError>> {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            match decode_line(&line) {
                Err(DecodeError::Empty) => {}
                other => out.push(other),
            }
        }

        if self.buf.len() > MAX_LINE_SIZE {
            let len = self.buf.len();
            tracing::warn!(len, "discarding oversized QMP line");
            self.buf.clear();
            out.push(Err(DecodeError::TooLarge(len)));
        }

        out
    }

    /// Bytes buffered waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Error decoding a QMP line.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Line was blank.
    #[error("empty line")]
    Empty,
    /// Line exceeds [`MAX_LINE_SIZE`].
    #[error("line too large: {0} bytes")]
    TooLarge(usize),
    /// JSON parse error.
    #[error("JSON decode error: {0}")]
    Json(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_is_newline_terminated() {
        let encoded = encode_command(&Command::capabilities()).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        let text = String::from_utf8(encoded).unwrap();
        assert_eq!(text.trim(), r#"{"execute":"qmp_capabilities"}"#);
    }

    #[test]
    fn test_savevm_uses_human_monitor() {
        let cmd = Command::savevm(SUSPEND_TAG);
        assert_eq!(cmd.execute, "human-monitor-command");
        assert_eq!(
            cmd.arguments.unwrap()["command-line"],
            serde_json::json!("savevm suspend")
        );
    }

    #[test]
    fn test_decode_greeting() {
        let line = br#"{"QMP": {"version": {"qemu": {"major": 8}}, "capabilities": ["oob"]}}"#;
        let msg = decode_line(line).unwrap();
        assert!(matches!(msg, Message::Greeting { .. }));
    }

    #[test]
    fn test_decode_return_and_error() {
        let ok = decode_line(b"{\"return\": {}, \"id\": 7}\r\n").unwrap();
        assert_eq!(
            ok,
            Message::Return {
                value: serde_json::json!({}),
                id: Some(7)
            }
        );

        let err = decode_line(br#"{"error": {"class": "GenericError", "desc": "no such tag"}}"#)
            .unwrap();
        match err {
            Message::Error { error, .. } => {
                assert_eq!(error.class, "GenericError");
                assert!(error.to_string().contains("no such tag"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_reply_id() {
        let numbered = decode_line(br#"{"return":"","id":12}"#).unwrap();
        assert_eq!(numbered.reply_id(), Some(12));
        let failed =
            decode_line(br#"{"error":{"class":"GenericError","desc":"x"},"id":3}"#).unwrap();
        assert_eq!(failed.reply_id(), Some(3));
        let plain = decode_line(br#"{"return":{}}"#).unwrap();
        assert_eq!(plain.reply_id(), None);
        let event = decode_line(br#"{"event":"STOP"}"#).unwrap();
        assert_eq!(event.reply_id(), None);
    }

    #[test]
    fn test_decode_event_kind() {
        let msg = decode_line(
            br#"{"event": "RESET", "data": {"guest": true}, "timestamp": {"seconds": 1, "microseconds": 2}}"#,
        )
        .unwrap();
        assert_eq!(msg.event_kind(), Some(EventKind::Reset));

        let msg = decode_line(br#"{"event": "BLOCK_JOB_READY", "data": {}}"#).unwrap();
        assert_eq!(
            msg.event_kind(),
            Some(EventKind::Other("BLOCK_JOB_READY".to_string()))
        );
    }

    #[test]
    fn test_decode_empty_line() {
        assert!(matches!(decode_line(b"  \r\n"), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_line_decoder_handles_split_reads() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(br#"{"event": "SHUT"#).is_empty());
        assert!(decoder.pending() > 0);

        let out = decoder.feed(b"DOWN\"}\r\n\r\n{\"return\": {}}\r\n");
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].as_ref().unwrap().event_kind(),
            Some(EventKind::Shutdown)
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_snapshot_tag_never_collides_with_suspend() {
        assert_eq!(snapshot_tag(3), "@s3");
        assert_ne!(snapshot_tag(0), SUSPEND_TAG);
    }
}
