//! Terminal wire protocol: JSON frames exchanged over `/ws/shells/{id}` and
//! the close codes both ends agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Normal closure. Sent to a connection that was superseded by a newer one.
pub const CLOSE_NORMAL: u16 = 1000;
/// The connection sat idle past the terminal idle timeout. Clients may
/// reconnect.
pub const CLOSE_IDLE: u16 = 4000;
/// The shell no longer exists. Clients must not reconnect to it.
pub const CLOSE_SHELL_GONE: u16 = 4404;

/// How a client should treat a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Closed on purpose, nothing to do.
    Normal,
    /// The shell is gone for good; ask for a new one.
    Gone,
    /// Anything else: retry with backoff.
    Transient,
}

impl CloseKind {
    pub fn classify(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => CloseKind::Normal,
            CLOSE_SHELL_GONE => CloseKind::Gone,
            _ => CloseKind::Transient,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Server -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellFrame {
    ShellConnected {
        shell_id: String,
        session_id: String,
        timestamp: DateTime<Utc>,
        message: String,
    },
    ShellOutput {
        data: String,
        shell_id: String,
    },
}

/// Client -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ShellInput { data: String },
    ShellResize { rows: u16, cols: u16 },
}

impl ClientFrame {
    /// `None` for anything that is not one of the known JSON frames; such
    /// text is treated as raw input.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

// ---------------------------------------------------------------------------
// UTF-8 reassembly
// ---------------------------------------------------------------------------

/// Turns PTY chunks into text without splitting multi-byte characters that
/// straddle a read boundary. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Truncated sequence at the end: keep it for next time.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let leftover = rest.to_vec();
        self.pending = leftover;
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_classify() {
        assert_eq!(CloseKind::classify(4404), CloseKind::Gone);
        assert_eq!(CloseKind::classify(1000), CloseKind::Normal);
        assert_eq!(CloseKind::classify(4000), CloseKind::Transient);
        assert_eq!(CloseKind::classify(1006), CloseKind::Transient);
    }

    #[test]
    fn output_frame_shape() {
        let v = serde_json::to_value(ShellFrame::ShellOutput {
            data: "hi\r\n".into(),
            shell_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(v, serde_json::json!({"type": "shell_output", "data": "hi\r\n", "shell_id": "abc"}));
    }

    #[test]
    fn client_frames_parse() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"shell_input","data":"echo hi\n"}"#),
            Some(ClientFrame::ShellInput {
                data: "echo hi\n".into()
            })
        );
        assert_eq!(
            ClientFrame::parse(r#"{"type":"shell_resize","rows":40,"cols":120}"#),
            Some(ClientFrame::ShellResize { rows: 40, cols: 120 })
        );
        assert_eq!(ClientFrame::parse("ls -la\n"), None);
        assert_eq!(ClientFrame::parse(r#"{"type":"unknown"}"#), None);
    }

    #[test]
    fn decoder_joins_split_characters() {
        let bytes = "héllo €".as_bytes();
        let mut dec = Utf8Decoder::default();
        let mut text = String::new();
        for b in bytes {
            text.push_str(&dec.decode(std::slice::from_ref(b)));
        }
        assert_eq!(text, "héllo €");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.decode(b"a\xffb"), "a\u{fffd}b");
    }
}
