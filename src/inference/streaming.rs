//! Streaming output
//!
//! Events produced by a query, the sink they are pushed into, and the UTF-8
//! assembly that turns raw token bytes into text fragments.

use tokio::sync::mpsc;

use crate::error::ServiceError;

/// Marker sent when the session pauses for more user input
pub const EOI_MARKER: &str = "[EOI]";
/// Marker sent when generation concludes
pub const EOT_MARKER: &str = "[end of text]";
/// Marker sent at a turn boundary in instruct mode
pub const INSTRUCT_EOT_MARKER: &str = "[instruct][end of text]";

/// Represents one item of a query's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text of one produced token
    Token(String),
    /// Session paused; the follow-up arrives as a new query
    EndOfInteraction,
    /// Generation naturally concluded
    EndOfText,
    /// End of a turn in instruct mode; the stream stays open
    InstructEndOfText,
    /// The query failed after streaming started
    Error(String),
}

impl StreamEvent {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamEvent::Token(_))
    }

    /// Returns true for the three control markers
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            StreamEvent::EndOfInteraction | StreamEvent::EndOfText | StreamEvent::InstructEndOfText
        )
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamEvent::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Text carried on the wire for this event
    pub fn message(&self) -> &str {
        match self {
            StreamEvent::Token(s) | StreamEvent::Error(s) => s,
            StreamEvent::EndOfInteraction => EOI_MARKER,
            StreamEvent::EndOfText => EOT_MARKER,
            StreamEvent::InstructEndOfText => INSTRUCT_EOT_MARKER,
        }
    }
}

/// Receives the output of a query in generation order.
pub trait TokenSink {
    /// Delivers one event. An error ends the query.
    fn emit(&mut self, event: StreamEvent) -> Result<(), ServiceError>;
}

impl TokenSink for Vec<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) -> Result<(), ServiceError> {
        self.push(event);
        Ok(())
    }
}

/// Bounded channel into the transport.
///
/// Must be used from a plain thread: `emit` blocks while the channel is full.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Best-effort error report after a failed query
    pub fn report(&self, error: &ServiceError) {
        let _ = self.tx.blocking_send(StreamEvent::Error(error.to_string()));
    }
}

impl TokenSink for ChannelSink {
    fn emit(&mut self, event: StreamEvent) -> Result<(), ServiceError> {
        self.tx.blocking_send(event).map_err(|_| {
            tracing::debug!("Receiver dropped, stopping generation");
            ServiceError::Delivery
        })
    }
}

/// Joins token bytes into valid UTF-8 fragments.
///
/// A multibyte character split across tokens is held back until its last
/// byte arrives.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds token bytes, returning whatever text is complete
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let ready = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // incomplete sequence at the end
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => return self.flush(),
        };

        let text: Vec<u8> = self.pending.drain(..ready).collect();
        non_empty(String::from_utf8_lossy(&text).into_owned())
    }

    /// Emits anything still buffered, replacing broken sequences
    pub fn flush(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        non_empty(text)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_variants() {
        let token = StreamEvent::Token("hello".to_string());
        assert!(token.is_token());
        assert!(!token.is_control());
        assert_eq!(token.as_token(), Some("hello"));
        assert_eq!(token.message(), "hello");

        assert!(StreamEvent::EndOfInteraction.is_control());
        assert_eq!(StreamEvent::EndOfInteraction.message(), "[EOI]");
        assert_eq!(StreamEvent::EndOfText.message(), "[end of text]");
        assert_eq!(
            StreamEvent::InstructEndOfText.message(),
            "[instruct][end of text]"
        );

        let error = StreamEvent::Error("boom".to_string());
        assert!(!error.is_token());
        assert!(!error.is_control());
        assert_eq!(error.as_token(), None);
    }

    #[test]
    fn test_utf8_split_character() {
        // "é" = C3 A9
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"caf"), Some("caf".to_string()));
        assert_eq!(assembler.push(&[0xC3]), None);
        assert!(assembler.has_pending());
        assert_eq!(assembler.push(&[0xA9, b'!']), Some("é!".to_string()));
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_utf8_keeps_valid_prefix() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[b'a', 0xE2, 0x82]), Some("a".to_string()));
        assert_eq!(assembler.push(&[0xAC]), Some("€".to_string()));
    }

    #[test]
    fn test_utf8_invalid_bytes_are_replaced() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[0xFF, b'x']), Some("\u{FFFD}x".to_string()));
    }

    #[test]
    fn test_flush_incomplete() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[0xF0, 0x9F]), None);
        assert_eq!(assembler.flush(), Some("\u{FFFD}".to_string()));
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn test_vec_sink_collects_in_order() {
        let mut sink: Vec<StreamEvent> = Vec::new();
        sink.emit(StreamEvent::Token("a".to_string())).unwrap();
        sink.emit(StreamEvent::EndOfText).unwrap();
        assert_eq!(
            sink,
            vec![StreamEvent::Token("a".to_string()), StreamEvent::EndOfText]
        );
    }

    #[test]
    fn test_channel_sink_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        assert_eq!(
            sink.emit(StreamEvent::EndOfText),
            Err(ServiceError::Delivery)
        );
    }
}
