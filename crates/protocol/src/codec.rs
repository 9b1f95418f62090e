//! Newline-delimited framing for protocol messages.

use crate::message::{Envelope, MalformedMessage, Message};
use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Maximum accepted line length (16MB).
///
/// Longer lines are discarded up to the next newline and surfaced as
/// [`MalformedMessage::TooLong`].
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// One decoded unit from the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    /// A unit that failed validation. The stream stays usable.
    Malformed(MalformedMessage),
}

/// Codec turning a byte stream into [`Frame`]s and [`Message`]s into lines.
///
/// Decoding never fails on bad input: anything that is not a valid message
/// becomes [`Frame::Malformed`], so a single bad line cannot end a
/// `FramedRead` stream.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    lines: LinesCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn frame(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Option<Frame>>, io::Error> {
        match result {
            Ok(Some(line)) if line.trim().is_empty() => Ok(Some(None)),
            Ok(Some(line)) => Ok(Some(Some(match Message::parse(&line) {
                Ok(message) => Frame::Message(message),
                Err(e) => Frame::Malformed(e),
            }))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Ok(Some(Some(Frame::Malformed(MalformedMessage::TooLong))))
            }
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(
                Some(Frame::Malformed(MalformedMessage::Json(e.to_string()))),
            )),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            match Self::frame(self.lines.decode(src))? {
                Some(Some(frame)) => return Ok(Some(frame)),
                // blank line
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            match Self::frame(self.lines.decode_eof(src))? {
                Some(Some(frame)) => return Ok(Some(frame)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        let envelope = Envelope::from(message);
        serde_json::to_writer(BufMut::writer(&mut *dst), &envelope).map_err(io::Error::from)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}
