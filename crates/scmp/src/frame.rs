// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SCMP frame codec.
//!
//! Every frame starts with a fixed-width ASCII headline:
//!
//! ```text
//! +-----+---+--------+---+-----------+---+-----+----+
//! | KEY | ' '| HHHHHH | ' '| MMMMMMMMM | ' '| 1.0 | \n |
//! +-----+---+--------+---+-----------+---+-----+----+
//!   0..3  3    4..10   10    11..20    20  21..24  24
//! ```
//!
//! `HHHHHH` is the header block size and `MMMMMMMMM` the message size
//! (header block + body), both zero-padded decimal. The header block holds
//! `key=value\n` lines and the body is the remaining bytes.
//!
//! Decoding is all-or-nothing: a malformed frame never yields a partially
//! populated [`Message`].

use crate::error::FrameDecoderError;
use crate::header::Header;
use crate::message::{FrameKind, Message};

/// Headline length in bytes.
pub const HEADLINE_SIZE: usize = 25;

/// Protocol version written into every headline.
pub const PROTOCOL_VERSION: &[u8; 3] = b"1.0";

/// Default upper bound on a single frame's message size (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const KEY_RANGE: std::ops::Range<usize> = 0..3;
const HEADER_SIZE_RANGE: std::ops::Range<usize> = 4..10;
const MESSAGE_SIZE_RANGE: std::ops::Range<usize> = 11..20;
const VERSION_RANGE: std::ops::Range<usize> = 21..24;
const SEPARATORS: [usize; 3] = [3, 10, 20];

const HEADER_SIZE_DIGITS: usize = 6;
const MESSAGE_SIZE_DIGITS: usize = 9;
const MAX_HEADER_SIZE: usize = 999_999;
const MAX_FIELD_MESSAGE_SIZE: usize = 999_999_999;

/// Sizes declared by a headline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headline {
    pub kind: FrameKind,
    pub header_size: usize,
    pub message_size: usize,
}

impl Headline {
    /// Total frame length: headline plus message.
    pub fn frame_size(&self) -> usize {
        HEADLINE_SIZE + self.message_size
    }
}

fn parse_digits(field: &[u8], name: &'static str) -> Result<usize, FrameDecoderError> {
    let mut value = 0usize;
    for b in field {
        if !b.is_ascii_digit() {
            return Err(FrameDecoderError::InvalidSizeField { field: name });
        }
        value = value * 10 + usize::from(b - b'0');
    }
    Ok(value)
}

/// Parse and validate the headline at the start of `buf`.
pub fn parse_headline(buf: &[u8], max_message_size: usize) -> Result<Headline, FrameDecoderError> {
    if buf.len() < HEADLINE_SIZE {
        return Err(FrameDecoderError::Incomplete {
            needed: HEADLINE_SIZE,
            available: buf.len(),
        });
    }

    let key = &buf[KEY_RANGE];
    let kind = FrameKind::from_token(key).ok_or_else(|| {
        FrameDecoderError::UnknownKey(String::from_utf8_lossy(key).into_owned())
    })?;

    for offset in SEPARATORS {
        if buf[offset] != b' ' {
            return Err(FrameDecoderError::MalformedHeadline(offset));
        }
    }
    if buf[HEADLINE_SIZE - 1] != b'\n' {
        return Err(FrameDecoderError::MalformedHeadline(HEADLINE_SIZE - 1));
    }

    let header_size = parse_digits(&buf[HEADER_SIZE_RANGE], "header size")?;
    let message_size = parse_digits(&buf[MESSAGE_SIZE_RANGE], "message size")?;

    let version = &buf[VERSION_RANGE];
    if version != PROTOCOL_VERSION {
        return Err(FrameDecoderError::UnsupportedVersion(
            String::from_utf8_lossy(version).into_owned(),
        ));
    }

    if header_size > message_size {
        return Err(FrameDecoderError::HeaderTooLarge {
            header: header_size,
            message: message_size,
        });
    }
    if message_size > max_message_size {
        return Err(FrameDecoderError::TooLarge {
            size: message_size,
            max: max_message_size,
        });
    }

    Ok(Headline {
        kind,
        header_size,
        message_size,
    })
}

/// Inspect only the headline and return the full frame size
/// (headline + message size).
pub fn parse_frame_size(buf: &[u8]) -> Result<usize, FrameDecoderError> {
    parse_headline(buf, DEFAULT_MAX_MESSAGE_SIZE).map(|h| h.frame_size())
}

/// Encode a single frame. Bodies are written as-is; splitting of large
/// messages happens in [`crate::large::split_message`].
pub fn encode(msg: &Message) -> Result<Vec<u8>, FrameDecoderError> {
    let header_size = msg.header.encoded_len();
    let message_size = header_size + msg.body.len();

    if header_size > MAX_HEADER_SIZE {
        return Err(FrameDecoderError::FieldOverflow(format!(
            "header block of {} bytes",
            header_size
        )));
    }
    if message_size > MAX_FIELD_MESSAGE_SIZE {
        return Err(FrameDecoderError::FieldOverflow(format!(
            "message of {} bytes",
            message_size
        )));
    }

    let mut frame = Vec::with_capacity(HEADLINE_SIZE + message_size);
    frame.extend_from_slice(msg.kind().token());
    frame.push(b' ');
    frame.extend_from_slice(
        format!("{:0width$}", header_size, width = HEADER_SIZE_DIGITS).as_bytes(),
    );
    frame.push(b' ');
    frame.extend_from_slice(
        format!("{:0width$}", message_size, width = MESSAGE_SIZE_DIGITS).as_bytes(),
    );
    frame.push(b' ');
    frame.extend_from_slice(PROTOCOL_VERSION);
    frame.push(b'\n');
    msg.header.encode_into(&mut frame)?;
    frame.extend_from_slice(&msg.body);

    debug_assert_eq!(frame.len(), HEADLINE_SIZE + message_size);
    Ok(frame)
}

/// Decode exactly one frame. `frame` must be the complete frame: its length
/// has to equal the headline's declared size.
pub fn decode(frame: &[u8], max_message_size: usize) -> Result<Message, FrameDecoderError> {
    let headline = parse_headline(frame, max_message_size)?;
    let total = headline.frame_size();
    if frame.len() != total {
        return Err(FrameDecoderError::Incomplete {
            needed: total,
            available: frame.len(),
        });
    }

    let header_end = HEADLINE_SIZE + headline.header_size;
    let header = Header::decode(&frame[HEADLINE_SIZE..header_end])?;
    let body = frame[header_end..].to_vec();

    Ok(Message {
        header,
        body,
        ..Default::default()
    }
    .with_kind(headline.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderKey;
    use crate::message::MessageType;

    fn sample() -> Message {
        Message::request(MessageType::ClnData)
            .with_header(HeaderKey::SessionId, "abc")
            .with_header(HeaderKey::MessageId, "3")
            .with_body(b"hello".to_vec())
    }

    #[test]
    fn test_headline_layout() {
        let frame = encode(&sample()).unwrap();
        let headline = std::str::from_utf8(&frame[..HEADLINE_SIZE]).unwrap();
        // msgType=CLN_DATA\n (17) + sessionId=abc\n (14) + messageId=3\n (12)
        assert_eq!(headline, "REQ 000043 000000048 1.0\n");
        assert_eq!(parse_frame_size(&frame).unwrap(), frame.len());
    }

    #[test]
    fn test_encode_decode() {
        let msg = sample();
        let frame = encode(&msg).unwrap();
        let back = decode(&frame, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(back, msg);
        assert_eq!(encode(&back).unwrap(), frame);
    }

    #[test]
    fn test_empty_message() {
        let msg = Message::keep_alive_request();
        let frame = encode(&msg).unwrap();
        assert_eq!(frame, b"KRQ 000000 000000000 1.0\n");
        assert_eq!(decode(&frame, 0).unwrap(), msg);
    }

    #[test]
    fn test_rejects_unknown_key() {
        let mut frame = encode(&sample()).unwrap();
        frame[..3].copy_from_slice(b"ZZZ");
        assert!(matches!(
            parse_frame_size(&frame),
            Err(FrameDecoderError::UnknownKey(k)) if k == "ZZZ"
        ));
    }

    #[test]
    fn test_rejects_non_digit_sizes() {
        let mut frame = encode(&sample()).unwrap();
        frame[6] = b'x';
        assert!(matches!(
            parse_frame_size(&frame),
            Err(FrameDecoderError::InvalidSizeField { field: "header size" })
        ));

        let mut frame = encode(&sample()).unwrap();
        frame[15] = b' ';
        assert!(matches!(
            parse_frame_size(&frame),
            Err(FrameDecoderError::InvalidSizeField { field: "message size" })
        ));
    }

    #[test]
    fn test_rejects_short_headline() {
        assert!(matches!(
            parse_frame_size(b"REQ 0000"),
            Err(FrameDecoderError::Incomplete { needed: 25, available: 8 })
        ));
    }

    #[test]
    fn test_rejects_header_larger_than_message() {
        let frame = b"REQ 000010 000000005 1.0\n";
        assert!(matches!(
            parse_frame_size(frame),
            Err(FrameDecoderError::HeaderTooLarge { header: 10, message: 5 })
        ));
    }

    #[test]
    fn test_rejects_bad_version() {
        let frame = b"REQ 000000 000000000 2.0\n";
        assert!(matches!(
            parse_frame_size(frame),
            Err(FrameDecoderError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_decode_length_mismatch_fails_closed() {
        let mut frame = encode(&sample()).unwrap();
        frame.push(b'!');
        assert!(decode(&frame, DEFAULT_MAX_MESSAGE_SIZE).is_err());
        frame.truncate(frame.len() - 2);
        assert!(decode(&frame, DEFAULT_MAX_MESSAGE_SIZE).is_err());
    }

    #[test]
    fn test_decode_respects_max_size() {
        let frame = encode(&sample()).unwrap();
        assert!(matches!(
            decode(&frame, 10),
            Err(FrameDecoderError::TooLarge { size: 48, max: 10 })
        ));
    }

    #[test]
    fn test_fault_and_part_keys() {
        let fault = Message::reply_to(&sample()).with_kind(FrameKind::Fault);
        assert_eq!(&encode(&fault).unwrap()[..3], b"EXC");

        let part = sample().with_kind(FrameKind::PartRequest);
        assert_eq!(&encode(&part).unwrap()[..3], b"PRQ");
    }
}
