// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Header attributes.
//!
//! The header block of a frame is a list of `key=value` lines drawn from a
//! closed set of attribute keys. Insertion order is kept so that a decoded
//! frame re-encodes to the same bytes.

use crate::error::FrameDecoderError;

macro_rules! header_keys {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// Enumerated header attribute keys.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum HeaderKey {
            $($variant),+
        }

        impl HeaderKey {
            /// Every known key, in declaration order.
            pub const ALL: &'static [HeaderKey] = &[$(HeaderKey::$variant),+];

            /// Name used on the wire.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(HeaderKey::$variant => $wire),+
                }
            }

            /// Look up a key by its wire name.
            pub fn from_wire(name: &str) -> Option<Self> {
                match name {
                    $($wire => Some(HeaderKey::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

header_keys! {
    ServiceName => "serviceName",
    SessionId => "sessionId",
    MessageId => "messageId",
    MsgType => "msgType",
    ScErrorCode => "scErrorCode",
    ScErrorText => "scErrorText",
    KeepAliveTimeout => "keepAliveTimeout",
    KeepAliveInterval => "keepAliveInterval",
    IpAddressList => "ipAddressList",
    BodyType => "bodyType",
    EchoInterval => "echoInterval",
    EchoTimeout => "echoTimeout",
    Mask => "mask",
    SessionInfo => "sessionInfo",
    MaxSessions => "maxSessions",
    MaxConnections => "maxConnections",
    PortNr => "portNr",
    ServiceType => "serviceType",
    MaskLength => "maskLength",
    Reject => "reject",
    AppErrorCode => "appErrorCode",
    AppErrorText => "appErrorText",
}

impl std::fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered attribute bag of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(HeaderKey, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set(&mut self, key: HeaderKey, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: HeaderKey) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: HeaderKey) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: HeaderKey) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (HeaderKey, &str)> {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as `key=value\n` lines.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), FrameDecoderError> {
        for (key, value) in &self.entries {
            if value.contains('\n') {
                return Err(FrameDecoderError::FieldOverflow(format!(
                    "line break in value of {}",
                    key
                )));
            }
            buf.extend_from_slice(key.as_str().as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_bytes());
            buf.push(b'\n');
        }
        Ok(())
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 2)
            .sum()
    }

    /// Parse a header block. Every line must be `key=value` and end with `\n`.
    pub fn decode(block: &[u8]) -> Result<Self, FrameDecoderError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| FrameDecoderError::MalformedHeader("not valid UTF-8".into()))?;

        let mut header = Header::new();
        if text.is_empty() {
            return Ok(header);
        }
        let Some(body) = text.strip_suffix('\n') else {
            return Err(FrameDecoderError::MalformedHeader(
                "header block not terminated by a line break".into(),
            ));
        };

        for line in body.split('\n') {
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| FrameDecoderError::MalformedHeader(line.to_string()))?;
            let key = HeaderKey::from_wire(name)
                .ok_or_else(|| FrameDecoderError::UnknownAttribute(name.to_string()))?;
            if header.contains(key) {
                return Err(FrameDecoderError::DuplicateAttribute(key.as_str()));
            }
            header.entries.push((key, value.to_string()));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_roundtrip() {
        for key in HeaderKey::ALL {
            assert_eq!(HeaderKey::from_wire(key.as_str()), Some(*key));
        }
        assert_eq!(HeaderKey::from_wire("nope"), None);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut h = Header::new();
        h.set(HeaderKey::ServiceName, "a");
        h.set(HeaderKey::SessionId, "s1");
        h.set(HeaderKey::ServiceName, "b");

        let keys: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![HeaderKey::ServiceName, HeaderKey::SessionId]);
        assert_eq!(h.get(HeaderKey::ServiceName), Some("b"));
    }

    #[test]
    fn test_encode_decode_preserves_order() {
        let mut h = Header::new();
        h.set(HeaderKey::MsgType, "CLN_DATA");
        h.set(HeaderKey::SessionId, "abc");
        h.set(HeaderKey::SessionInfo, "k=v;x=y");

        let mut buf = Vec::new();
        h.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), h.encoded_len());
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            "msgType=CLN_DATA\nsessionId=abc\nsessionInfo=k=v;x=y\n"
        );

        let back = Header::decode(&buf).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Header::decode(b"serviceName\n"),
            Err(FrameDecoderError::MalformedHeader(_))
        ));
        assert!(matches!(
            Header::decode(b"bogus=1\n"),
            Err(FrameDecoderError::UnknownAttribute(_))
        ));
        assert!(matches!(
            Header::decode(b"mask=a\nmask=b\n"),
            Err(FrameDecoderError::DuplicateAttribute("mask"))
        ));
        assert!(matches!(
            Header::decode(b"mask=a"),
            Err(FrameDecoderError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_encode_rejects_line_break() {
        let mut h = Header::new();
        h.set(HeaderKey::SessionInfo, "a\nb");
        let mut buf = Vec::new();
        assert!(h.encode_into(&mut buf).is_err());
    }
}
