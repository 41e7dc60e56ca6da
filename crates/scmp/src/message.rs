// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SCMP message model.

use crate::header::{Header, HeaderKey};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

macro_rules! message_types {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// Message type carried in the `msgType` attribute.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant),+
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(MessageType::$variant => $wire),+
                }
            }
        }

        impl FromStr for MessageType {
            type Err = UnknownMessageType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(MessageType::$variant),)+
                    other => Err(UnknownMessageType(other.to_string())),
                }
            }
        }
    };
}

message_types! {
    Attach => "ATTACH",
    Detach => "DETACH",
    CreateSession => "CREATE_SESSION",
    DeleteSession => "DELETE_SESSION",
    ClnData => "CLN_DATA",
    Echo => "ECHO",
    Subscribe => "SUBSCRIBE",
    ChangeSubscription => "CHANGE_SUBSCRIPTION",
    Unsubscribe => "UNSUBSCRIBE",
    Manage => "MANAGE",
    Inspect => "INSPECT",
    RegisterService => "REGISTER_SERVICE",
    DeregisterService => "DEREGISTER_SERVICE",
    Publish => "PUBLISH",
    SrvCreateSession => "SRV_CREATE_SESSION",
    SrvDeleteSession => "SRV_DELETE_SESSION",
    SrvAbortSession => "SRV_ABORT_SESSION",
    SrvData => "SRV_DATA",
    SrvEcho => "SRV_ECHO",
    SrvSubscribe => "SRV_SUBSCRIBE",
    SrvChangeSubscription => "SRV_CHANGE_SUBSCRIPTION",
    SrvUnsubscribe => "SRV_UNSUBSCRIBE",
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a `msgType` value is not a known message type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown message type {0:?}")]
pub struct UnknownMessageType(pub String);

/// Frame kind, the three-letter token that opens every headline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Request,
    Response,
    Fault,
    PartRequest,
    PartResponse,
    KeepAliveRequest,
    KeepAliveResponse,
}

impl FrameKind {
    pub const ALL: [FrameKind; 7] = [
        FrameKind::Request,
        FrameKind::Response,
        FrameKind::Fault,
        FrameKind::PartRequest,
        FrameKind::PartResponse,
        FrameKind::KeepAliveRequest,
        FrameKind::KeepAliveResponse,
    ];

    pub fn token(self) -> &'static [u8; 3] {
        match self {
            FrameKind::Request => b"REQ",
            FrameKind::Response => b"RES",
            FrameKind::Fault => b"EXC",
            FrameKind::PartRequest => b"PRQ",
            FrameKind::PartResponse => b"PRS",
            FrameKind::KeepAliveRequest => b"KRQ",
            FrameKind::KeepAliveResponse => b"KRS",
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.token() == token)
    }

    pub fn is_reply(self) -> bool {
        matches!(
            self,
            FrameKind::Response
                | FrameKind::Fault
                | FrameKind::PartResponse
                | FrameKind::KeepAliveResponse
        )
    }

    pub fn is_part(self) -> bool {
        matches!(self, FrameKind::PartRequest | FrameKind::PartResponse)
    }
}

/// One logical SCMP message: header attributes, opaque body and flags.
///
/// Part frames produced by [`crate::large::split_message`] are also
/// `Message`s with `part == true`; callers of the connection-level API only
/// ever see reassembled messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Vec<u8>,
    pub reply: bool,
    pub part: bool,
    pub fault: bool,
    pub keep_alive: bool,
}

impl Message {
    /// New request of the given type.
    pub fn request(msg_type: MessageType) -> Self {
        let mut header = Header::new();
        header.set(HeaderKey::MsgType, msg_type.as_str());
        Self {
            header,
            ..Default::default()
        }
    }

    /// Empty reply to `request`, echoing its type, message id and session id.
    pub fn reply_to(request: &Message) -> Self {
        let mut header = Header::new();
        for key in [HeaderKey::MsgType, HeaderKey::MessageId, HeaderKey::SessionId] {
            if let Some(value) = request.header.get(key) {
                header.set(key, value);
            }
        }
        Self {
            header,
            reply: true,
            ..Default::default()
        }
    }

    pub fn keep_alive_request() -> Self {
        Self {
            keep_alive: true,
            ..Default::default()
        }
    }

    pub fn keep_alive_response() -> Self {
        Self {
            keep_alive: true,
            reply: true,
            ..Default::default()
        }
    }

    /// Frame kind implied by the flags.
    pub fn kind(&self) -> FrameKind {
        if self.keep_alive {
            if self.reply {
                FrameKind::KeepAliveResponse
            } else {
                FrameKind::KeepAliveRequest
            }
        } else if self.fault {
            FrameKind::Fault
        } else if self.part {
            if self.reply {
                FrameKind::PartResponse
            } else {
                FrameKind::PartRequest
            }
        } else if self.reply {
            FrameKind::Response
        } else {
            FrameKind::Request
        }
    }

    /// Flags implied by a frame kind.
    pub fn with_kind(mut self, kind: FrameKind) -> Self {
        self.reply = kind.is_reply();
        self.part = kind.is_part();
        self.fault = kind == FrameKind::Fault;
        self.keep_alive = matches!(
            kind,
            FrameKind::KeepAliveRequest | FrameKind::KeepAliveResponse
        );
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, key: HeaderKey, value: impl Into<String>) -> Self {
        self.header.set(key, value);
        self
    }

    /// Parsed `msgType`. `None` when absent, `Some(Err)` when unknown.
    pub fn message_type(&self) -> Option<Result<MessageType, UnknownMessageType>> {
        self.header.get(HeaderKey::MsgType).map(str::parse)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.header.get(HeaderKey::ServiceName)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.header.get(HeaderKey::SessionId)
    }

    /// Raw `messageId` attribute.
    pub fn message_id(&self) -> Option<&str> {
        self.header.get(HeaderKey::MessageId)
    }

    pub fn set_message_id(&mut self, id: u64) {
        self.header.set(HeaderKey::MessageId, id.to_string());
    }
}
