// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fault taxonomy and broker-level errors.
//!
//! A [`Fault`] is what a failed command turns into: it travels back to the
//! caller as an `EXC` frame carrying `scErrorCode`/`scErrorText`. The
//! connection stays open. Frame decoding errors are the exception: they
//! reset the connection and never produce a reply.

use crate::config::ConfigError;
use crate::pool::PoolError;
use scmp::{HeaderKey, SequenceError};
use std::fmt;
use thiserror::Error;

/// Error family, one per failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultFamily {
    FrameDecoder,
    Validation,
    Allocation,
    Sequencing,
    Communication,
    Internal,
}

macro_rules! error_codes {
    ($($variant:ident = $code:literal, $name:literal, $family:ident;)+) => {
        /// Stable numeric error codes written to `scErrorCode`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($variant),+
        }

        impl ErrorCode {
            pub const ALL: &'static [ErrorCode] = &[$(ErrorCode::$variant),+];

            pub fn code(self) -> u16 {
                match self {
                    $(ErrorCode::$variant => $code),+
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $name),+
                }
            }

            pub fn family(self) -> FaultFamily {
                match self {
                    $(ErrorCode::$variant => FaultFamily::$family),+
                }
            }

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(ErrorCode::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

error_codes! {
    FrameDecoder = 400, "FRAME_DECODER", FrameDecoder;
    NotFound = 404, "NOT_FOUND", Allocation;
    ServiceDisabled = 405, "SERVICE_DISABLED", Allocation;
    AlreadyRegistered = 406, "ALREADY_REGISTERED", Allocation;
    SessionRejected = 407, "SESSION_REJECTED", Allocation;
    MissingAttribute = 410, "MISSING_ATTRIBUTE", Validation;
    InvalidAttribute = 411, "INVALID_ATTRIBUTE", Validation;
    UnknownMessageType = 412, "UNKNOWN_MESSAGE_TYPE", Validation;
    ServiceTypeMismatch = 413, "SERVICE_TYPE_MISMATCH", Validation;
    AlreadyConnected = 420, "ALREADY_CONNECTED", Sequencing;
    NotConnected = 421, "NOT_CONNECTED", Sequencing;
    StaleMessageId = 422, "STALE_MESSAGE_ID", Sequencing;
    ServerError = 500, "SERVER_ERROR", Internal;
    ConnectionLost = 503, "CONNECTION_LOST", Communication;
    Timeout = 504, "TIMEOUT", Communication;
    PoolExhausted = 505, "POOL_EXHAUSTED", Communication;
    KeepAliveFailed = 506, "KEEP_ALIVE_FAILED", Communication;
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A command failure, converted to an `EXC` reply by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {text}")]
pub struct Fault {
    pub code: ErrorCode,
    pub text: String,
}

impl Fault {
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn family(&self) -> FaultFamily {
        self.code.family()
    }

    pub fn is_communication(&self) -> bool {
        self.family() == FaultFamily::Communication
    }

    pub fn missing(key: HeaderKey) -> Self {
        Self::new(
            ErrorCode::MissingAttribute,
            format!("missing attribute {}", key),
        )
    }

    pub fn invalid(key: HeaderKey, value: &str) -> Self {
        Self::new(
            ErrorCode::InvalidAttribute,
            format!("invalid value {:?} for {}", value, key),
        )
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, what.to_string())
    }

    pub fn connection_lost(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionLost, text)
    }

    pub fn server_error(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, text)
    }
}

impl From<SequenceError> for Fault {
    fn from(e: SequenceError) -> Self {
        match e {
            SequenceError::Malformed(raw) => Fault::invalid(HeaderKey::MessageId, &raw),
            e @ SequenceError::Unexpected { .. } => {
                Fault::new(ErrorCode::StaleMessageId, e.to_string())
            }
        }
    }
}

impl From<PoolError> for Fault {
    fn from(e: PoolError) -> Self {
        let code = match &e {
            PoolError::Timeout { .. } => ErrorCode::Timeout,
            PoolError::Exhausted { .. } => ErrorCode::PoolExhausted,
            PoolError::KeepAlive(_) => ErrorCode::KeepAliveFailed,
            PoolError::Connect { .. }
            | PoolError::Closed
            | PoolError::PoolClosed
            | PoolError::Io(_) => ErrorCode::ConnectionLost,
        };
        Fault::new(code, e.to_string())
    }
}

/// Broker runtime errors (startup and listener).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codes_are_unique_and_roundtrip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(*code));
        }
        assert_eq!(ErrorCode::from_code(999), None);
    }

    #[test]
    fn test_families() {
        assert_eq!(ErrorCode::NotFound.family(), FaultFamily::Allocation);
        assert_eq!(ErrorCode::StaleMessageId.family(), FaultFamily::Sequencing);
        assert!(Fault::connection_lost("gone").is_communication());
        assert!(!Fault::missing(HeaderKey::SessionId).is_communication());
    }

    #[test]
    fn test_sequence_error_conversion() {
        let fault: Fault = SequenceError::Unexpected {
            expected: 3,
            actual: 2,
        }
        .into();
        assert_eq!(fault.code, ErrorCode::StaleMessageId);

        let fault: Fault = SequenceError::Malformed("x".into()).into();
        assert_eq!(fault.code, ErrorCode::InvalidAttribute);
    }

    #[test]
    fn test_pool_error_conversion() {
        let fault: Fault = PoolError::Timeout {
            op: "receive",
            after: Duration::from_millis(5),
        }
        .into();
        assert_eq!(fault.code, ErrorCode::Timeout);
        let fault: Fault = PoolError::Closed.into();
        assert_eq!(fault.code, ErrorCode::ConnectionLost);
    }

    #[test]
    fn test_display() {
        let fault = Fault::not_found("service \"x\"");
        assert_eq!(fault.to_string(), "NOT_FOUND (404): service \"x\"");
    }
}
