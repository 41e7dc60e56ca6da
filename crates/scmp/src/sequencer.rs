// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session message id sequencing.
//!
//! One counter per session (or per connection for exchanges that happen
//! before a session exists). Every top-level exchange takes the next id;
//! part frames of the same exchange reuse it. There is no ordering across
//! sessions.

use thiserror::Error;

/// Why an inbound message id was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// `messageId` is not a decimal number.
    #[error("malformed message id {0:?}")]
    Malformed(String),
    /// Id differs from the next expected value.
    #[error("stale message id {actual} (expected {expected})")]
    Unexpected { expected: u64, actual: u64 },
}

/// Monotonic message id counter.
#[derive(Debug, Clone, Default)]
pub struct MessageSequencer {
    current: u64,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last id handed out or accepted (0 before the first exchange).
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Id the next exchange must carry.
    pub fn expected(&self) -> u64 {
        self.current + 1
    }

    /// Take the next id for an outbound exchange.
    pub fn next_id(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    /// Accept an inbound id. `None` (attribute absent) takes the next id.
    /// A refused id leaves the counter untouched.
    pub fn accept(&mut self, raw: Option<&str>) -> Result<u64, SequenceError> {
        let Some(raw) = raw else {
            return Ok(self.next_id());
        };
        let actual: u64 = raw
            .parse()
            .map_err(|_| SequenceError::Malformed(raw.to_string()))?;
        let expected = self.expected();
        if actual != expected {
            return Err(SequenceError::Unexpected { expected, actual });
        }
        self.current = actual;
        Ok(actual)
    }
}

/// Check that a reply echoes the id of the request it answers.
pub fn verify_echo(sent: u64, echoed: Option<&str>) -> Result<(), SequenceError> {
    let raw = echoed.unwrap_or("");
    let actual: u64 = raw
        .parse()
        .map_err(|_| SequenceError::Malformed(raw.to_string()))?;
    if actual != sent {
        return Err(SequenceError::Unexpected {
            expected: sent,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_is_monotonic() {
        let mut seq = MessageSequencer::new();
        assert_eq!(seq.next_id(), 1);
        assert_eq!(seq.next_id(), 2);
        assert_eq!(seq.current(), 2);
    }

    #[test]
    fn test_accept_expected_and_absent() {
        let mut seq = MessageSequencer::new();
        assert_eq!(seq.accept(Some("1")), Ok(1));
        assert_eq!(seq.accept(None), Ok(2));
        assert_eq!(seq.accept(Some("3")), Ok(3));
    }

    #[test]
    fn test_stale_id_rejected_without_advancing() {
        let mut seq = MessageSequencer::new();
        seq.accept(Some("1")).unwrap();
        seq.accept(Some("2")).unwrap();

        assert_eq!(
            seq.accept(Some("2")),
            Err(SequenceError::Unexpected {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(seq.current(), 2);
        assert_eq!(
            seq.accept(Some("2")).unwrap_err().to_string(),
            "stale message id 2 (expected 3)"
        );
        assert!(matches!(
            seq.accept(Some("x")),
            Err(SequenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_verify_echo() {
        assert!(verify_echo(4, Some("4")).is_ok());
        assert!(verify_echo(4, Some("5")).is_err());
        assert!(verify_echo(4, None).is_err());
    }
}
