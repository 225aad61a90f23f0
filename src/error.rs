// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for window construction and stub lifecycle failures.
//!
//! Most runtime failures in this crate (duplicate messages, stale
//! stability requests, listener panics, retransmit/connect failures) are
//! handled by logging and returning a sentinel value rather than by
//! propagating an `Error` -- see the module docs on [`crate::NakWindow`]
//! for the full breakdown. `Error` only covers the boundaries that are
//! genuinely fatal: bad construction arguments and stub bookkeeping.

use std::fmt;

/// Errors produced at construction time or by stub registry lookups.
#[derive(Debug)]
pub enum Error {
    // === Argument errors ===
    /// Seqno 0 was passed where a positive seqno is required.
    InvalidSeqno {
        /// The rejected seqno.
        seqno: u64,
    },
    /// `NakWindow::new` was given `initial_highest_delivered < initial_low`,
    /// which would violate `low <= highest_delivered` from construction.
    InvalidRange {
        /// The rejected `initial_highest_delivered`.
        highest_delivered: u64,
        /// The `initial_low` it fell below.
        low: u64,
    },

    // === Stub registry errors ===
    /// `unregister`/`unregister_and_destroy` was given a stub that is
    /// not currently registered.
    StubNotFound,

    // === Connection errors ===
    /// A [`crate::RouterStub`] connect attempt failed.
    Connect {
        /// Human-readable failure reason, for logging.
        reason: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSeqno { seqno } => write!(f, "invalid seqno {seqno} (0 is reserved)"),
            Error::InvalidRange { highest_delivered, low } => write!(
                f,
                "initial_highest_delivered {highest_delivered} < initial_low {low}"
            ),
            Error::StubNotFound => write!(f, "router stub not registered"),
            Error::Connect { reason } => write!(f, "router stub connect failed: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_non_empty() {
        let errs = [
            Error::InvalidSeqno { seqno: 0 },
            Error::InvalidRange {
                highest_delivered: 0,
                low: 5,
            },
            Error::StubNotFound,
            Error::Connect {
                reason: "refused".into(),
            },
        ];
        for e in errs {
            assert!(!e.to_string().is_empty());
        }
    }
}
