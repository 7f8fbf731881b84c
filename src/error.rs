// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the KD-tree index
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A cooperative abort signal was observed
    ///
    /// Persistent state stays consistent: discardable writes are rolled
    /// back and the last committed index dump remains on disk.
    Cancelled,

    /// A bounded lock wait ran out
    ///
    /// Only raised on the merge path; the merge daemon treats it as
    /// "skip this round".
    LockTimeout,

    /// The serialized index dump is unreadable (truncated or torn)
    IndexFileCorrupted(&'static str),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum of the bytes actually read
        got: u64,

        /// Checksum stored alongside the data
        expected: u64,
    },

    /// A sub-file carries an unknown magic or malformed header
    InvalidHeader(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KdIndexError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl Error {
    /// Returns `true` if the error marks unreadable persistent state.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::IndexFileCorrupted(_) | Self::ChecksumMismatch { .. } | Self::InvalidHeader(_)
        )
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
