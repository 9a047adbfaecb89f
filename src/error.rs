// SPDX-License-Identifier: GPL-3.0-only

//! Error taxonomy shared by every stage of the stacking pipeline.

use std::fmt;
use std::io;

/// Result type alias used throughout the crate.
pub type StackResult<T> = Result<T, StackError>;

/// Error kinds a caller needs to branch on (spec taxonomy, not subsystem).
#[derive(Debug)]
pub enum StackError {
    /// Missing file, permission denied, corrupted FITS magic, ...
    Io(io::Error),
    /// Shape mismatch, incompatible range/space, singular least-squares matrix, ...
    Format(String),
    /// Too few stars to register, fewer than 8 active pairs for the transform fit, ...
    InsufficientData(String),
    /// A cooperative interruption, distinguishable from `Format`.
    Cancelled,
    /// The plate solver's time budget was exhausted before a match was found.
    Budget,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Format(msg) => write!(f, "format error: {msg}"),
            Self::InsufficientData(msg) => write!(f, "insufficient data: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Budget => write!(f, "time budget exhausted"),
        }
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StackError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
