// Axel '0vercl0k' Souchet - October 18 2026
//! This is the error type used across the codebase.
use std::fmt::{self, Display};
use std::io;

use thiserror::Error;

use crate::addr::{Address, WordSize};
use crate::constraint::Scalar;

pub type Result<R> = std::result::Result<R, HaystackError>;

/// Represent the fundamental reason a read out of an address space can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// No region of the address space contains this address.
    Unmapped(Address),
    /// The address belongs to a region listed in the snapshot index, but the
    /// bytes of that region weren't captured (or stop before the address).
    NotCaptured { addr: Address, region_start: Address },
}

impl ReadError {
    /// The first address that couldn't be read.
    #[must_use]
    pub fn addr(&self) -> Address {
        match self {
            Self::Unmapped(addr) | Self::NotCaptured { addr, .. } => *addr,
        }
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped(addr) => write!(f, "{addr} isn't mapped"),
            Self::NotCaptured { addr, region_start } => write!(
                f,
                "{addr} belongs to the region at {region_start} but its content wasn't captured"
            ),
        }
    }
}

impl std::error::Error for ReadError {}

/// Every failure the loader, the heap walker and the dump loader can report.
///
/// [`HaystackError::OutOfBounds`] and [`HaystackError::ConstraintViolation`]
/// are 'recoverable': they only mean that a candidate address doesn't hold a
/// valid instance, and a scan is expected to carry on with the next one (cf
/// [`ignore_recoverable`]). Everything else is a programming or input error.
#[derive(Debug, Error)]
pub enum HaystackError {
    #[error("{len:#x} bytes at {addr} are out of bounds: {reason}")]
    OutOfBounds {
        addr: Address,
        len: u64,
        reason: ReadError,
    },
    #[error("{schema}.{field} = {value} doesn't satisfy its constraints")]
    ConstraintViolation {
        schema: String,
        field: String,
        value: Scalar,
    },
    #[error("malformed schema {schema}: {reason}")]
    MalformedSchema { schema: String, reason: String },
    #[error("no schema named {0} is registered")]
    UnknownSchema(String),
    #[error("{schema} has no loaded field named {field}")]
    MissingField { schema: String, field: String },
    #[error("the registry lays out {registry} structures but the address space is {space}")]
    WordSizeMismatch { registry: WordSize, space: WordSize },
    #[error("the region starting at {0} overlaps with another one")]
    OverlappingRegion(Address),
    #[error("invalid index line {line}: {reason}")]
    InvalidIndex { line: usize, reason: String },
    #[error("io")]
    Io(#[from] io::Error),
    #[error("overflow: {0}")]
    Overflow(&'static str),
}

impl HaystackError {
    /// Build a [`HaystackError::MalformedSchema`].
    pub(crate) fn malformed(schema: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSchema {
            schema: schema.to_string(),
            reason: reason.into(),
        }
    }

    /// Does this error only disqualify the current candidate?
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. } | Self::ConstraintViolation { .. }
        )
    }
}

/// Turn the recoverable errors into `None` and bubble up the others.
pub fn ignore_recoverable<T>(r: Result<T>) -> Result<Option<T>> {
    match r {
        Ok(o) => Ok(Some(o)),
        Err(e) if e.is_recoverable() => Ok(None),
        Err(e) => Err(e),
    }
}
