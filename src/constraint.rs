// Axel '0vercl0k' Souchet - October 18 2026
//! This defines the decoded [`Scalar`] values and the [`Constraint`]s a schema
//! attaches to its fields.
//!
//! # Examples
//!
//! ```
//! # use haystack::{Constraint, Scalar};
//! let version = Constraint::one_of([0, 1, 2]);
//! assert!(version.check(Scalar::Unsigned(2)));
//! assert!(!version.check(Scalar::Unsigned(3)));
//! let refs = Constraint::in_range(0, 0xfff);
//! assert!(!refs.check(Scalar::Signed(-1)));
//! ```
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// A decoded integer (or raw pointer) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    Unsigned(u64),
    Signed(i64),
}

impl Scalar {
    /// Widen the value so that signed and unsigned values compare correctly.
    #[must_use]
    pub fn as_i128(&self) -> i128 {
        match self {
            Self::Unsigned(u) => i128::from(*u),
            Self::Signed(i) => i128::from(*i),
        }
    }

    /// Reinterpret the raw bits as a [`u64`].
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::Unsigned(u) => *u,
            Self::Signed(i) => *i as u64,
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_u64() == 0
    }

    /// Decode a little-endian integer of `data.len()` bytes (1, 2, 4 or 8).
    pub(crate) fn decode(data: &[u8], signed: bool) -> Option<Self> {
        let mut raw = [0u8; 8];
        raw.get_mut(..data.len())?.copy_from_slice(data);
        let value = u64::from_le_bytes(raw);
        if !signed {
            return Some(Self::Unsigned(value));
        }

        // Sign-extend from the field width.
        let shift = 64 - 8 * u32::try_from(data.len()).ok()?;
        if shift >= 64 {
            return None;
        }

        Some(Self::Signed(((value << shift) as i64) >> shift))
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(u) => write!(f, "{u:#x}"),
            Self::Signed(i) => write!(f, "{i}"),
        }
    }
}

/// The domain of values an integer field of a given width can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Domain {
    pub min: i128,
    pub max: i128,
}

impl Domain {
    pub fn new(width: usize, signed: bool) -> Self {
        let bits = 8 * width as u32;
        if signed {
            Self {
                min: -(1i128 << (bits - 1)),
                max: (1i128 << (bits - 1)) - 1,
            }
        } else {
            Self {
                min: 0,
                max: (1i128 << bits) - 1,
            }
        }
    }

    pub fn contains(&self, v: i128) -> bool {
        (self.min..=self.max).contains(&v)
    }
}

/// A predicate over a single decoded field.
///
/// Constraints never fail for a well-formed value; they answer yes or no.
/// Constraints whose bounds can't be represented by the field they are
/// attached to are rejected when the schema is registered.
#[derive(Clone)]
pub enum Constraint {
    /// The value must not be zero (null for pointers).
    NotNull,
    /// The value must be within `lo..=hi`.
    InRange { lo: i128, hi: i128 },
    /// The value must be one of those.
    OneOf(Vec<i128>),
    /// A user supplied predicate.
    Predicate {
        name: &'static str,
        f: Arc<dyn Fn(Scalar) -> bool + Send + Sync>,
    },
}

impl Constraint {
    #[must_use]
    pub fn not_null() -> Self {
        Self::NotNull
    }

    #[must_use]
    pub fn in_range(lo: impl Into<i128>, hi: impl Into<i128>) -> Self {
        Self::InRange {
            lo: lo.into(),
            hi: hi.into(),
        }
    }

    #[must_use]
    pub fn one_of<T: Into<i128>>(values: impl IntoIterator<Item = T>) -> Self {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }

    /// Wrap a closure into a constraint; `name` shows up in debug output.
    #[must_use]
    pub fn predicate(
        name: &'static str,
        f: impl Fn(Scalar) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Predicate {
            name,
            f: Arc::new(f),
        }
    }

    /// Does `value` satisfy the constraint?
    #[must_use]
    pub fn check(&self, value: Scalar) -> bool {
        match self {
            Self::NotNull => !value.is_zero(),
            Self::InRange { lo, hi } => (*lo..=*hi).contains(&value.as_i128()),
            Self::OneOf(values) => values.contains(&value.as_i128()),
            Self::Predicate { f, .. } => f(value),
        }
    }

    /// Can this constraint be evaluated against a field of `domain`? Only
    /// literal bounds need checking.
    pub(crate) fn fits(&self, domain: Domain) -> std::result::Result<(), String> {
        match self {
            Self::InRange { lo, hi } if lo > hi => Err(format!("empty range {lo}..={hi}")),
            Self::InRange { lo, hi } if !domain.contains(*lo) || !domain.contains(*hi) => Err(
                format!("range {lo}..={hi} is outside of {}..={}", domain.min, domain.max),
            ),
            Self::OneOf(values) => match values.iter().find(|v| !domain.contains(**v)) {
                Some(v) => Err(format!("{v} is outside of {}..={}", domain.min, domain.max)),
                None if values.is_empty() => Err("empty set of values".into()),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

impl Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotNull => write!(f, "NotNull"),
            Self::InRange { lo, hi } => write!(f, "InRange({lo}..={hi})"),
            Self::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            Self::Predicate { name, .. } => write!(f, "Predicate({name})"),
        }
    }
}

/// Evaluate `constraints` in order and return the index of the first one that
/// fails, if any.
pub(crate) fn first_failure(constraints: &[Constraint], value: Scalar) -> Option<usize> {
    constraints.iter().position(|c| !c.check(value))
}
