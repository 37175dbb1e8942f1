// Axel '0vercl0k' Souchet - October 18 2026
//! This contains the [`Address`] type used to talk about locations in a
//! captured address space, and [`WordSize`] which knows how wide the
//! pointers of the captured process were.
//!
//! # Examples
//!
//! ```
//! use haystack::{Address, WordSize};
//! let addr = Address::new(0x1337_008);
//! assert!(addr.is_aligned(WordSize::Eight));
//! assert_eq!(addr.checked_add(8), Some(Address::new(0x1337_010)));
//! ```
use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;

/// Strong type for an address inside a memory snapshot.
///
/// Every value read out of a snapshot is untrusted, so the arithmetic helpers
/// are all checked and hand back an [`Option`].
///
/// # Examples
///
/// ```
/// # use haystack::Address;
/// # fn main() {
/// let addr = Address::new(0x1337_123);
/// assert_eq!(addr.u64(), 0x1337_123);
/// assert_eq!(addr.checked_sub(0x123), Some(Address::new(0x1337_000)));
/// assert_eq!(Address::new(u64::MAX).checked_add(1), None);
/// # }
/// ```
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, Default, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Create a new [`Address`].
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the underlying [`u64`] out of it.
    #[must_use]
    pub const fn u64(&self) -> u64 {
        self.0
    }

    /// Is it the null address?
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Add `offset` bytes, or `None` on overflow.
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// Subtract `offset` bytes, or `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self> {
        self.0.checked_sub(offset).map(Self)
    }

    /// How far is it from `base`? `None` if it is below `base`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use haystack::Address;
    /// # fn main() {
    /// let base = Address::new(0x1000);
    /// assert_eq!(Address::new(0x1010).offset_from(base), Some(0x10));
    /// assert_eq!(Address::new(0x10).offset_from(base), None);
    /// # }
    /// ```
    #[must_use]
    pub fn offset_from(self, base: Self) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// Is it aligned on a word boundary?
    #[must_use]
    pub fn is_aligned(&self, word_size: WordSize) -> bool {
        self.0 % word_size.bytes() == 0
    }
}

/// Convert a [`u64`] into an [`Address`].
impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Convert an [`Address`] into a [`u64`].
impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Format an [`Address`] as a string.
impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Parse an [`Address`] from a string.
///
/// # Examples
///
/// ```
/// # use haystack::Address;
/// # fn main() {
/// let addr: Address = "0x00007fff`12340000".parse().unwrap();
/// assert_eq!(addr.u64(), 0x7fff_1234_0000);
/// let addr: Address = "08048000".parse().unwrap();
/// assert_eq!(addr.u64(), 0x0804_8000);
/// # }
/// ```
impl FromStr for Address {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().replace('`', "");
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(&s);

        Ok(Address::new(u64::from_str_radix(digits, 16)?))
    }
}

/// The width of a machine word (and of a pointer) in the captured process.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum WordSize {
    /// 32-bit process.
    Four,
    /// 64-bit process.
    Eight,
}

impl WordSize {
    /// Size of a word in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Size of a word in bytes, as a [`usize`].
    #[must_use]
    pub const fn as_usize(&self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Decode a little-endian word out of the first bytes of `data`. Returns
    /// `None` if `data` is too short.
    ///
    /// # Examples
    ///
    /// ```
    /// # use haystack::WordSize;
    /// # fn main() {
    /// let data = [0x37, 0x13, 0, 0, 0xff, 0xff, 0xff, 0xff];
    /// assert_eq!(WordSize::Four.decode(&data), Some(0x1337));
    /// assert_eq!(WordSize::Eight.decode(&data), Some(0xffff_ffff_0000_1337));
    /// assert_eq!(WordSize::Eight.decode(&data[..4]), None);
    /// # }
    /// ```
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> Option<u64> {
        match self {
            Self::Four => data
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(|b| u64::from(u32::from_le_bytes(b))),
            Self::Eight => data
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes),
        }
    }
}

impl TryFrom<u64> for WordSize {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(value),
        }
    }
}

impl Display for WordSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}
