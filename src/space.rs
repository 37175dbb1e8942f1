// Axel '0vercl0k' Souchet - October 18 2026
//! This defines the [`AddressSpace`] abstraction the loader reads through, and
//! [`Mappings`], its implementation over a set of captured memory regions.
use std::cmp::min;
use std::fmt::{self, Debug};

use crate::addr::{Address, WordSize};
use crate::error::{HaystackError, ReadError, Result};

/// A read-only view over a captured address space.
///
/// Implementors only need to resolve addresses to regions and copy bytes out;
/// the helpers to read partial buffers, byte vectors and words come for free.
pub trait AddressSpace {
    /// How wide the words (and pointers) of the captured process are.
    fn word_size(&self) -> WordSize;

    /// Find the region that contains `addr`.
    fn region_of(&self, addr: Address) -> Option<&MemoryRegion>;

    /// Is `addr` inside one of the regions of the address space?
    fn is_mapped(&self, addr: Address) -> bool {
        self.region_of(addr).is_some()
    }

    /// Read exactly `buf.len()` bytes starting at `addr`. The read can
    /// straddle several contiguous regions.
    fn read_exact(&self, addr: Address, buf: &mut [u8]) -> Result<()> {
        let amount = self.read(addr, buf)?;
        if amount == buf.len() {
            return Ok(());
        }

        // Figure out the first byte we couldn't read, to explain why.
        let failed_at = addr
            .checked_add(amount as u64)
            .ok_or(HaystackError::Overflow("w/ read address"))?;
        let reason = match self.region_of(failed_at) {
            Some(region) => ReadError::NotCaptured {
                addr: failed_at,
                region_start: region.start(),
            },
            None => ReadError::Unmapped(failed_at),
        };

        Err(HaystackError::OutOfBounds {
            addr,
            len: buf.len() as u64,
            reason,
        })
    }

    /// Read as many bytes as possible, up to `buf.len()`, starting at `addr`.
    /// Stops at the first byte that isn't backed by captured content.
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<usize> {
        // Total amount of bytes that we have successfully read.
        let mut total_read = 0;
        // The current address we are reading from.
        let mut cur = addr;
        // Let's try to read as much as the user wants.
        while total_read < buf.len() {
            // Find the region backing the current address..
            let Some(region) = self.region_of(cur) else {
                break;
            };

            // ..and grab what it has captured from there.
            let available = region.captured_from(cur);
            if available.is_empty() {
                break;
            }

            // Either we read until the end of the region, or we stop before if we
            // can get by with less.
            let amount_wanted = min(buf.len() - total_read, available.len());
            buf[total_read..total_read + amount_wanted]
                .copy_from_slice(&available[..amount_wanted]);
            total_read += amount_wanted;

            // We have more work to do, so let's move to the next region.
            let Some(next) = cur.checked_add(amount_wanted as u64) else {
                break;
            };
            cur = next;
        }

        Ok(total_read)
    }

    /// Read `len` bytes starting at `addr` into a freshly allocated buffer.
    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_exact(addr, &mut buf)?;

        Ok(buf)
    }

    /// Read a word (little-endian, [`AddressSpace::word_size`] wide).
    fn read_word(&self, addr: Address) -> Result<u64> {
        let word_size = self.word_size();
        let mut buf = [0u8; 8];
        let buf = &mut buf[..word_size.as_usize()];
        self.read_exact(addr, buf)?;

        word_size
            .decode(buf)
            .ok_or(HaystackError::Overflow("w/ word decoding"))
    }
}

/// A contiguous range `[start, end)` of the captured process, optionally with
/// its content.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    start: Address,
    end: Address,
    label: Option<String>,
    content: Option<Vec<u8>>,
}

impl Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("label", &self.label)
            .field("captured", &self.content.as_ref().map(Vec::len))
            .finish()
    }
}

impl MemoryRegion {
    /// A region whose content wasn't captured.
    #[must_use]
    pub fn new(start: Address, end: Address, label: Option<String>) -> Self {
        Self {
            start,
            end,
            label,
            content: None,
        }
    }

    /// A region backed by `content`; it ends where the content ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the region would wrap around the address space.
    pub fn with_content(start: Address, label: Option<String>, content: Vec<u8>) -> Result<Self> {
        let end = start
            .checked_add(content.len() as u64)
            .ok_or(HaystackError::Overflow("w/ region end"))?;

        Ok(Self {
            start,
            end,
            label,
            content: Some(content),
        })
    }

    /// Attach `content` to the region. Content longer than the region is
    /// truncated, shorter content leaves the tail uncaptured.
    #[must_use]
    pub fn captured(mut self, mut content: Vec<u8>) -> Self {
        content.truncate(usize::try_from(self.len()).unwrap_or(usize::MAX));
        self.content = Some(content);

        self
    }

    #[must_use]
    pub fn start(&self) -> Address {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Address {
        self.end
    }

    /// The pathname (or any other label) of the region, like `[heap]`.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.u64().saturating_sub(self.start.u64())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Was the content of the region captured at all?
    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.content.is_some()
    }

    /// The captured bytes, if any.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    /// The captured bytes from `addr` up to the end of the captured content.
    fn captured_from(&self, addr: Address) -> &[u8] {
        let Some(content) = &self.content else {
            return &[];
        };

        addr.offset_from(self.start)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|offset| content.get(offset..))
            .unwrap_or(&[])
    }
}

/// An [`AddressSpace`] made of non-overlapping [`MemoryRegion`]s.
pub struct Mappings {
    word_size: WordSize,
    /// Sorted by start address.
    regions: Vec<MemoryRegion>,
}

impl Debug for Mappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mappings")
            .field("word_size", &self.word_size)
            .field("regions", &self.regions.len())
            .finish()
    }
}

impl Mappings {
    #[must_use]
    pub fn new(word_size: WordSize) -> Self {
        Self {
            word_size,
            regions: Vec::new(),
        }
    }

    /// Add a region to the address space.
    ///
    /// # Errors
    ///
    /// Returns an error if it overlaps with a region already inserted.
    pub fn insert(&mut self, region: MemoryRegion) -> Result<()> {
        let idx = self
            .regions
            .partition_point(|r| r.start() < region.start());
        let overlaps_prev = idx
            .checked_sub(1)
            .and_then(|prev| self.regions.get(prev))
            .is_some_and(|prev| prev.end() > region.start());
        let overlaps_next = self
            .regions
            .get(idx)
            .is_some_and(|next| next.start() < region.end() || next.start() == region.start());
        if overlaps_prev || overlaps_next {
            return Err(HaystackError::OverlappingRegion(region.start()));
        }

        self.regions.insert(idx, region);

        Ok(())
    }

    /// Builder flavor of [`Mappings::insert`].
    ///
    /// # Errors
    ///
    /// Returns an error if the region overlaps with a region already inserted.
    pub fn with(mut self, region: MemoryRegion) -> Result<Self> {
        self.insert(region)?;

        Ok(self)
    }

    /// Iterate over the regions, sorted by address.
    pub fn regions(&self) -> impl ExactSizeIterator<Item = &MemoryRegion> + '_ {
        self.regions.iter()
    }

    /// Find the first region carrying `label`.
    #[must_use]
    pub fn find_by_label(&self, label: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.label() == Some(label))
    }

    /// The `[heap]` region, if there is one.
    #[must_use]
    pub fn heap(&self) -> Option<&MemoryRegion> {
        self.find_by_label("[heap]")
    }

    /// The `[stack]` region, if there is one.
    #[must_use]
    pub fn stack(&self) -> Option<&MemoryRegion> {
        self.find_by_label("[stack]")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl AddressSpace for Mappings {
    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn region_of(&self, addr: Address) -> Option<&MemoryRegion> {
        // Find the last region starting at or before `addr`..
        let idx = self.regions.partition_point(|r| r.start() <= addr);
        let region = self.regions.get(idx.checked_sub(1)?)?;

        // ..and make sure it spans over it.
        region.contains(addr).then_some(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, content: &[u8]) -> MemoryRegion {
        MemoryRegion::with_content(Address::new(start), None, content.to_vec()).unwrap()
    }

    #[test]
    fn lookup() {
        let mappings = Mappings::new(WordSize::Eight)
            .with(region(0x2000, &[0; 0x10]))
            .unwrap()
            .with(region(0x1000, &[0; 0x10]))
            .unwrap();

        assert!(mappings.is_mapped(Address::new(0x1000)));
        assert!(mappings.is_mapped(Address::new(0x100f)));
        assert!(!mappings.is_mapped(Address::new(0x1010)));
        assert!(!mappings.is_mapped(Address::new(0xfff)));
        assert_eq!(
            mappings.region_of(Address::new(0x2008)).map(MemoryRegion::start),
            Some(Address::new(0x2000))
        );
    }

    #[test]
    fn overlaps_are_rejected() {
        let mut mappings = Mappings::new(WordSize::Eight);
        mappings.insert(region(0x1000, &[0; 0x10])).unwrap();
        assert!(matches!(
            mappings.insert(region(0x1008, &[0; 0x10])),
            Err(HaystackError::OverlappingRegion(_))
        ));
        assert!(matches!(
            mappings.insert(region(0xff8, &[0; 0x10])),
            Err(HaystackError::OverlappingRegion(_))
        ));
        mappings.insert(region(0x1010, &[0; 0x10])).unwrap();
        assert_eq!(mappings.len(), 2);
    }

    #[test]
    fn reads_straddle_contiguous_regions() {
        let mappings = Mappings::new(WordSize::Four)
            .with(region(0x1000, &[1, 2, 3, 4]))
            .unwrap()
            .with(region(0x1004, &[5, 6, 7, 8]))
            .unwrap();

        assert_eq!(
            mappings.read_bytes(Address::new(0x1002), 4).unwrap(),
            [3, 4, 5, 6]
        );
        assert_eq!(mappings.read_word(Address::new(0x1004)).unwrap(), 0x0807_0605);

        let mut buf = [0; 8];
        assert_eq!(mappings.read(Address::new(0x1006), &mut buf).unwrap(), 2);
        assert!(matches!(
            mappings.read_exact(Address::new(0x1006), &mut buf),
            Err(HaystackError::OutOfBounds {
                reason: ReadError::Unmapped(a),
                ..
            }) if a == Address::new(0x1008)
        ));
    }

    #[test]
    fn uncaptured_regions_are_mapped_but_unreadable() {
        let mappings = Mappings::new(WordSize::Eight)
            .with(MemoryRegion::new(
                Address::new(0x1000),
                Address::new(0x2000),
                Some("[stack]".into()),
            ))
            .unwrap();

        assert!(mappings.is_mapped(Address::new(0x1800)));
        assert!(mappings.stack().is_some());
        assert!(matches!(
            mappings.read_word(Address::new(0x1800)),
            Err(HaystackError::OutOfBounds {
                reason: ReadError::NotCaptured { .. },
                ..
            })
        ));
    }

    #[test]
    fn short_content_leaves_the_tail_uncaptured() {
        let r = MemoryRegion::new(Address::new(0x1000), Address::new(0x1010), None)
            .captured(vec![0xaa; 8]);
        let mappings = Mappings::new(WordSize::Eight).with(r).unwrap();
        assert_eq!(mappings.read_word(Address::new(0x1000)).unwrap(), u64::MAX / 0xff * 0xaa);
        assert!(mappings.read_word(Address::new(0x1008)).is_err());
    }
}
