// Axel '0vercl0k' Souchet - October 18 2026
//! This walks glibc-style heaps: a heap region is a sequence of
//! [`MallocChunk`]s, each one starting with its predecessor's size and its own
//! size, in which the low bits are flags.
//!
//! Whether a chunk is allocated isn't stored in the chunk itself: it is the
//! [`ChunkFlags::PREV_INUSE`] bit of the chunk right after it.
//!
//! # Examples
//!
//! ```
//! # use haystack::{heap, Address, MallocChunk, Mappings, MemoryRegion, Registry, Session, WordSize};
//! // Two chunks of 0x18 bytes; the second one says the first one is in use.
//! let mut bytes = vec![0u8; 0x30];
//! bytes[0x08..0x10].copy_from_slice(&0x19u64.to_le_bytes());
//! bytes[0x20..0x28].copy_from_slice(&0x19u64.to_le_bytes());
//! let region = MemoryRegion::with_content(Address::new(0x1000), Some("[heap]".into()), bytes).unwrap();
//! let mappings = Mappings::new(WordSize::Eight).with(region).unwrap();
//!
//! let mut registry = Registry::new(WordSize::Eight);
//! registry.register_type::<MallocChunk>().unwrap();
//! let mut session = Session::new(&registry, &mappings).unwrap();
//! let region = mappings.heap().unwrap();
//! assert!(heap::is_heap(&mut session, region));
//!
//! let (allocated, free) = heap::user_allocations(&mut session, region).unwrap();
//! assert_eq!(allocated.len(), 1);
//! assert_eq!(allocated[0].addr, Address::new(0x1010));
//! assert_eq!(free.len(), 1);
//! ```
use bitflags::bitflags;
use tracing::debug;

use crate::addr::{Address, WordSize};
use crate::constraint::{Constraint, Scalar};
use crate::error::{HaystackError, ReadError, Result};
use crate::instance::{InstanceView, Loadable};
use crate::loader::Session;
use crate::schema::{FieldKind, SchemaDescriptor};
use crate::space::{AddressSpace, MemoryRegion};

bitflags! {
    /// The flags living in the low bits of a chunk's size.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChunkFlags: u64 {
        /// The previous chunk is in use, so `prev_size` is meaningless.
        const PREV_INUSE = 1 << 0;
        /// The chunk was obtained with `mmap`.
        const IS_MMAPPED = 1 << 1;
        /// The chunk belongs to a thread arena.
        const NON_MAIN_ARENA = 1 << 2;
    }
}

/// How deep chunks are loaded: chunks don't have pointers the walker needs.
const CHUNK_DEPTH: usize = 1;

/// The header of a heap chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocChunk {
    addr: Address,
    prev_size: u64,
    size: u64,
}

impl MallocChunk {
    #[must_use]
    pub fn addr(&self) -> Address {
        self.addr
    }

    #[must_use]
    pub fn prev_size(&self) -> u64 {
        self.prev_size
    }

    /// The raw size, flags included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.size)
    }

    /// The size without the flags.
    #[must_use]
    pub fn real_size(&self) -> u64 {
        self.size & !ChunkFlags::all().bits()
    }

    #[must_use]
    pub fn prev_in_use(&self) -> bool {
        self.flags().contains(ChunkFlags::PREV_INUSE)
    }

    /// Where the next chunk starts.
    #[must_use]
    pub fn next_addr(&self) -> Option<Address> {
        self.addr.checked_add(self.real_size())
    }

    /// Where the previous chunk starts; only meaningful if it is free.
    #[must_use]
    pub fn prev_addr(&self) -> Option<Address> {
        if self.prev_in_use() {
            return None;
        }

        self.addr.checked_sub(self.prev_size)
    }

    /// Is the chunk allocated? This reads the flags of the next chunk; if they
    /// can't be read, the chunk is considered free.
    #[must_use]
    pub fn in_use(&self, space: &dyn AddressSpace) -> bool {
        let Some(next_size) = self
            .next_addr()
            .and_then(|next| next.checked_add(space.word_size().bytes()))
        else {
            return false;
        };

        space
            .read_word(next_size)
            .is_ok_and(|size| ChunkFlags::from_bits_truncate(size).contains(ChunkFlags::PREV_INUSE))
    }

    /// Where the user data starts.
    #[must_use]
    pub fn payload_addr(&self, word_size: WordSize) -> Option<Address> {
        self.addr.checked_add(2 * word_size.bytes())
    }

    /// How many bytes the user can use.
    #[must_use]
    pub fn payload_size(&self, word_size: WordSize) -> u64 {
        self.real_size().saturating_sub(word_size.bytes())
    }
}

impl Loadable for MallocChunk {
    const NAME: &'static str = "malloc_chunk";

    fn descriptor(word_size: WordSize) -> SchemaDescriptor {
        let word = word_size.bytes();

        SchemaDescriptor::new(Self::NAME)
            .field("prev_size", FieldKind::word(word_size))
            .field("size", FieldKind::word(word_size))
            .constrain(
                "size",
                Constraint::predicate("size is a multiple of the word size", move |size| {
                    (size.as_u64() & !ChunkFlags::all().bits()) % word == 0
                }),
            )
    }

    fn from_view(view: &InstanceView<'_>) -> Result<Self> {
        Ok(Self {
            addr: view.addr(),
            prev_size: view.require_scalar("prev_size")?.as_u64(),
            size: view.require_scalar("size")?.as_u64(),
        })
    }

    /// A free predecessor has to be a chunk of the same region.
    fn is_valid(&self, space: &dyn AddressSpace) -> Result<()> {
        if self.prev_in_use() {
            return Ok(());
        }

        if self.prev_size == 0 {
            return Err(HaystackError::ConstraintViolation {
                schema: Self::NAME.to_string(),
                field: "prev_size".to_string(),
                value: Scalar::Unsigned(0),
            });
        }

        let header = 2 * space.word_size().as_usize();
        let backlink = self.addr.checked_sub(self.prev_size);
        match (space.region_of(self.addr), backlink) {
            (Some(region), Some(prev)) if region.contains(prev) => {
                // The predecessor's header has to be there.
                space.read_bytes(prev, header)?;
            }
            _ => {
                let addr = backlink.unwrap_or(Address::NULL);
                return Err(HaystackError::OutOfBounds {
                    addr,
                    len: header as u64,
                    reason: ReadError::Unmapped(addr),
                });
            }
        }

        Ok(())
    }
}

/// A user allocation: where the payload starts and how big it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: Address,
    pub size: u64,
}

/// A chunk met during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapChunk {
    pub chunk: MallocChunk,
    pub in_use: bool,
    pub payload: Allocation,
}

/// Iterates over the chunks of a heap region, see [`walk_chunks`].
pub struct ChunkWalker<'s, 'a> {
    session: &'s mut Session<'a>,
    end: Address,
    next: Option<Address>,
}

impl Iterator for ChunkWalker<'_, '_> {
    type Item = Result<HeapChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next.take()?;
        let chunk = match self.session.load_as::<MallocChunk>(addr, CHUNK_DEPTH) {
            Ok((_, chunk)) => chunk,
            Err(e) => {
                debug!("heap walk stopped at {addr}: {e}");
                return Some(Err(e));
            }
        };

        let space = self.session.space();
        let word_size = space.word_size();
        let Some(payload_addr) = chunk.payload_addr(word_size) else {
            return Some(Err(HaystackError::Overflow("w/ chunk payload address")));
        };

        // Only move forward, and only inside the region.
        self.next = chunk
            .next_addr()
            .filter(|&next| next > addr && next < self.end && space.is_mapped(next));
        if self.next.is_none() {
            debug!("heap walk ends after the chunk at {addr}");
        }

        Some(Ok(HeapChunk {
            chunk,
            in_use: chunk.in_use(space),
            payload: Allocation {
                addr: payload_addr,
                size: chunk.payload_size(word_size),
            },
        }))
    }
}

/// Walk every chunk of `region`, from its start. The walk yields an error and
/// stops at the first chunk that doesn't validate; it also stops once the
/// next chunk would start outside of the region.
pub fn walk_chunks<'s, 'a>(session: &'s mut Session<'a>, region: &MemoryRegion) -> ChunkWalker<'s, 'a> {
    ChunkWalker {
        session,
        end: region.end(),
        next: (!region.is_empty()).then_some(region.start()),
    }
}

/// The user allocations of a heap region, see [`iterate_allocations`].
pub struct Allocations<'s, 'a> {
    walker: ChunkWalker<'s, 'a>,
    filter_in_use: bool,
}

impl Iterator for Allocations<'_, '_> {
    type Item = Allocation;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.walker.next()? {
                Ok(chunk) if self.filter_in_use && !chunk.in_use => continue,
                Ok(chunk) => return Some(chunk.payload),
                // The walker already logged why; a broken chunk is where the
                // heap ends as far as we are concerned.
                Err(_) => return None,
            }
        }
    }
}

/// Lazily list the allocations of `region`. With `filter_in_use` only the
/// chunks in use are listed, otherwise every chunk is.
///
/// # Errors
///
/// Returns [`HaystackError::UnknownSchema`] if [`MallocChunk`] wasn't
/// registered.
pub fn iterate_allocations<'s, 'a>(
    session: &'s mut Session<'a>,
    region: &MemoryRegion,
    filter_in_use: bool,
) -> Result<Allocations<'s, 'a>> {
    session.registry().by_name(MallocChunk::NAME)?;

    Ok(Allocations {
        walker: walk_chunks(session, region),
        filter_in_use,
    })
}

/// Split the chunks of `region` into allocated and free ones.
///
/// # Errors
///
/// Returns the error of the first chunk that doesn't validate.
pub fn user_allocations(
    session: &mut Session<'_>,
    region: &MemoryRegion,
) -> Result<(Vec<Allocation>, Vec<Allocation>)> {
    let mut allocated = Vec::new();
    let mut free = Vec::new();
    for chunk in walk_chunks(session, region) {
        let chunk = chunk?;
        if chunk.in_use {
            allocated.push(chunk.payload);
        } else {
            free.push(chunk.payload);
        }
    }

    Ok((allocated, free))
}

/// Does `region` look like it is managed by the allocator? The payloads of its
/// chunks have to account for the whole region, minus a word per chunk.
#[must_use]
pub fn is_heap(session: &mut Session<'_>, region: &MemoryRegion) -> bool {
    let word = session.space().word_size().bytes();
    let mut total = 0u64;
    let mut count = 0u64;
    for chunk in walk_chunks(session, region) {
        match chunk {
            Ok(chunk) => {
                total = total.saturating_add(chunk.payload.size);
                count += 1;
            }
            Err(e) => {
                debug!("{} isn't a heap: {e}", region.start());
                return false;
            }
        }
    }

    if count == 0 {
        debug!("{} isn't a heap: it has no chunks", region.start());
        return false;
    }

    let expected = count
        .checked_mul(word)
        .and_then(|overhead| region.len().checked_sub(overhead));
    if expected != Some(total) {
        debug!(
            "{} isn't a heap: expected {expected:?} bytes of payload over {count} chunks, got {total:#x}",
            region.start()
        );
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(prev_size: u64, size: u64) -> MallocChunk {
        MallocChunk {
            addr: Address::new(0x1000),
            prev_size,
            size,
        }
    }

    #[test]
    fn flags() {
        let c = chunk(0, 0x21 | 0x4);
        assert_eq!(c.real_size(), 0x20);
        assert_eq!(c.flags(), ChunkFlags::PREV_INUSE | ChunkFlags::NON_MAIN_ARENA);
        assert!(c.prev_in_use());
        assert_eq!(c.prev_addr(), None);
        assert_eq!(c.next_addr(), Some(Address::new(0x1020)));
    }

    #[test]
    fn payload() {
        let c = chunk(0x10, 0x30);
        assert!(!c.prev_in_use());
        assert_eq!(c.prev_addr(), Some(Address::new(0xff0)));
        assert_eq!(c.payload_addr(WordSize::Eight), Some(Address::new(0x1010)));
        assert_eq!(c.payload_size(WordSize::Eight), 0x28);
        assert_eq!(c.payload_addr(WordSize::Four), Some(Address::new(0x1008)));
        assert_eq!(c.payload_size(WordSize::Four), 0x2c);
    }

    #[test]
    fn layout_follows_the_word_size() {
        for (word_size, size) in [(WordSize::Four, 8), (WordSize::Eight, 0x10)] {
            let mut registry = crate::Registry::new(word_size);
            let id = registry.register_type::<MallocChunk>().unwrap();
            let schema = registry.get(id);
            assert_eq!(schema.size(), size);
            assert_eq!(schema.field("size").unwrap().offset(), size / 2);
        }
    }
}
