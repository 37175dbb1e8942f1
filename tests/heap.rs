// Axel '0vercl0k' Souchet - October 18 2026
use haystack::heap::{self, iterate_allocations, user_allocations};
use haystack::{
    Address, Allocation, HaystackError, MallocChunk, Mappings, MemoryRegion, Registry, Session,
    WordSize,
};

const HEAP: u64 = 0x55_0000;

/// Build a `[heap]` region of `len` bytes out of `(offset, prev_size, size)`
/// chunk headers.
fn heap(word_size: WordSize, len: usize, chunks: &[(usize, u64, u64)]) -> Mappings {
    let word = word_size.as_usize();
    let mut bytes = vec![0u8; len];
    for &(offset, prev_size, size) in chunks {
        bytes[offset..offset + word].copy_from_slice(&prev_size.to_le_bytes()[..word]);
        bytes[offset + word..offset + 2 * word].copy_from_slice(&size.to_le_bytes()[..word]);
    }

    let region = MemoryRegion::with_content(Address::new(HEAP), Some("[heap]".into()), bytes).unwrap();

    Mappings::new(word_size).with(region).unwrap()
}

fn registry(word_size: WordSize) -> Registry {
    let mut registry = Registry::new(word_size);
    registry.register_type::<MallocChunk>().unwrap();

    registry
}

fn alloc(offset: u64, size: u64) -> Allocation {
    Allocation {
        addr: Address::new(HEAP + offset),
        size,
    }
}

#[test]
fn two_chunks() {
    // The second chunk says the first one is in use.
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0, 0x19), (0x18, 0x19, 0x19)]);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();

    let in_use: Vec<_> = iterate_allocations(&mut session, region, true)
        .unwrap()
        .collect();
    assert_eq!(in_use, [alloc(0x10, 0x10)]);

    let all: Vec<_> = iterate_allocations(&mut session, region, false)
        .unwrap()
        .collect();
    assert_eq!(all, [alloc(0x10, 0x10), alloc(0x28, 0x10)]);

    assert!(heap::is_heap(&mut session, region));
}

#[test]
fn two_chunks_32_bits() {
    let mappings = heap(WordSize::Four, 0x20, &[(0, 0, 0x11), (0x10, 0x11, 0x11)]);
    let registry = registry(WordSize::Four);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();

    let (allocated, free) = user_allocations(&mut session, region).unwrap();
    assert_eq!(allocated, [alloc(0x8, 0xc)]);
    assert_eq!(free, [alloc(0x18, 0xc)]);
    assert!(heap::is_heap(&mut session, region));
}

#[test]
fn free_chunks_are_linked_back() {
    // The second chunk is in use and its predecessor is free.
    let chunks = [(0, 0, 0x21), (0x20, 0x20, 0x30), (0x50, 0, 0x31)];
    let mappings = heap(WordSize::Eight, 0x80, &chunks);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();

    let (allocated, free) = user_allocations(&mut session, region).unwrap();
    assert_eq!(allocated, [alloc(0x30, 0x28)]);
    assert_eq!(free, [alloc(0x10, 0x18), alloc(0x60, 0x28)]);

    // A second walk goes through the cached chunks.
    let cached = session.len();
    assert_eq!(
        user_allocations(&mut session, region).unwrap(),
        (allocated, free)
    );
    assert_eq!(session.len(), cached);

    assert!(heap::is_heap(&mut session, region));
}

#[test]
fn chunk_sizes_have_to_add_up() {
    let chunks = [(0, 0, 0x21), (0x20, 0, 0x31), (0x50, 0, 0x41), (0x90, 0, 0x51)];
    let mappings = heap(WordSize::Eight, 0xe0, &chunks);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    assert!(heap::is_heap(&mut session, mappings.heap().unwrap()));

    // The third chunk now runs into the middle of the last one.
    let mut chunks = chunks;
    chunks[2].2 = 0x51;
    let mappings = heap(WordSize::Eight, 0xe0, &chunks);
    let mut session = Session::new(&registry, &mappings).unwrap();
    assert!(!heap::is_heap(&mut session, mappings.heap().unwrap()));

    // The last chunk now overflows the region.
    let mut chunks = chunks;
    chunks[2].2 = 0x41;
    chunks[3].2 = 0x61;
    let mappings = heap(WordSize::Eight, 0xe0, &chunks);
    let mut session = Session::new(&registry, &mappings).unwrap();
    assert!(!heap::is_heap(&mut session, mappings.heap().unwrap()));
}

#[test]
fn in_use_comes_from_the_next_size_field() {
    // Only the second chunk's `prev_size` has its low bit set: the first
    // chunk is free.
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0, 0x19), (0x18, 0x19, 0x18)]);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();
    let first = heap::walk_chunks(&mut session, region).next().unwrap().unwrap();
    assert!(!first.in_use);
    assert_eq!(first.payload, alloc(0x10, 0x10));

    // Only its `size` has: the first chunk is in use.
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0, 0x19), (0x18, 0x18, 0x19)]);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();
    let first = heap::walk_chunks(&mut session, region).next().unwrap().unwrap();
    assert!(first.in_use);
}

#[test]
fn empty_regions_are_not_heaps() {
    let region =
        MemoryRegion::with_content(Address::new(HEAP), Some("[heap]".into()), Vec::new()).unwrap();
    let mappings = Mappings::new(WordSize::Eight).with(region).unwrap();
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();
    assert_eq!(heap::walk_chunks(&mut session, region).count(), 0);
    assert!(!heap::is_heap(&mut session, region));
}

#[test]
fn backlinks_out_of_the_region() {
    // The first chunk claims a free predecessor, before the heap.
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0x10, 0x18), (0x18, 0, 0x19)]);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();

    assert_eq!(
        iterate_allocations(&mut session, region, false)
            .unwrap()
            .count(),
        0
    );
    assert!(matches!(
        user_allocations(&mut session, region),
        Err(HaystackError::OutOfBounds { addr, .. }) if addr == Address::new(HEAP - 0x10)
    ));
    assert!(!heap::is_heap(&mut session, region));
    assert!(session.is_empty());
}

#[test]
fn free_chunks_need_a_predecessor() {
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0, 0x19), (0x18, 0, 0x18)]);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();

    // The walk gives up on the second chunk, after yielding the first one.
    let all: Vec<_> = iterate_allocations(&mut session, region, false)
        .unwrap()
        .collect();
    assert_eq!(all, [alloc(0x10, 0x10)]);
    assert!(matches!(
        user_allocations(&mut session, region),
        Err(HaystackError::ConstraintViolation { field, .. }) if field == "prev_size"
    ));
}

#[test]
fn walks_never_go_backwards() {
    // A zero size would have the walk spin in place.
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0, 0x1)]);
    let registry = registry(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    let region = mappings.heap().unwrap();

    let chunks: Vec<_> = heap::walk_chunks(&mut session, region)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk.real_size(), 0);
    assert!(!heap::is_heap(&mut session, region));
}

#[test]
fn chunks_have_to_be_registered() {
    let mappings = heap(WordSize::Eight, 0x30, &[(0, 0, 0x19), (0x18, 0x19, 0x19)]);
    let registry = Registry::new(WordSize::Eight);
    let mut session = Session::new(&registry, &mappings).unwrap();
    assert!(matches!(
        iterate_allocations(&mut session, mappings.heap().unwrap(), true),
        Err(HaystackError::UnknownSchema(_))
    ));
}
