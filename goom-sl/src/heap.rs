//! Append-only storage for script variables.
//!
//! Every variable a script declares gets a fixed slot in a [`BumpHeap`] at
//! compile time. Slots are never freed individually; the heap is dropped as a
//! whole when the program is recompiled. Chunks are boxed slices that never
//! grow, so the address of a slot is stable for the lifetime of the heap and
//! can be baked into native code.

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapOffset {
    pub chunk: u32,
    pub offset: u32,
}

impl HeapOffset {
    pub fn new(chunk: u32, offset: u32) -> Self {
        Self { chunk, offset }
    }

    /// Offset `bytes` further into the same chunk.
    pub fn add(self, bytes: usize) -> Self {
        Self {
            chunk: self.chunk,
            offset: self.offset + bytes as u32,
        }
    }

    /// Location of the 4-byte prefix that precedes a tagged allocation.
    pub fn prefix(self) -> Option<Self> {
        let offset = self.offset.checked_sub(PREFIX_TAG_BYTES as u32)?;
        Some(Self {
            chunk: self.chunk,
            offset,
        })
    }
}

impl std::fmt::Display for HeapOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}:{}", self.chunk, self.offset)
    }
}

pub const PREFIX_TAG_BYTES: usize = 4;

#[derive(Debug)]
struct Chunk {
    data: Box<[u8]>,
    used: usize,
}

impl Chunk {
    fn with_capacity(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            used: 0,
        }
    }

    fn try_place(&self, size: usize, align: usize, prefix: usize) -> Option<usize> {
        let start = align_up(self.used + prefix, align);
        let end = start.checked_add(size)?;
        (end <= self.data.len()).then_some(start)
    }
}

#[derive(Debug)]
pub struct BumpHeap {
    chunks: Vec<Chunk>,
    current: Option<usize>,
    granularity: usize,
}

impl Default for BumpHeap {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BumpHeap {
    pub fn new(granularity: usize) -> Self {
        Self {
            chunks: Vec::new(),
            current: None,
            granularity: granularity.max(1),
        }
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Reserves `size` bytes aligned to `align` relative to the chunk start,
    /// with `prefix_bytes` of hidden storage immediately before the result.
    /// Requests larger than the granularity get a dedicated chunk and leave
    /// the regular chunk in place for later small requests.
    pub fn allocate(&mut self, size: usize, align: usize, prefix_bytes: usize) -> HeapOffset {
        let align = align.max(1);
        if let Some(index) = self.current
            && let Some(start) = self.chunks[index].try_place(size, align, prefix_bytes)
        {
            self.chunks[index].used = start + size;
            return HeapOffset::new(index as u32, start as u32);
        }

        let needed = align_up(prefix_bytes, align) + size;
        let oversized = needed > self.granularity;
        let mut chunk = Chunk::with_capacity(needed.max(self.granularity));
        let start = align_up(prefix_bytes, align);
        chunk.used = start + size;
        let index = self.chunks.len();
        self.chunks.push(chunk);
        if !oversized {
            self.current = Some(index);
        }
        HeapOffset::new(index as u32, start as u32)
    }

    fn slice(&self, at: HeapOffset, len: usize) -> Option<&[u8]> {
        let chunk = self.chunks.get(at.chunk as usize)?;
        let start = at.offset as usize;
        chunk.data.get(start..start.checked_add(len)?)
    }

    fn slice_mut(&mut self, at: HeapOffset, len: usize) -> Option<&mut [u8]> {
        let chunk = self.chunks.get_mut(at.chunk as usize)?;
        let start = at.offset as usize;
        chunk.data.get_mut(start..start.checked_add(len)?)
    }

    pub fn contains(&self, at: HeapOffset, len: usize) -> bool {
        self.slice(at, len).is_some()
    }

    pub fn read_i32(&self, at: HeapOffset) -> Option<i32> {
        let bytes = self.slice(at, 4)?;
        Some(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_i32(&mut self, at: HeapOffset, value: i32) -> Option<()> {
        self.slice_mut(at, 4)?
            .copy_from_slice(&value.to_ne_bytes());
        Some(())
    }

    pub fn read_f32(&self, at: HeapOffset) -> Option<f32> {
        self.read_i32(at).map(|bits| f32::from_bits(bits as u32))
    }

    pub fn write_f32(&mut self, at: HeapOffset, value: f32) -> Option<()> {
        self.write_i32(at, value.to_bits() as i32)
    }

    /// Copies `len` bytes between two regions, which may overlap.
    pub fn copy(&mut self, dest: HeapOffset, src: HeapOffset, len: usize) -> Option<()> {
        let bytes = self.slice(src, len)?.to_vec();
        self.slice_mut(dest, len)?.copy_from_slice(&bytes);
        Some(())
    }

    /// Raw address of a slot, for code that embeds absolute addresses.
    pub(crate) fn address_of(&mut self, at: HeapOffset) -> Option<*mut u8> {
        let chunk = self.chunks.get_mut(at.chunk as usize)?;
        let offset = at.offset as usize;
        if offset > chunk.data.len() {
            return None;
        }
        Some(chunk.data.as_mut_ptr().wrapping_add(offset))
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    let rem = value % align;
    if rem == 0 { value } else { value + align - rem }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_relative_to_chunk_start() {
        let mut heap = BumpHeap::new(256);
        let a = heap.allocate(4, 4, 0);
        let b = heap.allocate(8, 16, 0);
        let c = heap.allocate(4, 16, 4);
        assert_eq!(a, HeapOffset::new(0, 0));
        assert_eq!(b.offset % 16, 0);
        assert_eq!(c.offset % 16, 0);
        assert!(c.offset >= b.offset + 8 + 4);
    }

    #[test]
    fn prefix_is_reserved_before_the_returned_offset() {
        let mut heap = BumpHeap::new(64);
        let first = heap.allocate(4, 4, 0);
        let tagged = heap.allocate(8, 16, PREFIX_TAG_BYTES);
        let prefix = tagged.prefix().expect("tagged slot should have a prefix");
        assert!(prefix.offset >= first.offset + 4);
        heap.write_i32(prefix, 7).expect("prefix should be writable");
        heap.write_i32(tagged, 9).expect("slot should be writable");
        assert_eq!(heap.read_i32(prefix), Some(7));
        assert_eq!(heap.read_i32(tagged), Some(9));
    }

    #[test]
    fn zero_sized_allocation_is_valid() {
        let mut heap = BumpHeap::new(32);
        let empty = heap.allocate(0, 4, 0);
        assert!(heap.contains(empty, 0));
        let next = heap.allocate(4, 4, 0);
        assert_eq!(next.chunk, empty.chunk);
    }

    #[test]
    fn grows_by_granularity_and_isolates_oversized_requests() {
        let mut heap = BumpHeap::new(16);
        let a = heap.allocate(12, 4, 0);
        let b = heap.allocate(8, 4, 0);
        assert_eq!(a.chunk, 0);
        assert_eq!(b.chunk, 1);

        let big = heap.allocate(100, 4, 0);
        assert_eq!(big.chunk, 2);
        assert!(heap.contains(big, 100));

        let small = heap.allocate(4, 4, 0);
        assert_eq!(small.chunk, 1, "regular chunk should stay current");
        assert_eq!(heap.chunk_count(), 3);
    }

    #[test]
    fn reads_outside_any_chunk_fail() {
        let mut heap = BumpHeap::new(16);
        let a = heap.allocate(4, 4, 0);
        assert_eq!(heap.read_i32(HeapOffset::new(9, 0)), None);
        assert_eq!(heap.read_i32(a.add(14)), None);
        assert_eq!(heap.write_f32(HeapOffset::new(0, 13), 1.0), None);
    }

    #[test]
    fn float_round_trips_through_bits() {
        let mut heap = BumpHeap::default();
        let at = heap.allocate(4, 4, 0);
        heap.write_f32(at, -2.5).expect("write should succeed");
        assert_eq!(heap.read_f32(at), Some(-2.5));
    }
}
