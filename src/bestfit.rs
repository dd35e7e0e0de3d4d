use std::io;
use std::ptr::NonNull;

use log::debug;

use crate::align;
use crate::block::{ALIGN, END_MARKER, Header, WORD};
use crate::error::{AllocError, Result};
use crate::region::Region;
use crate::walk::{self, Blocks};

/// Byte offset of the first block header inside the mapped region.
///
/// One word of padding precedes it so that payloads, which start one header
/// word into their block, land on 8-byte boundaries.
pub(crate) const FIRST_BLOCK: usize = WORD;

/// Fixed per-region overhead: the leading padding word plus the end marker.
pub(crate) const REGION_OVERHEAD: usize = 2 * WORD;

/// A best-fit heap over one fixed memory region.
///
/// The allocator owns its region handle and initialization state; create it
/// with [`new`](BestFitAllocator::new), attach memory once with
/// [`init`](BestFitAllocator::init), then carve it up with
/// [`allocate`](BestFitAllocator::allocate) and hand blocks back with
/// [`deallocate`](BestFitAllocator::deallocate).
///
/// Placement is a deliberate linear best-fit scan over the implicit list of
/// address-ordered blocks; there is no free-list index, so allocation cost
/// grows with the number of blocks. Free blocks are coalesced with both
/// neighbors the moment they are freed, which keeps the list free of
/// adjacent free blocks at all times.
///
/// All mutating operations take `&mut self`; the allocator is meant for
/// single-threaded use and contains no internal locking.
pub struct BestFitAllocator {
  region: Option<Region>,
}

impl BestFitAllocator {
  /// Creates an allocator with no region attached yet.
  ///
  /// Every operation except [`init`](BestFitAllocator::init) fails with
  /// [`AllocError::Uninitialized`] until a region is attached.
  pub const fn new() -> Self {
    Self { region: None }
  }

  /// Whether [`init`](BestFitAllocator::init) has completed successfully.
  pub fn is_initialized(&self) -> bool {
    self.region.is_some()
  }

  /// Maps the heap region and lays out the initial block list.
  ///
  /// The requested capacity is rounded up to the next multiple of the OS
  /// page size, so the region may be larger than asked for. Succeeds at
  /// most once per allocator; a failed map attempt leaves the allocator
  /// uninitialized so the call may be retried.
  pub fn init(
    &mut self,
    capacity: usize,
  ) -> Result<()> {
    if self.region.is_some() {
      return Err(AllocError::AlreadyInitialized);
    }

    if capacity == 0 {
      return Err(AllocError::InvalidSize);
    }

    let page = Region::page_size();
    let mapped = capacity
      .checked_add(page - 1)
      .ok_or(AllocError::InvalidSize)?
      & !(page - 1);

    let mut region = Region::map(mapped)?;

    // One free block covering everything between the leading padding word
    // and the sentinel: header with the predecessor treated as allocated
    // (there is none), matching footer, then the end marker.
    let size = mapped - REGION_OVERHEAD;
    region.set_word(FIRST_BLOCK, Header::encode(size, false, true).raw());
    region.set_word(FIRST_BLOCK + size - WORD, size);
    region.set_word(FIRST_BLOCK + size, END_MARKER);

    debug!("heap initialized: {mapped} bytes mapped, {size} usable");

    self.region = Some(region);

    Ok(())
  }

  /// Reserves `payload_size` usable bytes and returns their address.
  ///
  /// The returned pointer is always 8-byte aligned and stays valid until it
  /// is passed to [`deallocate`](BestFitAllocator::deallocate) or the
  /// allocator is dropped. Internally the block may be larger than
  /// requested; the caller only ever observes the guaranteed minimum.
  pub fn allocate(
    &mut self,
    payload_size: usize,
  ) -> Result<NonNull<u8>> {
    if payload_size == 0 {
      return Err(AllocError::InvalidSize);
    }

    let region = self.region.as_mut().ok_or(AllocError::Uninitialized)?;

    if payload_size > region.len() {
      return Err(AllocError::OutOfMemory { size: payload_size });
    }

    let needed = align!(payload_size + WORD);

    // Best-fit scan over the whole block list. The running `prev_allocated`
    // flag mirrors what the chosen block's header must record.
    let mut best: Option<(usize, usize)> = None;
    let mut best_prev_allocated = true;
    let mut prev_allocated = true;

    let mut offset = FIRST_BLOCK;
    loop {
      let header = Header::from_raw(region.word(offset));

      if header.is_end_marker() {
        break;
      }

      if header.is_allocated() {
        prev_allocated = true;
      } else {
        let size = header.size();

        // Strictly-smaller comparison, so the first of equally tight fits
        // wins.
        if size >= needed && best.is_none_or(|(_, best_size)| size < best_size) {
          best = Some((offset, size));
          best_prev_allocated = prev_allocated;
        }

        prev_allocated = false;
      }

      offset += header.size();
    }

    let (chosen, old_size) =
      best.ok_or(AllocError::OutOfMemory { size: payload_size })?;

    let mut block_size = needed;
    let mut remainder = old_size - needed;

    // A leftover of exactly one word cannot hold a free block's header and
    // footer, so those bytes travel with the allocation instead.
    if remainder == WORD {
      block_size += WORD;
      remainder = 0;
    }

    region.set_word(
      chosen,
      Header::encode(block_size, true, best_prev_allocated).raw(),
    );

    if remainder == 0 {
      // Exact fit: the successor now follows an allocated block. The end
      // marker carries no status bits and is left alone.
      let next = chosen + block_size;
      let next_header = Header::from_raw(region.word(next));

      if !next_header.is_end_marker() {
        region.set_word(next, next_header.with_prev_allocated(true).raw());
      }
    } else {
      // Split the tail off into a new free block directly behind the
      // allocation.
      let split = chosen + block_size;
      region.set_word(split, Header::encode(remainder, false, true).raw());
      region.set_word(split + remainder - WORD, remainder);
    }

    debug!(
      "allocated {block_size} byte block at offset {chosen:#x} for a {payload_size} byte payload"
    );

    Ok(region.payload_ptr(chosen + WORD))
  }

  /// Releases the block whose payload starts at `ptr`.
  ///
  /// The pointer must have been returned by a previous
  /// [`allocate`](BestFitAllocator::allocate) on this heap and not freed
  /// since. The freed block is merged with free neighbors on the spot, so
  /// the caller cannot tell from the result whether coalescing happened.
  pub fn deallocate(
    &mut self,
    ptr: *mut u8,
  ) -> Result<()> {
    let region = self.region.as_mut().ok_or(AllocError::Uninitialized)?;

    let addr = ptr as usize;

    if ptr.is_null() || !addr.is_multiple_of(ALIGN) {
      return Err(AllocError::InvalidPointer { addr });
    }

    let payload = region
      .offset_of(ptr)
      .ok_or(AllocError::InvalidPointer { addr })?;

    // The pointer must name the payload of a listed block; walk the list
    // rather than trusting caller arithmetic. Validation finishes before
    // any word is written.
    let mut offset = FIRST_BLOCK;
    let header = loop {
      let header = Header::from_raw(region.word(offset));

      if header.is_end_marker() {
        return Err(AllocError::InvalidPointer { addr });
      }

      if offset + WORD == payload {
        break header;
      }

      offset += header.size();
    };

    if !header.is_allocated() {
      return Err(AllocError::DoubleFree { addr });
    }

    let mut start = offset;
    let mut size = header.size();
    let mut prev_allocated = header.is_prev_allocated();

    // The predecessor is free: its footer sits in the word directly before
    // this header and holds its plain size. The freed block is absorbed
    // into it and ceases to exist as a distinct entity.
    if !prev_allocated {
      let prev_size = region.word(start - WORD);
      start -= prev_size;
      size += prev_size;
      prev_allocated = Header::from_raw(region.word(start)).is_prev_allocated();

      debug!("coalesced backward into block at offset {start:#x}");
    }

    // The successor either records that it now follows a free block, or is
    // itself free and gets absorbed too. The end marker stays untouched.
    let next = start + size;
    let next_header = Header::from_raw(region.word(next));

    if !next_header.is_end_marker() {
      if next_header.is_allocated() {
        region.set_word(next, next_header.with_prev_allocated(false).raw());
      } else {
        size += next_header.size();

        debug!("coalesced forward over block at offset {next:#x}");
      }
    }

    region.set_word(start, Header::encode(size, false, prev_allocated).raw());
    region.set_word(start + size - WORD, size);

    debug!("freed block at offset {start:#x}, {size} bytes");

    Ok(())
  }

  /// Read-only traversal of the block list in address order.
  ///
  /// Yields nothing before [`init`](BestFitAllocator::init).
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks::new(self.region.as_ref())
  }

  /// Writes the block-list report to `out`.
  pub fn dump_to<W: io::Write>(
    &self,
    out: &mut W,
  ) -> io::Result<()> {
    walk::dump_to(self, out)
  }

  /// Prints the block-list report to stdout.
  pub fn dump(&self) {
    let _ = walk::dump_to(self, &mut io::stdout());
  }

  /// Base address of the mapped region, zero before `init`.
  pub(crate) fn base_addr(&self) -> usize {
    self.region.as_ref().map_or(0, Region::base_addr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::ALIGN;
  use std::ptr;

  fn heap(capacity: usize) -> BestFitAllocator {
    let mut heap = BestFitAllocator::new();
    heap.init(capacity).unwrap();
    heap
  }

  fn usable(heap: &BestFitAllocator) -> usize {
    heap.blocks().map(|block| block.size).sum()
  }

  /// Checks every structural invariant the block list must uphold: blocks
  /// tile the usable space with positive 8-multiple sizes, no two adjacent
  /// blocks are free, every prev-allocated bit matches the true predecessor
  /// status, free blocks carry matching footers, and the sentinel word is
  /// still exactly the value written at initialization.
  fn assert_invariants(heap: &BestFitAllocator) {
    let region = heap.region.as_ref().unwrap();
    let expected = region.len() - REGION_OVERHEAD;

    let mut offset = FIRST_BLOCK;
    let mut prev_free = false;

    for block in heap.blocks() {
      assert_eq!(block.offset, offset, "blocks must tile the region");
      assert!(block.size > 0);
      assert!(block.size.is_multiple_of(ALIGN));
      assert_eq!(block.prev_allocated, !prev_free);

      if !block.allocated {
        assert!(!prev_free, "adjacent free blocks must have been coalesced");
        assert_eq!(region.word(block.offset + block.size - WORD), block.size);
      }

      prev_free = !block.allocated;
      offset += block.size;
    }

    assert_eq!(offset - FIRST_BLOCK, expected);
    assert_eq!(region.word(FIRST_BLOCK + expected), END_MARKER);
  }

  #[test]
  fn test_init_lays_out_single_free_block() {
    let heap = heap(4096);

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].allocated);
    assert!(blocks[0].prev_allocated);
    assert_eq!(blocks[0].size, 4096 - REGION_OVERHEAD);

    assert_invariants(&heap);
  }

  #[test]
  fn test_init_rounds_capacity_to_page_size() {
    let heap = heap(1);

    assert_eq!(usable(&heap), Region::page_size() - REGION_OVERHEAD);
    assert_invariants(&heap);
  }

  #[test]
  fn test_init_rejects_zero_and_overflowing_capacity() {
    let mut heap = BestFitAllocator::new();

    assert_eq!(heap.init(0), Err(AllocError::InvalidSize));
    assert_eq!(heap.init(usize::MAX), Err(AllocError::InvalidSize));
    assert!(!heap.is_initialized());
  }

  #[test]
  fn test_init_is_one_shot() {
    let mut heap = heap(4096);

    assert_eq!(heap.init(4096), Err(AllocError::AlreadyInitialized));
    assert!(heap.is_initialized());
  }

  #[test]
  fn test_failed_map_leaves_heap_uninitialized() {
    let mut heap = BestFitAllocator::new();

    // Far beyond the user address space, so the kernel must refuse it.
    assert_eq!(heap.init(1 << 55), Err(AllocError::MapFailed));
    assert!(!heap.is_initialized());

    assert!(heap.init(4096).is_ok());
  }

  #[test]
  fn test_operations_require_init() {
    let mut heap = BestFitAllocator::new();

    assert_eq!(heap.allocate(8), Err(AllocError::Uninitialized));
    assert_eq!(heap.deallocate(ptr::null_mut()), Err(AllocError::Uninitialized));
    assert_eq!(heap.blocks().count(), 0);
  }

  #[test]
  fn test_allocate_rejects_zero_size() {
    let mut heap = heap(4096);

    assert_eq!(heap.allocate(0), Err(AllocError::InvalidSize));
  }

  #[test]
  fn test_allocations_are_aligned() {
    let mut heap = heap(4096);

    for size in [1, 2, 3, 7, 8, 9, 15, 100, 101] {
      let ptr = heap.allocate(size).unwrap();

      assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
      assert_invariants(&heap);
    }
  }

  #[test]
  fn test_out_of_memory() {
    let mut heap = heap(4096);

    assert_eq!(
      heap.allocate(2 * 4096),
      Err(AllocError::OutOfMemory { size: 2 * 4096 })
    );

    // The full capacity is still unusable: the header word has to fit too.
    assert_eq!(
      heap.allocate(4096),
      Err(AllocError::OutOfMemory { size: 4096 })
    );

    assert_invariants(&heap);
  }

  #[test]
  fn test_split_leaves_free_remainder() {
    let mut heap = heap(4096);
    let total = usable(&heap);

    heap.allocate(24).unwrap();

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].allocated);
    assert_eq!(blocks[0].size, 32);
    assert!(!blocks[1].allocated);
    assert!(blocks[1].prev_allocated);
    assert_eq!(blocks[1].size, total - 32);

    assert_invariants(&heap);
  }

  #[test]
  fn test_best_fit_picks_tightest_block() {
    let mut heap = heap(4096);

    // Free runs of 32, 64, and 48 bytes in address order, with allocated
    // guards in between so none of them coalesce.
    let a = heap.allocate(24).unwrap();
    heap.allocate(8).unwrap();
    let b = heap.allocate(56).unwrap();
    heap.allocate(8).unwrap();
    let c = heap.allocate(40).unwrap();
    heap.allocate(8).unwrap();

    heap.deallocate(a.as_ptr()).unwrap();
    heap.deallocate(b.as_ptr()).unwrap();
    heap.deallocate(c.as_ptr()).unwrap();
    assert_invariants(&heap);

    // Needs a 40-byte block: the 48-byte run fits tighter than the 64-byte
    // one, and tighter than the big tail block.
    let reused = heap.allocate(32).unwrap();

    assert_eq!(reused, c);
    assert_invariants(&heap);
  }

  #[test]
  fn test_exact_word_remainder_is_folded_into_allocation() {
    let mut heap = heap(4096);

    // A lone free 40-byte block fenced off by an allocated guard.
    let a = heap.allocate(32).unwrap();
    heap.allocate(8).unwrap();
    heap.deallocate(a.as_ptr()).unwrap();

    // Needs 32 of those 40 bytes; the 8-byte leftover cannot stand alone,
    // so the allocation absorbs it instead of splitting.
    let reused = heap.allocate(24).unwrap();
    assert_eq!(reused, a);

    let region = heap.region.as_ref().unwrap();
    let offset = region.offset_of(reused.as_ptr()).unwrap() - WORD;
    let folded = heap.blocks().find(|block| block.offset == offset).unwrap();

    assert!(folded.allocated);
    assert_eq!(folded.size, 40);
    assert!(heap.blocks().all(|block| block.size > WORD));
    assert_invariants(&heap);
  }

  #[test]
  fn test_freshly_freed_block_is_reused() {
    let mut heap = heap(4096);

    let p1 = heap.allocate(100).unwrap();
    let p2 = heap.allocate(200).unwrap();
    assert_ne!(p1, p2);

    heap.deallocate(p1.as_ptr()).unwrap();

    let p3 = heap.allocate(90).unwrap();
    assert_eq!(p3, p1);
    assert_invariants(&heap);
  }

  #[test]
  fn test_free_coalesces_backward_and_forward() {
    let mut heap = heap(4096);
    let total = usable(&heap);

    let a = heap.allocate(24).unwrap();
    let b = heap.allocate(24).unwrap();
    let c = heap.allocate(24).unwrap();
    heap.allocate(8).unwrap();

    // Free the outer two first, then the middle one: it must merge with
    // both neighbors in one call.
    heap.deallocate(a.as_ptr()).unwrap();
    heap.deallocate(c.as_ptr()).unwrap();
    assert_invariants(&heap);

    heap.deallocate(b.as_ptr()).unwrap();
    assert_invariants(&heap);

    let merged = heap.blocks().next().unwrap();
    assert!(!merged.allocated);
    assert_eq!(merged.size, 3 * 32);
    assert_eq!(heap.blocks().count(), 3);

    let free_total: usize = heap
      .blocks()
      .filter(|block| !block.allocated)
      .map(|block| block.size)
      .sum();
    assert_eq!(free_total, total - 16);
  }

  #[test]
  fn test_full_round_trip_restores_single_free_block() {
    let mut heap = heap(4096);
    let total = usable(&heap);

    let mut ptrs = Vec::new();
    for size in [24, 100, 8, 64, 200, 1] {
      ptrs.push(heap.allocate(size).unwrap());
    }

    // Free in a deliberately scrambled order.
    for index in [1, 4, 0, 5, 2, 3] {
      heap.deallocate(ptrs[index].as_ptr()).unwrap();
      assert_invariants(&heap);
    }

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].allocated);
    assert_eq!(blocks[0].size, total);
  }

  #[test]
  fn test_double_free_is_detected() {
    let mut heap = heap(4096);

    let p = heap.allocate(100).unwrap();
    heap.deallocate(p.as_ptr()).unwrap();

    assert_eq!(
      heap.deallocate(p.as_ptr()),
      Err(AllocError::DoubleFree {
        addr: p.as_ptr() as usize
      })
    );
    assert_invariants(&heap);
  }

  #[test]
  fn test_invalid_pointers_are_rejected_without_mutation() {
    let mut heap = heap(4096);

    let p = heap.allocate(24).unwrap();
    let before: Vec<_> = heap.blocks().collect();

    let null = ptr::null_mut();
    let misaligned = p.as_ptr().wrapping_add(4);
    let interior = p.as_ptr().wrapping_add(8);
    let outside = &mut 0usize as *mut usize as *mut u8;

    for bad in [null, misaligned, interior, outside] {
      assert_eq!(
        heap.deallocate(bad),
        Err(AllocError::InvalidPointer { addr: bad as usize })
      );
    }

    let after: Vec<_> = heap.blocks().collect();
    assert_eq!(before, after);
    assert_invariants(&heap);
  }

  #[test]
  fn test_payload_is_writable_across_neighboring_frees() {
    let mut heap = heap(4096);

    let a = heap.allocate(32).unwrap();
    let b = heap.allocate(32).unwrap();

    // SAFETY: both pointers address freshly allocated 32-byte payloads.
    unsafe {
      ptr::write_bytes(a.as_ptr(), 0xAB, 32);
      ptr::write_bytes(b.as_ptr(), 0xCD, 32);
    }

    heap.deallocate(a.as_ptr()).unwrap();

    // Freeing `a` rewrote only metadata words outside b's payload.
    for i in 0..32 {
      // SAFETY: b is still allocated.
      assert_eq!(unsafe { b.as_ptr().add(i).read() }, 0xCD);
    }
  }
}
