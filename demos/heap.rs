use std::ptr;

use rmalloc::{AllocError, BestFitAllocator};

/// Prints a stage banner so the dump tables are easy to tell apart.
fn stage(label: &str) {
  println!("\n### {label}");
}

fn main() -> Result<(), AllocError> {
  env_logger::init();

  // The allocator manages a single mmap'd region; every allocation below is
  // carved out of it. Run with RUST_LOG=debug to watch the placement and
  // coalescing decisions as they happen.
  let mut heap = BestFitAllocator::new();

  // --------------------------------------------------------------------
  // 1) Initialize the heap with 4 KiB (rounded up to the OS page size).
  //    The dump shows one big free block and nothing else.
  // --------------------------------------------------------------------
  heap.init(4096)?;
  stage("1) freshly initialized heap");
  heap.dump();

  // --------------------------------------------------------------------
  // 2) Allocate three blocks and write into them to show the memory is
  //    really usable. Each request is rounded up internally; the dump
  //    shows the resulting block sizes.
  // --------------------------------------------------------------------
  let a = heap.allocate(100)?;
  let b = heap.allocate(200)?;
  let c = heap.allocate(50)?;

  unsafe {
    ptr::write_bytes(a.as_ptr(), 0xAA, 100);
    ptr::write_bytes(b.as_ptr(), 0xBB, 200);
    ptr::write_bytes(c.as_ptr(), 0xCC, 50);
  }

  stage("2) three live allocations");
  println!("a = {a:?}, b = {b:?}, c = {c:?}");
  heap.dump();

  // --------------------------------------------------------------------
  // 3) Free the middle block. A hole opens up between a and c; its
  //    successor's Prev column flips to free.
  // --------------------------------------------------------------------
  heap.deallocate(b.as_ptr())?;
  stage("3) middle block freed");
  heap.dump();

  // --------------------------------------------------------------------
  // 4) Free the first block too. It cannot merge backward (it is the
  //    first block) but merges forward into the hole, leaving one bigger
  //    free block where a and b used to be.
  // --------------------------------------------------------------------
  heap.deallocate(a.as_ptr())?;
  stage("4) first block freed and coalesced with the hole");
  heap.dump();

  // --------------------------------------------------------------------
  // 5) Best-fit in action: a small request skips the big tail block and
  //    reuses the tighter hole at the front of the heap.
  // --------------------------------------------------------------------
  let d = heap.allocate(100)?;
  stage("5) small request reuses the hole (best fit)");
  println!("d = {d:?} (same address as a: {})", d == a);
  heap.dump();

  // --------------------------------------------------------------------
  // 6) Misuse is reported, not silently tolerated. A block can only be
  //    freed once, and only through the exact pointer that was handed out.
  // --------------------------------------------------------------------
  stage("6) error reporting");
  heap.deallocate(d.as_ptr())?;
  println!("double free:     {:?}", heap.deallocate(d.as_ptr()).unwrap_err());
  println!("null pointer:    {:?}", heap.deallocate(ptr::null_mut()).unwrap_err());
  println!(
    "interior bytes:  {:?}",
    heap.deallocate(c.as_ptr().wrapping_add(8)).unwrap_err()
  );
  println!("huge request:    {:?}", heap.allocate(1 << 20).unwrap_err());

  // --------------------------------------------------------------------
  // 7) Return the last block. The heap collapses back into the single
  //    free block it started with; the region itself is unmapped when
  //    `heap` goes out of scope.
  // --------------------------------------------------------------------
  heap.deallocate(c.as_ptr())?;
  stage("7) everything freed again");
  heap.dump();

  Ok(())
}
