use std::ptr::{self, NonNull};

use libc::{_SC_PAGESIZE, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::{debug, error};

use crate::block::WORD;
use crate::error::{AllocError, Result};

/// A fixed-size, privately mapped, zero-filled stretch of process memory.
///
/// The region is obtained from the OS exactly once and given back when the
/// value is dropped. Positions inside the region are byte offsets from its
/// base; all raw memory access is funneled through the bounds-checked word
/// accessors below, so the rest of the crate never touches a raw pointer.
pub struct Region {
  base: NonNull<u8>,
  len: usize,
}

impl Region {
  /// Queries the OS page size.
  pub fn page_size() -> usize {
    // SAFETY: sysconf only reads kernel configuration.
    unsafe { libc::sysconf(_SC_PAGESIZE) as usize }
  }

  /// Maps a zero-filled anonymous region of exactly `len` bytes.
  ///
  /// `len` must be positive and a multiple of the page size; the caller does
  /// the rounding.
  pub fn map(len: usize) -> Result<Self> {
    // SAFETY: a fresh anonymous private mapping cannot alias any memory the
    // program already holds.
    let addr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if addr == MAP_FAILED {
      error!("mmap refused a {len} byte region");
      return Err(AllocError::MapFailed);
    }

    debug!("mapped {len} byte region at {addr:?}");

    Ok(Region {
      base: NonNull::new(addr.cast()).ok_or(AllocError::MapFailed)?,
      len,
    })
  }

  /// Number of mapped bytes.
  pub fn len(&self) -> usize {
    self.len
  }

  /// Base address of the mapping, for diagnostics only.
  pub fn base_addr(&self) -> usize {
    self.base.as_ptr() as usize
  }

  /// Reads the word stored `offset` bytes past the region base.
  pub fn word(&self, offset: usize) -> usize {
    assert!(offset % WORD == 0 && offset + WORD <= self.len);

    // SAFETY: the offset is in bounds and word-aligned (the base itself is
    // page-aligned), and the mapping is readable for the region's lifetime.
    unsafe { self.base.as_ptr().add(offset).cast::<usize>().read() }
  }

  /// Stores `value` in the word `offset` bytes past the region base.
  pub fn set_word(
    &mut self,
    offset: usize,
    value: usize,
  ) {
    assert!(offset % WORD == 0 && offset + WORD <= self.len);

    // SAFETY: same bounds and alignment argument as `word`, and `&mut self`
    // guarantees exclusive access.
    unsafe { self.base.as_ptr().add(offset).cast::<usize>().write(value) }
  }

  /// Turns a payload offset into the pointer handed out to callers.
  pub fn payload_ptr(&self, offset: usize) -> NonNull<u8> {
    assert!(offset <= self.len);

    // SAFETY: the base is non-null and the offset stays inside the mapping.
    unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
  }

  /// Turns a caller pointer back into a byte offset, if it lies inside the
  /// mapped region. Only compares addresses; never dereferences `ptr`.
  pub fn offset_of(&self, ptr: *mut u8) -> Option<usize> {
    let addr = ptr as usize;
    let base = self.base.as_ptr() as usize;

    if addr < base || addr >= base + self.len {
      return None;
    }

    Some(addr - base)
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    // SAFETY: base and len describe the mapping created in `map`, and no
    // pointers into it outlive the owning heap.
    unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
  }
}
