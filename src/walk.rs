use std::io::{self, Write};

use crate::bestfit::{BestFitAllocator, FIRST_BLOCK};
use crate::block::Header;
use crate::region::Region;

/// Snapshot of one block, as produced by the heap walker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// 1-based position of the block in address order.
  pub ordinal: usize,
  /// Byte offset of the block header inside the region.
  pub offset: usize,
  /// Total block size in bytes, header included.
  pub size: usize,
  /// Whether the block is currently in use.
  pub allocated: bool,
  /// Whether the block immediately before this one is in use.
  pub prev_allocated: bool,
}

/// Iterator over the block list, first block to end marker, in address
/// order. Purely observational: it reads header words and never writes.
pub struct Blocks<'a> {
  region: Option<&'a Region>,
  offset: usize,
  ordinal: usize,
}

impl<'a> Blocks<'a> {
  pub(crate) fn new(region: Option<&'a Region>) -> Self {
    Self {
      region,
      offset: FIRST_BLOCK,
      ordinal: 0,
    }
  }
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let region = self.region?;
    let header = Header::from_raw(region.word(self.offset));

    if header.is_end_marker() {
      self.region = None;
      return None;
    }

    self.ordinal += 1;

    let info = BlockInfo {
      ordinal: self.ordinal,
      offset: self.offset,
      size: header.size(),
      allocated: header.is_allocated(),
      prev_allocated: header.is_prev_allocated(),
    };

    self.offset += header.size();

    Some(info)
  }
}

fn status(allocated: bool) -> &'static str {
  if allocated { "used" } else { "free" }
}

/// Writes the block-list report: one row per block with its status, the
/// status of its predecessor, begin and end addresses, and size, followed by
/// the used, free, and grand-total byte counts.
pub(crate) fn dump_to<W: Write>(
  heap: &BestFitAllocator,
  out: &mut W,
) -> io::Result<()> {
  let base = heap.base_addr();

  let mut used = 0;
  let mut free = 0;

  writeln!(out, "{:*^80}", " Block list ")?;
  writeln!(out, "No.\tStatus\tPrev\tt_Begin\t\tt_End\t\tt_Size")?;
  writeln!(out, "{:-<80}", "")?;

  for block in heap.blocks() {
    let begin = base + block.offset;
    let end = begin + block.size - 1;

    if block.allocated {
      used += block.size;
    } else {
      free += block.size;
    }

    writeln!(
      out,
      "{}\t{}\t{}\t{:#012x}\t{:#012x}\t{}",
      block.ordinal,
      status(block.allocated),
      status(block.prev_allocated),
      begin,
      end,
      block.size,
    )?;
  }

  writeln!(out, "{:-<80}", "")?;
  writeln!(out, "Total used size = {used}")?;
  writeln!(out, "Total free size = {free}")?;
  writeln!(out, "Total size = {}", used + free)?;
  writeln!(out, "{:*^80}", "")?;

  Ok(())
}
