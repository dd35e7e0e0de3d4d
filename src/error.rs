use thiserror::Error;

/// Failures reported by the heap operations.
///
/// Every error is detected before the heap is mutated, so a failed call
/// leaves the block list exactly as it was.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
  /// A size argument of zero was passed to `init` or `allocate`.
  #[error("requested size must be positive")]
  InvalidSize,

  /// `init` was called on a heap that already owns a region.
  #[error("heap region has already been initialized")]
  AlreadyInitialized,

  /// `allocate` or `deallocate` was called before a successful `init`.
  #[error("heap region has not been initialized")]
  Uninitialized,

  /// The operating system refused to map the requested region.
  #[error("operating system could not map the heap region")]
  MapFailed,

  /// No free block is large enough for the request.
  #[error("no free block can hold {size} bytes")]
  OutOfMemory { size: usize },

  /// The pointer is null, misaligned, or not the payload of any block.
  #[error("pointer {addr:#x} does not address an allocated payload")]
  InvalidPointer { addr: usize },

  /// The addressed block is already free.
  #[error("block holding {addr:#x} is already free")]
  DoubleFree { addr: usize },
}

pub type Result<T> = core::result::Result<T, AllocError>;
