//! Scratch-arena accounting for per-frame temporaries.
//!
//! Per-frame allocations draw against a fixed byte budget, the way an
//! embedded target would carve temporaries out of a fixed memory region
//! with a bump pointer and lexical push/pop. An [`Arena`] holds the
//! budget; every allocation debits it (rounded up to the alignment
//! quantum), and the returned [`ScratchBuf`] credits it back on drop, so
//! temporaries vanish with their scope and a moved-out buffer is a
//! persistent allocation.
//!
//! Allocation needs only `&self`, so one arena serves many temporaries in
//! a call tree; Rust's aliasing rules already guarantee that distinct
//! arenas never overlap.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use crate::{TrackError, TrackResult};

/// Alignment quantum: debits are rounded up to this many bytes, matching
/// the stride alignment of the image buffers.
pub const DEFAULT_QUANTUM: usize = 16;

/// A byte-budgeted scratch arena.
#[derive(Debug)]
pub struct Arena {
    capacity: usize,
    quantum: usize,
    used: Cell<usize>,
    high_water: Cell<usize>,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self::with_quantum(capacity, DEFAULT_QUANTUM)
    }

    /// `quantum` must be a power of two.
    pub fn with_quantum(capacity: usize, quantum: usize) -> Self {
        assert!(quantum.is_power_of_two(), "quantum must be a power of two");
        Self {
            capacity,
            quantum,
            used: Cell::new(0),
            high_water: Cell::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used.get()
    }

    /// Largest debit observed over the arena's lifetime, for sizing the
    /// real budget after a profiling run.
    pub fn high_water(&self) -> usize {
        self.high_water.get()
    }

    #[inline]
    fn rounded(&self, bytes: usize) -> usize {
        (bytes + self.quantum - 1) & !(self.quantum - 1)
    }

    fn debit(&self, bytes: usize) -> TrackResult<usize> {
        let rounded = self.rounded(bytes);
        let used = self.used.get();
        if used + rounded > self.capacity {
            return Err(TrackError::OutOfMemory {
                requested: rounded,
                available: self.capacity - used,
            });
        }
        self.used.set(used + rounded);
        if self.used.get() > self.high_water.get() {
            self.high_water.set(self.used.get());
        }
        Ok(rounded)
    }

    fn credit(&self, bytes: usize) {
        self.used.set(self.used.get() - bytes);
    }

    /// Allocate a zero-initialized buffer of `len` elements.
    pub fn alloc<T: Default + Clone>(&self, len: usize) -> TrackResult<ScratchBuf<'_, T>> {
        let bytes = self.debit(len * std::mem::size_of::<T>())?;
        Ok(ScratchBuf {
            data: vec![T::default(); len],
            arena: self,
            bytes,
        })
    }

    /// Allocate an empty buffer with room for `capacity` elements.
    pub fn alloc_with_capacity<T>(&self, capacity: usize) -> TrackResult<ScratchBuf<'_, T>> {
        let bytes = self.debit(capacity * std::mem::size_of::<T>())?;
        Ok(ScratchBuf {
            data: Vec::with_capacity(capacity),
            arena: self,
            bytes,
        })
    }
}

/// A buffer debited from an [`Arena`]; the debit is returned on drop.
#[derive(Debug)]
pub struct ScratchBuf<'a, T> {
    data: Vec<T>,
    arena: &'a Arena,
    bytes: usize,
}

impl<T> ScratchBuf<'_, T> {
    /// Move the contents out as an ordinary owned vector, releasing the
    /// arena debit. This is how a temporary graduates to persistent state.
    pub fn into_vec(mut self) -> Vec<T> {
        std::mem::take(&mut self.data)
    }
}

impl<T> Deref for ScratchBuf<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.data
    }
}

impl<T> DerefMut for ScratchBuf<'_, T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.data
    }
}

impl<T> Drop for ScratchBuf<'_, T> {
    fn drop(&mut self) {
        self.arena.credit(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debits_round_up_to_quantum() {
        let arena = Arena::with_quantum(64, 16);
        let a = arena.alloc::<u8>(1).unwrap();
        assert_eq!(arena.used(), 16);
        let b = arena.alloc::<f32>(5).unwrap(); // 20 bytes -> 32
        assert_eq!(arena.used(), 48);
        drop(a);
        drop(b);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.high_water(), 48);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let arena = Arena::new(32);
        let _a = arena.alloc::<u8>(32).unwrap();
        let err = arena.alloc::<u8>(1).unwrap_err();
        assert_eq!(
            err,
            TrackError::OutOfMemory {
                requested: 16,
                available: 0
            }
        );
    }

    #[test]
    fn scoped_buffers_release_on_drop() {
        let arena = Arena::new(1024);
        {
            let _tmp = arena.alloc::<f32>(64).unwrap();
            assert!(arena.used() > 0);
        }
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn into_vec_releases_the_debit() {
        let arena = Arena::new(1024);
        let buf = arena.alloc::<u16>(8).unwrap();
        let v = buf.into_vec();
        assert_eq!(v.len(), 8);
        assert_eq!(arena.used(), 0);
    }
}
