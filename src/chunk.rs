//! Chunk metadata: dirty-bounds tracking and the flags that decide whether a
//! chunk is processed this frame.
//!
//! Every field is atomic. Per §5, chunk metadata "receives racy OR-writes of
//! flags and min/max bounds" from neighbor-wake calls made by whichever
//! checkerboard task happens to border this chunk; `IsDirty` is idempotent
//! and the bounds are monotone under the writes this module allows, so
//! `Relaxed` ordering is enough — the happens-before edge these still need
//! (this frame's writes visible to the chunk's own next-frame read) comes
//! from the scheduler's group-to-group join barrier, not from the atomics
//! themselves.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

pub const CHUNK_SIZE: u16 = 64;
pub const CHUNK_AREA: usize = CHUNK_SIZE as usize * CHUNK_SIZE as usize;

const IS_DIRTY: u8 = 0b0000_0001;
const HAS_STRUCTURE: u8 = 0b0000_0010;

const ORD: Ordering = Ordering::Relaxed;

/// Local dirty-bounds rectangle. `min > max` on an axis is the "inverted"
/// sentinel meaning "no specific bounds, simulate the entire chunk".
#[derive(Debug)]
pub struct ChunkState {
    min_x: AtomicU16,
    max_x: AtomicU16,
    min_y: AtomicU16,
    max_y: AtomicU16,
    flags: AtomicU8,
    active_last_frame: AtomicBool,
    structure_mask: AtomicU16,
}

/// Plain-value snapshot of a [`ChunkState`], for call sites (tests, the
/// kernel's bounds read) that want a consistent read of all four bounds at
/// once rather than four independent atomic loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    pub min_x: u16,
    pub max_x: u16,
    pub min_y: u16,
    pub max_y: u16,
}

impl ChunkState {
    pub fn new() -> Self {
        let s = ChunkState {
            min_x: AtomicU16::new(0),
            max_x: AtomicU16::new(0),
            min_y: AtomicU16::new(0),
            max_y: AtomicU16::new(0),
            flags: AtomicU8::new(0),
            active_last_frame: AtomicBool::new(false),
            structure_mask: AtomicU16::new(0),
        };
        s.invert_bounds();
        s
    }

    pub fn invert_bounds(&self) {
        self.min_x.store(1, ORD);
        self.max_x.store(0, ORD);
        self.min_y.store(1, ORD);
        self.max_y.store(0, ORD);
    }

    pub fn bounds(&self) -> ChunkBounds {
        ChunkBounds {
            min_x: self.min_x.load(ORD),
            max_x: self.max_x.load(ORD),
            min_y: self.min_y.load(ORD),
            max_y: self.max_y.load(ORD),
        }
    }

    pub fn bounds_are_inverted(&self) -> bool {
        let b = self.bounds();
        b.min_x > b.max_x || b.min_y > b.max_y
    }

    /// Expand the dirty bounds to include local position `(lx, ly)`, marking
    /// the chunk dirty. Bounds are widened monotonically and never narrowed
    /// except by `reset`. Only ever called by the one task that owns this
    /// frame's processing of this particular chunk (never cross-task), so
    /// the inverted-bounds check-then-set below needs no compare-exchange.
    pub fn mark_dirty_at(&self, lx: u16, ly: u16) {
        if self.bounds_are_inverted() {
            self.min_x.store(lx, ORD);
            self.max_x.store(lx, ORD);
            self.min_y.store(ly, ORD);
            self.max_y.store(ly, ORD);
        } else {
            self.min_x.fetch_min(lx, ORD);
            self.max_x.fetch_max(lx, ORD);
            self.min_y.fetch_min(ly, ORD);
            self.max_y.fetch_max(ly, ORD);
        }
        self.flags.fetch_or(IS_DIRTY, ORD);
    }

    /// Mark the chunk dirty with no specific bounds ("simulate whole chunk").
    /// This is the only chunk-metadata write a checkerboard task ever makes
    /// on a chunk it does not itself own this frame (the neighbor-wake in
    /// `mark_dirty_with_neighbors`), so it must be safe under concurrent
    /// callers: both operations here write the same fixed value regardless
    /// of prior state, so two racing callers converge on one outcome.
    pub fn mark_dirty_whole(&self) {
        self.invert_bounds();
        self.flags.fetch_or(IS_DIRTY, ORD);
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.load(ORD) & IS_DIRTY != 0
    }

    pub fn has_structure(&self) -> bool {
        self.flags.load(ORD) & HAS_STRUCTURE != 0
    }

    pub fn set_has_structure(&self, value: bool) {
        if value {
            self.flags.fetch_or(HAS_STRUCTURE, ORD);
        } else {
            self.flags.fetch_and(!HAS_STRUCTURE, ORD);
        }
    }

    pub fn active_last_frame(&self) -> bool {
        self.active_last_frame.load(ORD)
    }

    pub fn structure_mask(&self) -> u16 {
        self.structure_mask.load(ORD)
    }

    pub fn set_structure_mask(&self, mask: u16) {
        self.structure_mask.store(mask, ORD);
    }

    /// A chunk is processed this frame iff dirty, active last frame, or
    /// carrying a structure.
    pub fn should_process(&self) -> bool {
        self.is_dirty() || self.active_last_frame() || self.has_structure()
    }

    /// Copy `IsDirty` into `active_last_frame`, then clear `IsDirty` and
    /// reset bounds to inverted, unless `HasStructure` is set in which case
    /// bounds stay inverted but `IsDirty` is retained. Called once per frame
    /// from the single orchestrating thread after the last checkerboard
    /// group's barrier, so plain loads/stores (not fetch-update) suffice.
    pub fn reset_dirty_state(&self) {
        let was_dirty = self.is_dirty();
        self.active_last_frame.store(was_dirty, ORD);
        if self.has_structure() {
            self.invert_bounds();
        } else {
            self.flags.fetch_and(!IS_DIRTY, ORD);
            self.invert_bounds();
        }
    }
}

impl Default for ChunkState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chunk_has_inverted_bounds_and_is_not_dirty() {
        let c = ChunkState::new();
        assert!(c.bounds_are_inverted());
        assert!(!c.should_process());
    }

    #[test]
    fn mark_dirty_at_expands_bounds_monotonically() {
        let c = ChunkState::new();
        c.mark_dirty_at(10, 10);
        c.mark_dirty_at(5, 20);
        let b = c.bounds();
        assert_eq!((b.min_x, b.max_x, b.min_y, b.max_y), (5, 10, 10, 20));
        assert!(c.is_dirty());
    }

    #[test]
    fn reset_retains_dirty_when_structure_present() {
        let c = ChunkState::new();
        c.set_has_structure(true);
        c.mark_dirty_at(1, 1);
        c.reset_dirty_state();
        assert!(c.active_last_frame());
        assert!(c.is_dirty());
        assert!(c.bounds_are_inverted());
    }

    #[test]
    fn reset_clears_dirty_without_structure() {
        let c = ChunkState::new();
        c.mark_dirty_at(1, 1);
        c.reset_dirty_state();
        assert!(c.active_last_frame());
        assert!(!c.is_dirty());
    }

    #[test]
    fn concurrent_whole_dirty_marks_converge() {
        use std::sync::Arc;
        use std::thread;
        let c = Arc::new(ChunkState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || c.mark_dirty_whole())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(c.is_dirty());
        assert!(c.bounds_are_inverted());
    }
}
