//! Per-fiber stack encoding
//!
//! A [`Stack`] records the live locals of every instrumented frame that was
//! on the call stack when its fiber suspended. Storage is two parallel slot
//! arrays (64-bit primitives and object references) plus one packed frame
//! marker per nesting level.
//!
//! Protocol, as driven by instrumented code:
//! - method entry calls [`Stack::enter`]; a non-zero entry means the frame is
//!   being replayed and must restore and jump to that suspension point
//! - normal or exceptional return calls [`Stack::leave`]
//! - the suspending primitive calls [`Stack::begin_suspend`], then each frame
//!   unwinding through a guarded call site calls [`Stack::save_frame`]
//! - every resumption starts with [`Stack::resume_stack`]

use crate::defaults::{DEFAULT_FRAME_DEPTH, DEFAULT_STACK_SIZE, MAX_ENTRY, MAX_SLOTS};
use crate::value::Value;
use thiserror::Error;

const ENTRY_BITS: u32 = 14;
const SLOTS_BITS: u32 = 16;
const ENTRY_MASK: u64 = (1 << ENTRY_BITS) - 1;
const SLOTS_MASK: u64 = (1 << SLOTS_BITS) - 1;
const BASE_SHIFT: u32 = ENTRY_BITS + SLOTS_BITS;

/// Stack encoding errors. All of them are invariant violations that abort the fiber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// Entry id does not fit in a frame marker
    #[error("suspension entry {0} exceeds the maximum of {MAX_ENTRY}")]
    EntryTooLarge(usize),

    /// Slot count does not fit in a frame marker
    #[error("frame needs {0} slots, more than the maximum of {MAX_SLOTS}")]
    TooManySlots(usize),

    /// No frame marker at the requested nesting level
    #[error("no saved frame at depth {0}")]
    NoFrame(usize),

    /// Saved slot count differs from the layout the frame expects
    #[error("frame at depth {depth} saved {saved} slots but its layout declares {expected}")]
    SlotCountMismatch {
        /// Nesting level of the frame
        depth: usize,
        /// Slots recorded in the marker
        saved: usize,
        /// Slots the restoring layout expects
        expected: usize,
    },

    /// Slot index outside the frame's reservation
    #[error("slot {index} is outside a frame of {len} slots")]
    SlotOutOfRange {
        /// Requested slot
        index: usize,
        /// Slots reserved by the frame
        len: usize,
    },
}

/// A packed frame marker: entry id, slot count, and data base offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRecord(u64);

impl FrameRecord {
    fn new(entry: usize, slots: usize, base: usize) -> Self {
        Self((entry as u64 & ENTRY_MASK) | ((slots as u64 & SLOTS_MASK) << ENTRY_BITS) | ((base as u64) << BASE_SHIFT))
    }

    /// Suspension entry id (0 = not suspended here)
    pub fn entry(self) -> usize {
        (self.0 & ENTRY_MASK) as usize
    }

    /// Number of slots saved for the frame
    pub fn slots(self) -> usize {
        ((self.0 >> ENTRY_BITS) & SLOTS_MASK) as usize
    }

    /// Offset of the frame's first slot in the data arrays
    pub fn base(self) -> usize {
        (self.0 >> BASE_SHIFT) as usize
    }
}

/// Position of a frame in the stack and the entry it must resume at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Nesting level (0 = outermost instrumented frame)
    pub index: usize,
    /// Entry id to resume at, 0 for a fresh call
    pub entry: usize,
}

impl FrameEntry {
    /// Whether the frame is being replayed after a suspension
    pub fn is_resuming(&self) -> bool {
        self.entry != 0
    }
}

/// Saved state of one fiber's suspended call tree.
#[derive(Debug)]
pub struct Stack {
    markers: Vec<FrameRecord>,
    prims: Vec<u64>,
    refs: Vec<Option<Value>>,
    /// Frames entered during the current run
    depth: usize,
    /// First free data slot during a suspension
    top: usize,
}

impl Stack {
    /// Create a stack with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STACK_SIZE)
    }

    /// Create a stack with room for `slots` data slots before growing
    pub fn with_capacity(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            markers: Vec::with_capacity(DEFAULT_FRAME_DEPTH),
            prims: vec![0; slots],
            refs: vec![None; slots],
            depth: 0,
            top: 0,
        }
    }

    /// Called on entry to every instrumented method.
    ///
    /// Returns the frame's nesting level and the entry id recorded there by
    /// the last suspension, or 0 when the frame is new.
    pub fn enter(&mut self) -> FrameEntry {
        let index = self.depth;
        self.depth += 1;
        match self.markers.get(index) {
            Some(record) => FrameEntry { index, entry: record.entry() },
            None => {
                self.markers.push(FrameRecord::default());
                FrameEntry { index, entry: 0 }
            }
        }
    }

    /// Called when the frame at `index` returns, normally or by exception.
    pub fn leave(&mut self, index: usize) {
        if index < self.markers.len() {
            let record = self.markers[index];
            for slot in &mut self.refs[record.base()..record.base() + record.slots()] {
                *slot = None;
            }
            self.markers.truncate(index);
        }
        self.depth = index;
    }

    /// Start recording a new suspension. Frames deeper than the current depth
    /// are discarded and the data area is reused from the bottom.
    pub fn begin_suspend(&mut self) {
        self.markers.truncate(self.depth);
        self.top = 0;
    }

    /// Reserve `num_slots` slots for the frame at `index` and mark it as
    /// suspended at `entry`. The returned writer fills the reservation.
    pub fn save_frame(&mut self, index: usize, entry: usize, num_slots: usize) -> Result<FrameWriter<'_>, StackError> {
        if entry == 0 || entry > MAX_ENTRY {
            return Err(StackError::EntryTooLarge(entry));
        }
        if num_slots > MAX_SLOTS {
            return Err(StackError::TooManySlots(num_slots));
        }
        if index >= self.markers.len() {
            return Err(StackError::NoFrame(index));
        }
        let base = self.top;
        let required = base + num_slots;
        if required > self.refs.len() {
            self.grow(required);
        }
        self.top = required;
        self.markers[index] = FrameRecord::new(entry, num_slots, base);
        Ok(FrameWriter { stack: self, base, len: num_slots })
    }

    /// Open the frame at `index` for restoring `expected_slots` slots.
    pub fn restore_frame(&mut self, index: usize, expected_slots: usize) -> Result<FrameReader<'_>, StackError> {
        let record = *self.markers.get(index).ok_or(StackError::NoFrame(index))?;
        if record.slots() != expected_slots {
            return Err(StackError::SlotCountMismatch {
                depth: index,
                saved: record.slots(),
                expected: expected_slots,
            });
        }
        Ok(FrameReader { stack: self, base: record.base(), len: record.slots() })
    }

    /// Rewind to the outermost frame before a fiber resumes.
    pub fn resume_stack(&mut self) {
        self.depth = 0;
    }

    /// Clear all saved state, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.markers.clear();
        for slot in &mut self.refs {
            *slot = None;
        }
        self.depth = 0;
        self.top = 0;
    }

    /// Frames entered during the current run
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Frames recorded by the last suspension (or still active)
    pub fn saved_depth(&self) -> usize {
        self.markers.len()
    }

    /// Marker of the frame at `index`
    pub fn record(&self, index: usize) -> Option<FrameRecord> {
        self.markers.get(index).copied()
    }

    /// Current data capacity in slots
    pub fn capacity(&self) -> usize {
        self.refs.len()
    }

    fn grow(&mut self, required: usize) {
        let mut size = self.refs.len().max(1);
        while size < required {
            size *= 2;
        }
        self.prims.resize(size, 0);
        self.refs.resize(size, None);
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the slots of one frame being saved.
pub struct FrameWriter<'a> {
    stack: &'a mut Stack,
    base: usize,
    len: usize,
}

impl FrameWriter<'_> {
    /// Store a primitive in slot `index`
    pub fn put_prim(&mut self, index: usize, bits: u64) -> Result<(), StackError> {
        let at = self.slot(index)?;
        self.stack.prims[at] = bits;
        Ok(())
    }

    /// Store a reference in slot `index`
    pub fn put_ref(&mut self, index: usize, value: Value) -> Result<(), StackError> {
        let at = self.slot(index)?;
        self.stack.refs[at] = Some(value);
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<usize, StackError> {
        if index >= self.len {
            return Err(StackError::SlotOutOfRange { index, len: self.len });
        }
        Ok(self.base + index)
    }
}

/// Reads the slots of one frame being restored.
pub struct FrameReader<'a> {
    stack: &'a mut Stack,
    base: usize,
    len: usize,
}

impl FrameReader<'_> {
    /// Primitive bits saved in slot `index`
    pub fn prim(&self, index: usize) -> Result<u64, StackError> {
        Ok(self.stack.prims[self.slot(index)?])
    }

    /// Take the reference saved in slot `index`, leaving the slot empty
    pub fn take_ref(&mut self, index: usize) -> Result<Value, StackError> {
        let at = self.slot(index)?;
        Ok(self.stack.refs[at].take().unwrap_or_default())
    }

    /// Number of slots in the frame
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the frame saved no slots
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, index: usize) -> Result<usize, StackError> {
        if index >= self.len {
            return Err(StackError::SlotOutOfRange { index, len: self.len });
        }
        Ok(self.base + index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_frames_have_zero_entry() {
        let mut stack = Stack::new();
        let outer = stack.enter();
        let inner = stack.enter();
        assert_eq!(outer, FrameEntry { index: 0, entry: 0 });
        assert_eq!(inner, FrameEntry { index: 1, entry: 0 });
        assert_eq!(stack.depth(), 2);

        stack.leave(inner.index);
        stack.leave(outer.index);
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.saved_depth(), 0);
    }

    #[test]
    fn test_suspend_and_replay_two_frames() {
        let mut stack = Stack::new();
        let outer = stack.enter();
        let inner = stack.enter();

        // innermost frame saves first
        stack.begin_suspend();
        {
            let mut w = stack.save_frame(inner.index, 2, 1).unwrap();
            w.put_prim(0, 7).unwrap();
        }
        {
            let mut w = stack.save_frame(outer.index, 1, 2).unwrap();
            w.put_prim(0, 40).unwrap();
            w.put_ref(1, Value::from("acc")).unwrap();
        }

        stack.resume_stack();
        let outer = stack.enter();
        assert_eq!(outer.entry, 1);
        {
            let mut r = stack.restore_frame(outer.index, 2).unwrap();
            assert_eq!(r.prim(0).unwrap(), 40);
            assert_eq!(r.take_ref(1).unwrap(), Value::from("acc"));
        }
        let inner = stack.enter();
        assert_eq!(inner.entry, 2);
        let r = stack.restore_frame(inner.index, 1).unwrap();
        assert_eq!(r.prim(0).unwrap(), 7);
    }

    #[test]
    fn test_leave_discards_marker_so_next_call_is_fresh() {
        let mut stack = Stack::new();
        let outer = stack.enter();
        let callee = stack.enter();
        stack.begin_suspend();
        stack.save_frame(callee.index, 1, 0).unwrap();
        stack.save_frame(outer.index, 1, 0).unwrap();

        stack.resume_stack();
        let outer = stack.enter();
        let callee = stack.enter();
        assert!(callee.is_resuming());
        stack.leave(callee.index);

        let next = stack.enter();
        assert_eq!(next.index, 1);
        assert!(!next.is_resuming());
        let _ = outer;
    }

    #[test]
    fn test_grows_geometrically() {
        let mut stack = Stack::with_capacity(2);
        let frame = stack.enter();
        stack.begin_suspend();
        let mut w = stack.save_frame(frame.index, 1, 9).unwrap();
        w.put_prim(8, 1).unwrap();
        assert_eq!(stack.capacity(), 16);
    }

    #[test]
    fn test_slot_count_mismatch_is_rejected() {
        let mut stack = Stack::new();
        let frame = stack.enter();
        stack.begin_suspend();
        stack.save_frame(frame.index, 1, 3).unwrap();
        stack.resume_stack();
        let frame = stack.enter();
        let err = stack.restore_frame(frame.index, 2).err();
        assert_eq!(
            err,
            Some(StackError::SlotCountMismatch { depth: 0, saved: 3, expected: 2 })
        );
    }

    #[test]
    fn test_marker_limits() {
        let mut stack = Stack::new();
        let frame = stack.enter();
        assert_eq!(
            stack.save_frame(frame.index, MAX_ENTRY + 1, 0).err(),
            Some(StackError::EntryTooLarge(MAX_ENTRY + 1))
        );
        assert_eq!(
            stack.save_frame(frame.index, 1, MAX_SLOTS + 1).err(),
            Some(StackError::TooManySlots(MAX_SLOTS + 1))
        );
        let mut w = stack.save_frame(frame.index, 1, 1).unwrap();
        assert_eq!(w.put_prim(1, 0), Err(StackError::SlotOutOfRange { index: 1, len: 1 }));
    }

    #[test]
    fn test_record_packing() {
        let record = FrameRecord::new(MAX_ENTRY, MAX_SLOTS, 123_456);
        assert_eq!(record.entry(), MAX_ENTRY);
        assert_eq!(record.slots(), MAX_SLOTS);
        assert_eq!(record.base(), 123_456);
    }
}
