//! GC liveness information for a code region.

use crate::context::GPR;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Where a tracked reference lives while it is live.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotLocation {
    /// In a register of the frame.
    Register(GPR),
    /// At an offset from the frame's stack pointer.
    StackPointer(i32),
    /// At an offset from the frame pointer.
    FramePointer(i32),
    /// At an offset from the caller's stack pointer.
    CallerStackPointer(i32),
    /// At an offset from the caller stack pointer of the funclet's parent frame.
    ParentCallerStackPointer(i32),
}

bitflags::bitflags! {
    /// Reporting attributes of a GC slot.
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    #[derive(Default)]
    pub struct GcSlotFlags: u8 {
        /// The slot may point into the middle of an object.
        const INTERIOR = 0x1;
        /// The referenced object must not move.
        const PINNED = 0x2;
    }
}

/// A tracked reference and the code offsets at which it is live.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GcSlot {
    /// Storage of the reference.
    pub location: SlotLocation,
    /// First code offset, relative to the region start, where the slot is live.
    pub live_start: u32,
    /// Code offset where the slot stops being live.
    pub live_end: u32,
    /// Reporting attributes.
    pub flags: GcSlotFlags,
}

impl GcSlot {
    /// A slot live over `[live_start, live_end)`.
    pub fn new(location: SlotLocation, live_start: u32, live_end: u32) -> Self {
        Self {
            location,
            live_start,
            live_end,
            flags: GcSlotFlags::empty(),
        }
    }

    /// Whether the slot holds a live reference at `offset`.
    pub fn is_live_at(&self, offset: u32) -> bool {
        self.live_start <= offset && offset < self.live_end
    }
}

/// All GC slots of a code region.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct GcInfo {
    /// The tracked slots.
    pub slots: Vec<GcSlot>,
}

impl GcInfo {
    /// Slots live at a code offset.
    pub fn live_slots_at(&self, offset: u32) -> impl Iterator<Item = &GcSlot> + '_ {
        self.slots.iter().filter(move |slot| slot.is_live_at(offset))
    }
}
