//! Frame layout metadata emitted by the code producer.

use crate::context::GPR;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Size in bytes of a stack slot.
pub const WORD_SIZE: u64 = 8;

/// A callee-saved register spilled by the prologue.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SavedRegister {
    /// The register that was saved.
    pub reg: GPR,
    /// Offset of the save slot relative to the caller's stack pointer.
    pub offset: i32,
}

/// How to find the caller of a frame once its prologue has run.
///
/// The caller's stack pointer (the canonical frame address) is `fp + 16`
/// for frames that establish a frame pointer and `sp + frame_size + 8`
/// otherwise. The return address is stored in the word just below it.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UnwindInfo {
    /// Bytes between the post-prologue stack pointer and the return address slot.
    pub frame_size: u32,
    /// The frame keeps the caller's frame pointer at `CFA - 16` and points RBP at it.
    pub frame_pointer: bool,
    /// Registers saved by the prologue, other than the frame pointer.
    pub saved_registers: SmallVec<[SavedRegister; 6]>,
    /// For funclets: SP-relative slot holding the caller SP of the parent frame.
    pub parent_sp_slot: Option<i32>,
}

impl UnwindInfo {
    /// Layout of a frame that pushes RBP and allocates `frame_size` bytes under it.
    pub fn with_frame_pointer(frame_size: u32) -> Self {
        Self {
            frame_size,
            frame_pointer: true,
            ..Default::default()
        }
    }

    /// Layout of a frame addressed purely through the stack pointer.
    pub fn sp_based(frame_size: u32) -> Self {
        Self {
            frame_size,
            frame_pointer: false,
            ..Default::default()
        }
    }

    /// Adds a saved register.
    pub fn save(mut self, reg: GPR, offset: i32) -> Self {
        self.saved_registers.push(SavedRegister { reg, offset });
        self
    }

    /// Marks the region as a funclet whose parent's caller SP lives at `slot`.
    pub fn parent_slot(mut self, slot: i32) -> Self {
        self.parent_sp_slot = Some(slot);
        self
    }

    /// The caller's stack pointer for a frame with the given `sp` and `fp`.
    pub fn caller_sp(&self, sp: u64, fp: u64) -> u64 {
        if self.frame_pointer {
            fp.wrapping_add(2 * WORD_SIZE)
        } else {
            sp.wrapping_add(u64::from(self.frame_size))
                .wrapping_add(WORD_SIZE)
        }
    }
}
