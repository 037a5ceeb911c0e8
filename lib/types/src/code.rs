//! Handles describing compiled code regions and stack positions.

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Opaque handle to a managed method, assigned by the runtime.
#[cfg_attr(
    feature = "enable-serde",
    derive(Serialize, Deserialize),
    serde(transparent)
)]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodHandle(u64);

impl MethodHandle {
    /// Create a method handle from raw bits.
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Read the raw bits of the handle.
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// A half-open range `[start, end)` of code addresses.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodeRange {
    /// First byte of the range.
    pub start: u64,
    /// One past the last byte of the range.
    pub end: u64,
}

impl CodeRange {
    /// Builds a range from a start address and a length in bytes.
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    /// Whether `pc` lies inside the range.
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    /// Whether two ranges share any address.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The shape of a code region inside a method.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum FuncletKind {
    /// The main body of the method.
    #[default]
    None,
    /// A catch, finally or fault handler.
    Handler,
    /// An exception filter, run during the first dispatch pass.
    Filter,
}

impl FuncletKind {
    /// Whether the region is a funclet of any kind.
    pub fn is_funclet(self) -> bool {
        self != Self::None
    }
}

bitflags::bitflags! {
    /// Classification bits attached to a compiled method.
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    #[derive(Default)]
    pub struct MethodFlags: u32 {
        /// Runtime generated marshalling stub.
        const IL_STUB = 0x1;
        /// The method holds a monitor for its whole body.
        const SYNCHRONIZED = 0x2;
        /// The method carries OSR patchpoints.
        const HAS_PATCHPOINTS = 0x4;
    }
}

/// Identity of a frame on the stack, given by its caller's stack pointer.
///
/// Zero means "no frame". `u64::MAX` is used as a sentinel that matches
/// any frame.
#[cfg_attr(
    feature = "enable-serde",
    derive(Serialize, Deserialize),
    serde(transparent)
)]
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StackFrame(u64);

impl StackFrame {
    /// The empty frame identity.
    pub const NULL: Self = Self(0);
    /// The identity matching any frame.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a frame identity from a stack address.
    pub const fn new(sp: u64) -> Self {
        Self(sp)
    }

    /// The stack address.
    pub fn sp(self) -> u64 {
        self.0
    }

    /// Whether this is [`StackFrame::NULL`].
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether this is [`StackFrame::MAX`].
    pub fn is_max(self) -> bool {
        self.0 == u64::MAX
    }

    /// Resets the identity to [`StackFrame::NULL`].
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StackFrame({:#x})", self.0)
    }
}
