//! Errors surfaced by the stack walker and the OSR engine.
//!
//! Conditions that indicate corrupted process state (a stack guard
//! mismatch, a broken frame chain, a required patchpoint that cannot be
//! compiled) are not represented here: they terminate the process.
use crate::code::MethodHandle;
use thiserror::Error;

/// The method-info blob of a code region could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The blob ended in the middle of a record.
    #[error("method info is truncated")]
    Truncated,
    /// A variable-length integer did not fit its field.
    #[error("method info field overflows")]
    Overflow,
    /// The blob was produced by an incompatible encoder.
    #[error("unsupported method info version {0}")]
    UnsupportedVersion(u8),
    /// A register index outside the register file.
    #[error("invalid register index {0}")]
    InvalidRegister(u8),
    /// An unknown GC slot location tag.
    #[error("invalid GC slot kind {0}")]
    InvalidSlotKind(u8),
    /// Bytes were left over after the last record.
    #[error("{0} trailing bytes after method info")]
    TrailingBytes(usize),
}

/// A single frame could not be unwound.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnwindError {
    /// A stack word could not be read.
    #[error("stack memory at {address:#x} is not readable")]
    UnreadableMemory {
        /// The address that was read.
        address: u64,
    },
    /// The code region's metadata is malformed.
    #[error("invalid unwind metadata: {0}")]
    InvalidMetadata(#[from] DecodeError),
    /// The program counter is not inside any registered code.
    #[error("no managed code at {pc:#x}")]
    NotManagedCode {
        /// The program counter.
        pc: u64,
    },
    /// Unwinding did not move towards the stack base.
    #[error("unwind made no progress: sp {old_sp:#x} -> {new_sp:#x}")]
    NoProgress {
        /// Stack pointer before unwinding.
        old_sp: u64,
        /// Stack pointer after unwinding.
        new_sp: u64,
    },
    /// The unwound stack pointer left the thread's stack.
    #[error("stack pointer {sp:#x} is outside the stack [{limit:#x}, {base:#x})")]
    StackOutOfBounds {
        /// The offending stack pointer.
        sp: u64,
        /// Lowest address of the stack.
        limit: u64,
        /// One past the highest address of the stack.
        base: u64,
    },
    /// A native frame could not be unwound.
    #[error("cannot unwind native frame at {pc:#x}")]
    NativeFrame {
        /// Program counter of the native frame.
        pc: u64,
    },
}

/// A stack walk could not be completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalkError {
    /// A frame could not be unwound.
    #[error(transparent)]
    Unwind(#[from] UnwindError),
    /// The requested flags are not allowed for this walk.
    #[error("invalid stack walk request: {0}")]
    InvalidFlags(&'static str),
    /// A speculative walk found state that is inconsistent, most likely
    /// because the walked thread kept running.
    #[error("speculative walk found inconsistent state: {0}")]
    Inconsistent(&'static str),
    /// The iterator was used after it failed or finished.
    #[error("stack iterator is not positioned on a frame")]
    NotPositioned,
}

/// An on-stack replacement request could not be satisfied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OsrError {
    /// The optimized variant could not be compiled.
    #[error("failed to compile OSR variant of {method} at IL offset {il_offset:#x}")]
    CompilationFailed {
        /// The method being promoted.
        method: MethodHandle,
        /// The patchpoint's IL offset.
        il_offset: u32,
    },
    /// The patchpoint was marked invalid by an earlier failure.
    #[error("patchpoint {method} at IL offset {il_offset:#x} is invalid")]
    InvalidPatchpoint {
        /// The method being promoted.
        method: MethodHandle,
        /// The patchpoint's IL offset.
        il_offset: u32,
    },
    /// The patchpoint helper was not called from managed code.
    #[error("patchpoint helper returns to {pc:#x}, which is not managed code")]
    NotManagedCode {
        /// The return address.
        pc: u64,
    },
    /// The helper was called from a method compiled without patchpoints.
    #[error("{method} was not compiled with OSR patchpoints")]
    NotInstrumented {
        /// The calling method.
        method: MethodHandle,
    },
    /// Unwinding out of the helper did not land on the patchpoint.
    #[error("unwound to {actual:#x} but the patchpoint returns to {expected:#x}")]
    UnexpectedContextIp {
        /// The patchpoint's return address.
        expected: u64,
        /// The address the unwind produced.
        actual: u64,
    },
    /// The original frame's stack pointer is not aligned as the calling convention requires.
    #[error("original frame stack pointer {sp:#x} is misaligned")]
    MisalignedFrame {
        /// The stack pointer.
        sp: u64,
    },
    /// The physical stack could not be unwound.
    #[error(transparent)]
    Unwind(#[from] UnwindError),
    /// The process-wide OSR runtime was installed twice.
    #[error("the OSR runtime is already installed")]
    AlreadyInstalled,
}
