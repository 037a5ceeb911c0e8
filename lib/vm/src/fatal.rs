//! Process termination for unrecoverable runtime states.
//!
//! Stack corruption and unsatisfiable OSR requests are never reported as
//! errors: there is no state left that could be trusted to handle them.

use stackcrawl_types::{MethodHandle, OsrError};
use thiserror::Error;

/// A condition that terminates the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// A stack guard cookie does not hold the process cookie.
    #[error("stack guard cookie at {address:#x} is corrupted (found {found:#x})")]
    GsCookieMismatch {
        /// Address of the cookie.
        address: u64,
        /// Value found there.
        found: u64,
    },
    /// The explicit frame chain is out of stack order.
    #[error("explicit frame at {frame:#x} is out of order with stack pointer {sp:#x}")]
    FrameChainCorrupted {
        /// Address of the offending frame.
        frame: u64,
        /// Stack pointer it was compared against.
        sp: u64,
    },
    /// Unwinding produced a stack pointer outside the thread's stack.
    #[error("unwound stack pointer {sp:#x} left the thread's stack [{limit:#x}, {base:#x})")]
    StackOutOfBounds {
        /// The offending stack pointer.
        sp: u64,
        /// Lowest address of the stack.
        limit: u64,
        /// One past the highest address of the stack.
        base: u64,
    },
    /// A required patchpoint can never be satisfied.
    #[error("required patchpoint {method} at IL offset {il_offset:#x} cannot transition: {reason}")]
    RequiredPatchpointFailed {
        /// Method owning the patchpoint.
        method: MethodHandle,
        /// IL offset of the patchpoint.
        il_offset: u32,
        /// Why the transition is impossible.
        reason: OsrError,
    },
    /// A required patchpoint waited too long for another thread's compilation.
    #[error("required patchpoint {method} at IL offset {il_offset:#x} timed out after {backoffs} backoffs")]
    RequiredPatchpointTimeout {
        /// Method owning the patchpoint.
        method: MethodHandle,
        /// IL offset of the patchpoint.
        il_offset: u32,
        /// Backoffs performed before giving up.
        backoffs: u32,
    },
    /// Leaving a frame for its OSR variant failed after code was obtained.
    #[error("OSR transition failed: {0}")]
    OsrTransitionFailed(OsrError),
    /// An internal assumption did not hold.
    #[error("unreachable runtime state: {0}")]
    Unreachable(&'static str),
}

/// Logs `error` and aborts the process.
#[cold]
pub fn fail_fast(error: FatalError) -> ! {
    tracing::error!(%error, "fatal runtime error, terminating the process");
    std::process::abort()
}
