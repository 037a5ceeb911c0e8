//! Flags selecting what a stack walk reports and how it behaves.

use bitflags::bitflags;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Options of a single stack walk.
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    #[derive(Default)]
    pub struct WalkFlags: u32 {
        /// Report only positions that belong to a method; drop stubs and
        /// explicit frames without an owning method.
        const FUNCTIONS_ONLY = 0x1;
        /// Unlink explicit frames while passing them (exception unwind).
        const POP_FRAMES = 0x2;
        /// Do not restore callee-saved registers while unwinding.
        const QUICK_UNWIND = 0x4;
        /// Restore only the control registers while unwinding.
        const LIGHT_UNWIND = 0x8;
        /// Pass over explicit frames nested in a managed frame silently.
        const SUPPRESS_SKIPPED_FRAMES = 0x10;
        /// Report the marker where managed code was entered from native code.
        const NOTIFY_ON_U2M_TRANSITIONS = 0x20;
        /// Report the marker where an exception record replaces a missing frame.
        const NOTIFY_ON_NO_FRAME_TRANSITIONS = 0x40;
        /// Report the initial position when the walk starts in native code.
        const NOTIFY_ON_INITIAL_NATIVE_CONTEXT = 0x80;
        /// Skip funclets and everything up to their parent frame.
        const SKIP_FUNCLETS = 0x100;
        /// Funclet-aware filtering for GC root enumeration.
        const GC_FUNCLET_REFERENCE_REPORTING = 0x200;
        /// Best-effort walk of a possibly running thread.
        const SPECULATIVE = 0x400;
        /// The walked thread is not the walking thread.
        const ALLOW_ASYNC_STACK_WALK = 0x800;
        /// The walked thread is known to be suspended.
        const THREAD_IS_SUSPENDED = 0x1000;
        /// Do not verify stack guard cookies.
        const SKIP_GS_COOKIE_CHECK = 0x2000;
    }
}

impl WalkFlags {
    /// Flags used by the GC to enumerate the roots of a suspended thread.
    pub fn gc_root_enumeration() -> Self {
        Self::GC_FUNCLET_REFERENCE_REPORTING
            | Self::ALLOW_ASYNC_STACK_WALK
            | Self::THREAD_IS_SUSPENDED
    }

    /// Flags used by exception dispatch to find handlers.
    pub fn exception_dispatch() -> Self {
        Self::FUNCTIONS_ONLY | Self::SKIP_FUNCLETS
    }

    /// Flags used by sampling profilers.
    pub fn profiler_sample() -> Self {
        Self::SPECULATIVE | Self::ALLOW_ASYNC_STACK_WALK
    }

    /// Whether funclets are tracked to skip frames up to their parent.
    pub fn skips_to_funclet_parent(self) -> bool {
        self.intersects(Self::FUNCTIONS_ONLY | Self::SKIP_FUNCLETS)
    }

    /// Whether unwinding restores only the control registers.
    pub fn is_light_unwind(self) -> bool {
        self.intersects(Self::QUICK_UNWIND | Self::LIGHT_UNWIND)
    }
}
