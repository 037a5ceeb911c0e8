//! Runtime engine of stackcrawl: stack walking and on-stack replacement.
//!
//! The stack walker enumerates the frames of a managed thread from the leaf
//! towards the root, merging JIT-compiled frames (unwound from the metadata
//! registered in a [`CodeRegistry`]) with the explicit frames the runtime
//! pushes at transitions. Walks are configured through [`WalkFlags`] and
//! driven either by [`StackWalk`] with a callback or by pulling a
//! [`StackFrameIterator`]. [`enum_gc_refs`] reports the live references of
//! a visited frame.
//!
//! The [`osr`] module moves hot loops of unoptimized methods onto optimized
//! variants while they run.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(clippy::new_without_default, clippy::vtable_address_comparisons)
)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::map_unwrap_or,
        clippy::print_stdout,
        clippy::use_self
    )
)]

mod code_registry;
mod crawl;
mod exinfo;
mod fatal;
mod flags;
mod frames;
mod gcroots;
mod gscookie;
mod iterator;
mod memory;
mod thread;
mod unwinder;
mod walk;

pub mod osr;

pub use crate::code_registry::{
    CodeManager, CodeRegion, CodeRegistration, CodeRegistry, CompiledFunclet, CompiledMethod,
    RegistrationError,
};
pub use crate::crawl::{CrawlFrame, FrameState};
pub use crate::exinfo::{ExceptionPass, ExceptionTracker, ExceptionTrackers, StackRange};
pub use crate::fatal::{FatalError, fail_fast};
pub use crate::flags::WalkFlags;
pub use crate::frames::{
    CleanupAction, ExplicitFrame, FrameAttributes, FrameChain, FrameId, FrameKind,
};
pub use crate::gcroots::{GcRoot, RootLocation, enum_gc_refs};
pub use crate::gscookie::process_gs_cookie;
pub use crate::iterator::{SKIPPED_FRAME_ORDERING, SkippedFrameOrdering, StackFrameIterator};
pub use crate::memory::{LiveStack, StackBounds, StackMemory, SyntheticStack};
pub use crate::thread::{GcMode, ManagedThread, is_stack_walker_thread};
pub use crate::unwinder::{
    FramePointerUnwinder, NativeUnwinder, caller_sp_of, compute_caller_context,
    ensure_caller_context_valid, unwind_stack_frame, virtual_unwind_to_first_managed_call_frame,
};
pub use crate::walk::{StackWalk, WalkOutcome};

pub use stackcrawl_types::{
    CodeRange, FuncletKind, MethodFlags, MethodHandle, MethodInfo, OsrError, RegisterContext,
    StackFrame, UnwindError, WalkError,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
