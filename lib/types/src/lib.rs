//! Shared data types for the stackcrawl engine.
//!
//! This crate holds everything a code producer (the JIT) and the runtime
//! engine must agree on: the register context layout, code and method
//! handles, the per-method unwind and GC liveness metadata together with
//! its compact binary encoding, OSR patchpoint descriptors, and the error
//! enums surfaced by the engine.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(feature = "cargo-clippy", allow(clippy::new_without_default))]
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

mod code;
mod codec;
mod context;
pub mod error;
mod gcinfo;
mod patchpoint;
mod unwind;

pub use crate::code::{CodeRange, FuncletKind, MethodFlags, MethodHandle, StackFrame};
pub use crate::codec::{METHOD_INFO_VERSION, MethodInfo};
pub use crate::context::{CALLEE_SAVED, GPR, RegisterContext, RegisterSet};
pub use crate::error::{DecodeError, OsrError, UnwindError, WalkError};
pub use crate::gcinfo::{GcInfo, GcSlot, GcSlotFlags, SlotLocation};
pub use crate::patchpoint::{PatchpointDescriptor, PatchpointTable};
pub use crate::unwind::{SavedRegister, UnwindInfo, WORD_SIZE};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
