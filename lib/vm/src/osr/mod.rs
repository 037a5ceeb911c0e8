//! On-stack replacement.
//!
//! Unoptimized methods with loops are instrumented with patchpoints: calls
//! to [`jit_patchpoint`] at safe points where an optimized OSR variant of
//! the method can take over the running frame. Counted patchpoints
//! transition once they are hot; required patchpoints (in methods that were
//! only partially compiled) must transition on their first hit.

mod config;
mod manager;
mod patchpoint;
mod policy;
mod runtime;
mod transition;

pub use self::config::OsrConfig;
pub use self::manager::{LoaderAllocator, OnStackReplacementManager, PatchpointKey};
pub use self::patchpoint::{PatchpointFlags, PatchpointRecord};
pub use self::policy::{PatchpointSite, PolicyDecision, optimizing_policy, required_policy};
pub use self::runtime::{
    OsrCompiler, OsrRuntime, PatchpointCall, PatchpointEnv, jit_patchpoint,
};
pub use self::transition::{
    ContextRestorer, NativeContextRestorer, OSR_ENTRY_SP_ADJUSTMENT, TransitionPlan,
    prepare_transition, transition,
};
