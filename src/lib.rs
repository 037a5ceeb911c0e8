//! Stackcrawl: a stack walker and on-stack replacement engine for JIT
//! compiled managed code.
//!
//! This crate bundles the engine ([`vm`]) with the metadata and register
//! types code producers build against ([`types`]).

#![deny(missing_docs)]

pub use stackcrawl_types as types;
pub use stackcrawl_vm as vm;

pub use stackcrawl_vm::{
    CodeRegistry, CrawlFrame, ManagedThread, StackFrameIterator, StackWalk, WalkFlags, enum_gc_refs,
    osr,
};
