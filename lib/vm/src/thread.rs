//! The per-thread state a stack walk operates on.

use crate::exinfo::ExceptionTrackers;
use crate::frames::{ExplicitFrame, FrameChain, FrameId};
use crate::memory::StackBounds;
use stackcrawl_types::RegisterContext;
use std::cell::Cell;
use std::thread::ThreadId;

thread_local! {
    static IS_STACK_WALKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is currently walking a stack.
///
/// The flag is cleared while a walk callback runs, so code called from a
/// callback is not treated as part of the walk.
pub fn is_stack_walker_thread() -> bool {
    IS_STACK_WALKER.with(Cell::get)
}

/// Sets the stack walker flag of the calling thread, returning the old value.
pub(crate) fn set_stack_walker_thread(value: bool) -> bool {
    IS_STACK_WALKER.with(|flag| flag.replace(value))
}

/// GC mode of a managed thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GcMode {
    /// The thread runs managed code and holds object references; the GC
    /// must suspend it before scanning.
    Cooperative,
    /// The thread runs native code and may be scanned while it runs.
    Preemptive,
}

/// A thread known to the runtime.
#[derive(Debug)]
pub struct ManagedThread {
    id: u32,
    owner: ThreadId,
    frames: FrameChain,
    exceptions: ExceptionTrackers,
    bounds: StackBounds,
    gc_mode: GcMode,
    filter_context: Option<RegisterContext>,
    profiler_filter_context: Option<RegisterContext>,
}

impl ManagedThread {
    /// Creates the runtime state of the calling OS thread.
    pub fn new(id: u32, bounds: StackBounds) -> Self {
        Self {
            id,
            owner: std::thread::current().id(),
            frames: FrameChain::new(),
            exceptions: ExceptionTrackers::new(),
            bounds,
            gc_mode: GcMode::Preemptive,
            filter_context: None,
            profiler_filter_context: None,
        }
    }

    /// Runtime thread id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The OS thread that owns the state.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Whether the calling thread owns the state.
    pub fn is_current(&self) -> bool {
        self.owner == std::thread::current().id()
    }

    /// Stack bounds of the thread.
    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    /// The explicit frame chain.
    pub fn frames(&self) -> &FrameChain {
        &self.frames
    }

    /// The explicit frame chain, for the owning thread.
    pub fn frames_mut(&mut self) -> &mut FrameChain {
        &mut self.frames
    }

    /// Links a new most recent frame.
    pub fn push_frame(&mut self, frame: ExplicitFrame) -> FrameId {
        debug_assert!(self.is_current(), "frames are pushed by their owning thread");
        self.frames.push(frame)
    }

    /// Unlinks the most recent frame.
    pub fn pop_frame(&mut self) -> Option<ExplicitFrame> {
        self.frames.pop()
    }

    /// The frame chain for unlinking plus the trackers, borrowed together.
    pub(crate) fn popping_parts(&mut self) -> (&mut FrameChain, &ExceptionTrackers) {
        (&mut self.frames, &self.exceptions)
    }

    /// Exceptions in flight on the thread.
    pub fn exceptions(&self) -> &ExceptionTrackers {
        &self.exceptions
    }

    /// Exceptions in flight on the thread, mutably.
    pub fn exceptions_mut(&mut self) -> &mut ExceptionTrackers {
        &mut self.exceptions
    }

    /// Current GC mode.
    pub fn gc_mode(&self) -> GcMode {
        self.gc_mode
    }

    /// Switches GC mode.
    pub fn set_gc_mode(&mut self, mode: GcMode) {
        self.gc_mode = mode;
    }

    /// Context installed by a debugger that stopped the thread.
    pub fn filter_context(&self) -> Option<RegisterContext> {
        self.filter_context
    }

    /// Installs or clears the debugger context.
    pub fn set_filter_context(&mut self, ctx: Option<RegisterContext>) {
        self.filter_context = ctx;
    }

    /// Context captured by a profiler that sampled the thread.
    pub fn profiler_filter_context(&self) -> Option<RegisterContext> {
        self.profiler_filter_context
    }

    /// Installs or clears the profiler context.
    pub fn set_profiler_filter_context(&mut self, ctx: Option<RegisterContext>) {
        self.profiler_filter_context = ctx;
    }
}
