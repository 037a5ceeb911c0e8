//! The stack walk driver.
//!
//! # Example
//! ```ignore
//! use std::ops::ControlFlow;
//! use stackcrawl_vm::{CodeRegistry, StackWalk, WalkFlags};
//!
//! let outcome = StackWalk::new(CodeRegistry::global(), &memory)
//!     .flags(WalkFlags::FUNCTIONS_ONLY)
//!     .walk(&thread, |frame| {
//!         println!("{:?}", frame.method());
//!         ControlFlow::Continue(())
//!     })?;
//! ```

use crate::code_registry::CodeManager;
use crate::crawl::CrawlFrame;
use crate::exinfo::ExceptionTrackers;
use crate::flags::WalkFlags;
use crate::frames::{CleanupAction, FrameId};
use crate::iterator::{
    FrameChainAccess, SKIPPED_FRAME_ORDERING, SkippedFrameOrdering, StackFrameIterator,
    WalkSetup,
};
use crate::memory::StackMemory;
use crate::thread::{GcMode, ManagedThread, set_stack_walker_thread};
use stackcrawl_types::{RegisterContext, WalkError};
use std::ops::ControlFlow;
use tracing::trace;

/// How a walk ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WalkOutcome {
    /// Every position was visited.
    Completed,
    /// The callback stopped the walk.
    Aborted,
}

/// A configured stack walk.
#[derive(Clone)]
pub struct StackWalk<'a> {
    code: &'a dyn CodeManager,
    memory: &'a dyn StackMemory,
    flags: WalkFlags,
    context: Option<RegisterContext>,
    start_frame: Option<FrameId>,
    ordering: SkippedFrameOrdering,
}

impl<'a> StackWalk<'a> {
    /// A walk resolving code through `code` and reading the stack through `memory`.
    pub fn new(code: &'a dyn CodeManager, memory: &'a dyn StackMemory) -> Self {
        Self {
            code,
            memory,
            flags: WalkFlags::empty(),
            context: None,
            start_frame: None,
            ordering: SKIPPED_FRAME_ORDERING,
        }
    }

    /// Sets the walk flags.
    pub fn flags(mut self, flags: WalkFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Seeds the walk from a captured context instead of the thread's state.
    pub fn with_context(mut self, context: RegisterContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Starts the explicit frame chain at `frame` instead of its head.
    pub fn start_frame(mut self, frame: FrameId) -> Self {
        self.start_frame = Some(frame);
        self
    }

    /// Overrides the target's skipped-frame ordering.
    pub fn skipped_frame_ordering(mut self, ordering: SkippedFrameOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Walks `thread` read-only, calling `callback` at every position the
    /// flags accept until it breaks.
    pub fn walk<F>(&self, thread: &ManagedThread, callback: F) -> Result<WalkOutcome, WalkError>
    where
        F: FnMut(&CrawlFrame) -> ControlFlow<()>,
    {
        if self.flags.contains(WalkFlags::POP_FRAMES) {
            return Err(WalkError::InvalidFlags("popping walks need exclusive access to the thread"));
        }
        self.check_thread(thread)?;
        let seed = self.seed(thread)?;
        let setup = self.setup(
            thread,
            FrameChainAccess::Shared(thread.frames()),
            thread.exceptions(),
        );
        drive(setup, seed, &mut |_: &CleanupAction| {}, callback)
    }

    /// Walks the calling thread's own stack, unlinking every explicit frame
    /// it passes and handing their cleanup actions to `cleanup`.
    ///
    /// Used by exception dispatch once a handler is found. The thread must be
    /// in cooperative mode.
    pub fn walk_popping<C, F>(
        &self,
        thread: &mut ManagedThread,
        mut cleanup: C,
        callback: F,
    ) -> Result<WalkOutcome, WalkError>
    where
        C: FnMut(&CleanupAction),
        F: FnMut(&CrawlFrame) -> ControlFlow<()>,
    {
        if !thread.is_current() {
            return Err(WalkError::InvalidFlags("only the owning thread can pop its frames"));
        }
        if thread.gc_mode() != GcMode::Cooperative {
            return Err(WalkError::InvalidFlags("popping frames needs cooperative GC mode"));
        }
        let mut walk = self.clone();
        walk.flags |= WalkFlags::POP_FRAMES;
        walk.check_thread(thread)?;
        let seed = walk.seed(thread)?;
        let bounds = thread.bounds();
        let (frames, exceptions) = thread.popping_parts();
        let setup = WalkSetup {
            code: walk.code,
            memory: walk.memory,
            chain: FrameChainAccess::Popping(frames),
            exceptions,
            bounds,
            flags: walk.flags,
            ordering: walk.ordering,
            start_frame: None,
        };
        drive(setup, seed, &mut cleanup, callback)
    }

    /// Positions an iterator on the first position of `thread`, for callers
    /// that step through the stack themselves.
    pub fn iter<'t>(&self, thread: &'t ManagedThread) -> Result<StackFrameIterator<'t>, WalkError>
    where
        'a: 't,
    {
        if self.flags.contains(WalkFlags::POP_FRAMES) {
            return Err(WalkError::InvalidFlags("popping walks need exclusive access to the thread"));
        }
        self.check_thread(thread)?;
        let seed = self.seed(thread)?;
        let setup = self.setup(
            thread,
            FrameChainAccess::Shared(thread.frames()),
            thread.exceptions(),
        );
        StackFrameIterator::init(setup, seed)
    }

    fn setup<'t>(
        &self,
        thread: &ManagedThread,
        chain: FrameChainAccess<'t>,
        exceptions: &'t ExceptionTrackers,
    ) -> WalkSetup<'t>
    where
        'a: 't,
    {
        WalkSetup {
            code: self.code,
            memory: self.memory,
            chain,
            exceptions,
            bounds: thread.bounds(),
            flags: self.flags,
            ordering: self.ordering,
            start_frame: self.start_frame,
        }
    }

    fn check_thread(&self, thread: &ManagedThread) -> Result<(), WalkError> {
        if self.flags.contains(WalkFlags::THREAD_IS_SUSPENDED)
            && !self.flags.contains(WalkFlags::ALLOW_ASYNC_STACK_WALK)
        {
            return Err(WalkError::InvalidFlags(
                "walking a suspended thread needs ALLOW_ASYNC_STACK_WALK",
            ));
        }
        if !thread.is_current()
            && !self
                .flags
                .intersects(WalkFlags::ALLOW_ASYNC_STACK_WALK | WalkFlags::SPECULATIVE)
        {
            return Err(WalkError::InvalidFlags(
                "walking another thread needs ALLOW_ASYNC_STACK_WALK or SPECULATIVE",
            ));
        }
        Ok(())
    }

    /// Picks the context the walk starts from.
    fn seed(&self, thread: &ManagedThread) -> Result<RegisterContext, WalkError> {
        if let Some(context) = self.context {
            return Ok(context);
        }
        if let Some(context) = thread.profiler_filter_context() {
            if !self.flags.contains(WalkFlags::SPECULATIVE) {
                return Err(WalkError::InvalidFlags(
                    "a profiler context can only seed a speculative walk",
                ));
            }
            return Ok(context);
        }
        if let Some(context) = thread.filter_context() {
            return Ok(context);
        }
        // a partial context: the walk starts from the explicit frame chain
        Ok(RegisterContext::default())
    }
}

fn drive<C, F>(
    setup: WalkSetup<'_>,
    seed: RegisterContext,
    cleanup: &mut C,
    mut callback: F,
) -> Result<WalkOutcome, WalkError>
where
    C: FnMut(&CleanupAction) + ?Sized,
    F: FnMut(&CrawlFrame) -> ControlFlow<()>,
{
    let was_walker = set_stack_walker_thread(true);
    let _walker = scopeguard::guard((), move |()| {
        set_stack_walker_thread(was_walker);
    });

    let mut iter = StackFrameIterator::init(setup, seed)?;
    let mut visited = 0u32;
    loop {
        for action in iter.take_cleanups() {
            outside_walk(|| cleanup(&action));
        }
        if !iter.is_valid() {
            trace!(visited, "stack walk completed");
            return Ok(WalkOutcome::Completed);
        }

        iter.check_gs_cookies()?;
        visited += 1;
        trace!(
            tag = "CALLBACK",
            visited,
            state = ?iter.state(),
            method = ?iter.frame().method(),
            "stack walk"
        );
        let flow = outside_walk(|| callback(iter.frame()));
        // the callback may have run arbitrary code on the walked stack
        iter.check_gs_cookies()?;

        if flow.is_break() {
            trace!(visited, "stack walk aborted by callback");
            return Ok(WalkOutcome::Aborted);
        }
        iter.advance()?;
    }
}

/// Runs `f` with the stack walker marker cleared.
fn outside_walk<R>(f: impl FnOnce() -> R) -> R {
    let was_walker = set_stack_walker_thread(false);
    let _restore = scopeguard::guard((), move |()| {
        set_stack_walker_thread(was_walker);
    });
    f()
}
