//! The unified stack frame iterator.
//!
//! A thread's stack interleaves managed frames, which have no record and are
//! unwound from metadata, with explicit frames pushed by the runtime and
//! with native code neither of them describes. The iterator merges both
//! sources into one leaf-to-root sequence of positions:
//!
//! * from a managed frame it unwinds one frame; if the caller is managed it
//!   stays in managed mode, otherwise it stops at a native marker and
//!   resumes from the explicit frame chain;
//! * from an explicit frame it restores the frame's caller context;
//! * explicit frames that live inside a managed frame (inlined native calls)
//!   are delivered as skipped frames, before or after their containing frame
//!   depending on [`SKIPPED_FRAME_ORDERING`];
//! * exception records whose fault context has no explicit frame resync the
//!   walk at a no-frame transition.
//!
//! On top of the raw sequence, [`StackFrameIterator::advance`] applies the
//! walk flags: funclet skipping for exception dispatch, and the funclet-aware
//! filtering the GC uses to see every live frame's references exactly once.

use crate::code_registry::{CodeManager, CodeRegion};
use crate::crawl::{CrawlFrame, FrameState};
use crate::exinfo::{ExInfoWalker, ExceptionTrackers};
use crate::fatal::{FatalError, fail_fast};
use crate::flags::WalkFlags;
use crate::frames::{CleanupAction, FrameAttributes, FrameChain, FrameId, FrameKind};
use crate::gscookie::process_gs_cookie;
use crate::memory::{StackBounds, StackMemory};
use crate::unwinder::{caller_sp_of, ensure_caller_context_valid, unwind_stack_frame};
use smallvec::SmallVec;
use stackcrawl_types::{
    MethodFlags, RegisterContext, RegisterSet, StackFrame, UnwindError, WalkError,
};
use tracing::trace;

/// Where explicit frames nested inside a managed frame are delivered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SkippedFrameOrdering {
    /// Nested frames come first, ordered by the managed frame's caller SP.
    BeforeContainingFrame,
    /// The managed frame comes first, nested frames once it is unwound.
    AfterContainingFrame,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        /// Skipped-frame ordering of this target.
        pub const SKIPPED_FRAME_ORDERING: SkippedFrameOrdering =
            SkippedFrameOrdering::AfterContainingFrame;
    } else {
        /// Skipped-frame ordering of this target.
        pub const SKIPPED_FRAME_ORDERING: SkippedFrameOrdering =
            SkippedFrameOrdering::BeforeContainingFrame;
    }
}

/// How the iterator reaches the explicit frame chain.
pub(crate) enum FrameChainAccess<'a> {
    /// Read-only walk.
    Shared(&'a FrameChain),
    /// Walk that unlinks every frame it leaves.
    Popping(&'a mut FrameChain),
}

impl FrameChainAccess<'_> {
    fn chain(&self) -> &FrameChain {
        match self {
            Self::Shared(chain) => &**chain,
            Self::Popping(chain) => &**chain,
        }
    }
}

/// Everything an iterator is started with.
pub(crate) struct WalkSetup<'a> {
    pub(crate) code: &'a dyn CodeManager,
    pub(crate) memory: &'a dyn StackMemory,
    pub(crate) chain: FrameChainAccess<'a>,
    pub(crate) exceptions: &'a ExceptionTrackers,
    pub(crate) bounds: StackBounds,
    pub(crate) flags: WalkFlags,
    pub(crate) ordering: SkippedFrameOrdering,
    pub(crate) start_frame: Option<FrameId>,
}

/// Iterates the positions of one thread's stack, leaf to root.
pub struct StackFrameIterator<'a> {
    code: &'a dyn CodeManager,
    memory: &'a dyn StackMemory,
    chain: FrameChainAccess<'a>,
    exceptions: &'a ExceptionTrackers,
    bounds: StackBounds,
    flags: WalkFlags,
    ordering: SkippedFrameOrdering,
    start_frame: Option<FrameId>,

    crawl: CrawlFrame,
    /// Region of the managed frame that contains pending skipped frames.
    cached_code: Option<CodeRegion>,
    ex_info: ExInfoWalker,
    /// Caller SP of the managed frame a resumable frame resumes into.
    resumable_frame_target_sp: Option<u64>,
    pending_cleanups: SmallVec<[CleanupAction; 2]>,
    frames_processed: u32,

    // funclet tracking
    sf_parent: StackFrame,
    sf_funclet_parent: StackFrame,
    sf_intermediary_funclet_parent: StackFrame,
    process_non_filter_funclet: bool,
    process_intermediary_non_filter_funclet: bool,
    did_funclet_report_gc_refs: bool,
}

impl<'a> StackFrameIterator<'a> {
    /// Positions a new iterator on the first position `setup.flags` accept.
    pub(crate) fn init(setup: WalkSetup<'a>, seed: RegisterContext) -> Result<Self, WalkError> {
        let speculative = setup.flags.contains(WalkFlags::SPECULATIVE);
        let mut iter = Self {
            code: setup.code,
            memory: setup.memory,
            chain: setup.chain,
            exceptions: setup.exceptions,
            bounds: setup.bounds,
            flags: setup.flags,
            ordering: setup.ordering,
            start_frame: setup.start_frame,
            crawl: CrawlFrame::new(RegisterSet::new(seed), speculative),
            cached_code: None,
            ex_info: ExInfoWalker::default(),
            resumable_frame_target_sp: None,
            pending_cleanups: SmallVec::new(),
            frames_processed: 0,
            sf_parent: StackFrame::NULL,
            sf_funclet_parent: StackFrame::NULL,
            sf_intermediary_funclet_parent: StackFrame::NULL,
            process_non_filter_funclet: false,
            process_intermediary_non_filter_funclet: false,
            did_funclet_report_gc_refs: true,
        };

        let first_frame = iter.start_frame.or_else(|| iter.chain.chain().head());
        iter.set_frame(first_frame);
        let start_address = match iter.start_frame {
            Some(_) => iter.crawl.frame.as_ref().map_or(0, |frame| frame.address),
            None => 0,
        };
        iter.ex_info.walk_to_position(iter.exceptions, start_address);

        iter.check_seed(&seed)?;
        iter.process_ip(seed.ip);
        if iter.crawl.is_frameless && seed.exception_active {
            iter.crawl.has_faulted = true;
        }
        iter.process_current_frame()?;
        iter.filter()?;
        Ok(iter)
    }

    /// The current position.
    pub fn frame(&self) -> &CrawlFrame {
        &self.crawl
    }

    /// Kind of the current position.
    pub fn state(&self) -> FrameState {
        self.crawl.state
    }

    /// Whether the iterator is on a position.
    pub fn is_valid(&self) -> bool {
        !matches!(self.crawl.state, FrameState::Done | FrameState::Uninitialized)
    }

    /// The walk flags.
    pub fn flags(&self) -> WalkFlags {
        self.flags
    }

    /// Advances to the next position the walk flags accept.
    ///
    /// Returns an error when the stack cannot be unwound; the iterator must
    /// not be used after that.
    pub fn advance(&mut self) -> Result<(), WalkError> {
        if !self.is_valid() {
            return Err(WalkError::NotPositioned);
        }
        self.next_raw()?;
        self.filter()
    }

    /// Re-seeds a read-only walk from `ctx`.
    ///
    /// Explicit frames that lie below the new position are skipped. An
    /// explicit frame that returns exactly to `ctx` lends it its attributes
    /// and its more precise register state.
    pub fn reset_registers(&mut self, ctx: RegisterContext, is_first: bool) -> Result<(), WalkError> {
        if self.flags.contains(WalkFlags::POP_FRAMES) {
            return Err(WalkError::InvalidFlags("a popping walk cannot be re-seeded"));
        }
        self.crawl = CrawlFrame::new(RegisterSet::new(ctx), self.flags.contains(WalkFlags::SPECULATIVE));
        self.crawl.is_first = is_first;
        self.cached_code = None;
        self.resumable_frame_target_sp = None;
        self.reset_gc_state(false);
        self.sf_parent.clear();
        self.did_funclet_report_gc_refs = true;
        let first_frame = self.start_frame.or_else(|| self.chain.chain().head());
        self.set_frame(first_frame);

        self.check_seed(&ctx)?;
        self.process_ip(ctx.ip);
        if self.crawl.frame.is_some() {
            let mut cur_sp = self.crawl.regs.sp();
            if self.crawl.is_frameless && self.ordering == SkippedFrameOrdering::BeforeContainingFrame {
                cur_sp = self.caller_sp()?;
            }
            loop {
                let Some(frame) = self.crawl.frame.clone() else {
                    break;
                };
                if frame.address >= cur_sp {
                    break;
                }
                if frame.return_address() == ctx.ip {
                    self.apply_frame_attributes(frame.attributes());
                    frame.unwind_to_caller(&mut self.crawl.regs);
                }
                self.goto_next_frame(false)?;
            }
        }

        self.ex_info = ExInfoWalker::default();
        self.ex_info.walk_to_position(self.exceptions, self.crawl.regs.sp());
        self.process_current_frame()?;
        self.filter()
    }

    /// Cleanup actions of frames unlinked since the last call.
    pub(crate) fn take_cleanups(&mut self) -> SmallVec<[CleanupAction; 2]> {
        std::mem::take(&mut self.pending_cleanups)
    }

    /// Verifies the guard cookies recorded so far.
    pub(crate) fn check_gs_cookies(&self) -> Result<(), WalkError> {
        if self.flags.contains(WalkFlags::SKIP_GS_COOKIE_CHECK) {
            return Ok(());
        }
        let first = self.crawl.first_gs_cookie;
        let current = self.crawl.cur_gs_cookie.filter(|address| Some(*address) != first);
        for address in first.into_iter().chain(current) {
            let found = self.memory.read_word(address);
            if found == Some(process_gs_cookie()) {
                continue;
            }
            if self.crawl.is_speculative {
                return Err(WalkError::Inconsistent("stack guard cookie is unreadable or corrupted"));
            }
            fail_fast(FatalError::GsCookieMismatch {
                address,
                found: found.unwrap_or(0),
            });
        }
        Ok(())
    }

    /// A speculative walk only starts from a stack pointer inside the
    /// thread's stack. A zeroed partial context starts from the frame chain.
    fn check_seed(&self, seed: &RegisterContext) -> Result<(), WalkError> {
        if self.crawl.is_speculative && seed.sp() != 0 {
            self.bounds.check(seed.sp())?;
        }
        Ok(())
    }

    /// Checks a stack pointer produced by unwinding against the thread's
    /// stack. Leaving the stack is fatal unless the walk is speculative.
    fn check_unwound_sp(&self, sp: u64) -> Result<(), WalkError> {
        match self.bounds.check(sp) {
            Ok(()) => Ok(()),
            Err(error) if self.crawl.is_speculative => Err(error.into()),
            Err(_) => fail_fast(FatalError::StackOutOfBounds {
                sp,
                limit: self.bounds.limit,
                base: self.bounds.base,
            }),
        }
    }

    fn light_unwind(&self) -> bool {
        self.flags.is_light_unwind()
    }

    fn log_position(&self, tag: &'static str) {
        trace!(
            tag,
            step = self.frames_processed,
            state = ?self.crawl.state,
            ip = self.crawl.regs.ip(),
            sp = self.crawl.regs.sp(),
            method = ?self.crawl.method,
            frame = ?self.crawl.frame.as_ref().map(|frame| frame.kind_name()),
            "stack walk"
        );
    }

    fn set_frame(&mut self, id: Option<FrameId>) {
        self.crawl.frame_id = id;
        self.crawl.frame = id.and_then(|id| self.chain.chain().get(id)).cloned();
    }

    fn apply_frame_attributes(&mut self, attributes: FrameAttributes) {
        self.crawl.is_first = attributes.contains(FrameAttributes::RESUMABLE);
        self.crawl.is_interrupted = attributes.contains(FrameAttributes::EXCEPTION);
        if self.crawl.is_interrupted {
            self.crawl.has_faulted = attributes.contains(FrameAttributes::FAULTED);
        }
    }

    fn frame_order_violation(&self, frame: u64, sp: u64) -> WalkError {
        if self.crawl.is_speculative {
            return WalkError::Inconsistent("explicit frame chain is out of stack order");
        }
        fail_fast(FatalError::FrameChainCorrupted { frame, sp })
    }

    /// Moves to the next explicit frame, unlinking the current one in a
    /// popping walk.
    fn goto_next_frame(&mut self, run_cleanup: bool) -> Result<(), WalkError> {
        let Some(id) = self.crawl.frame_id else {
            return Ok(());
        };
        let old_address = self.crawl.frame.as_ref().map_or(0, |frame| frame.address);
        let next = match &mut self.chain {
            FrameChainAccess::Shared(chain) => chain.next(id),
            FrameChainAccess::Popping(chain) => {
                if chain.head() != Some(id) {
                    return Err(WalkError::Inconsistent("popping walk left the head of the frame chain"));
                }
                if let Some(popped) = chain.pop() {
                    trace!(frame = popped.kind_name(), address = popped.address, "popped explicit frame");
                    if let (true, Some(action)) = (run_cleanup, popped.on_unwind) {
                        self.pending_cleanups.push(action);
                    }
                }
                chain.head()
            }
        };
        self.set_frame(next);
        if let Some(frame) = &self.crawl.frame {
            if frame.address <= old_address {
                return Err(self.frame_order_violation(frame.address, old_address));
            }
        }
        Ok(())
    }

    fn process_ip(&mut self, ip: u64) {
        self.crawl.code = self.code.lookup(ip);
        self.crawl.is_frameless = self.crawl.code.is_some();
    }

    fn current_region(&self) -> Result<CodeRegion, WalkError> {
        self.crawl.code.clone().ok_or(WalkError::NotPositioned)
    }

    /// Where explicit frames nest after their containing frame, the runtime
    /// and not the compiled code leaves the monitor of a synchronized method.
    /// A popping walk queues the release when it leaves such a frame.
    fn queue_monitor_release(&mut self, region: &CodeRegion) -> Result<(), WalkError> {
        if !matches!(self.chain, FrameChainAccess::Popping(_))
            || self.ordering != SkippedFrameOrdering::AfterContainingFrame
            || !region.flags().contains(MethodFlags::SYNCHRONIZED)
        {
            return Ok(());
        }
        let info = region.method_info().map_err(UnwindError::from)?;
        let Some(slot) = info.monitor_slot else {
            return Ok(());
        };
        let caller_sp = caller_sp_of(&self.crawl.regs.current, region)?;
        let object = self.memory.load(caller_sp.wrapping_add_signed(i64::from(slot)))?;
        if object != 0 {
            trace!(method = %region.method(), object, "leaving monitor of synchronized method");
            self.pending_cleanups.push(CleanupAction::ReleaseMonitor { object });
        }
        Ok(())
    }

    /// Caller SP of the current managed frame, computing the caller context
    /// if needed.
    fn caller_sp(&mut self) -> Result<u64, WalkError> {
        let region = match (&self.crawl.code, &self.cached_code) {
            (Some(region), _) | (None, Some(region)) => region.clone(),
            (None, None) => return Err(WalkError::NotPositioned),
        };
        let light = self.light_unwind();
        Ok(ensure_caller_context_valid(
            &mut self.crawl.regs,
            &region,
            self.memory,
            light,
        )?)
    }

    /// Stack address identifying the current position for exception range
    /// checks.
    fn position_identity(&mut self) -> Result<u64, WalkError> {
        if self.crawl.state == FrameState::FramelessMethod {
            self.caller_sp()
        } else {
            Ok(self.crawl.frame.as_ref().map_or(0, |frame| frame.address))
        }
    }

    fn has_been_unwound_by_any_exception(&mut self) -> Result<bool, WalkError> {
        let sp = self.position_identity()?;
        Ok(self.exceptions.has_frame_been_unwound_by_any(sp))
    }

    fn is_in_region_unwound_by_current_exception(&mut self) -> Result<bool, WalkError> {
        let sp = self.position_identity()?;
        Ok(self.exceptions.is_in_region_unwound_by_current(sp))
    }

    fn is_unwound_to_parent(&mut self, parent: StackFrame) -> Result<bool, WalkError> {
        Ok(StackFrame::new(self.caller_sp()?) == parent)
    }

    /// The caller SP of the method frame the current funclet belongs to.
    ///
    /// Outside GC reporting filter funclets have no parent to skip to.
    fn find_parent(&mut self, for_gc_reporting: bool) -> Result<StackFrame, WalkError> {
        if !self.crawl.is_funclet() || (!for_gc_reporting && self.crawl.is_filter_funclet()) {
            return Ok(StackFrame::NULL);
        }
        let region = self.current_region()?;
        let info = region.method_info().map_err(UnwindError::from)?;
        let Some(slot) = info.unwind.parent_sp_slot else {
            return Ok(StackFrame::NULL);
        };
        let address = self.crawl.regs.sp().wrapping_add_signed(i64::from(slot));
        Ok(StackFrame::new(self.memory.load(address)?))
    }

    fn is_il_stub(&self) -> bool {
        self.crawl
            .code
            .as_ref()
            .is_some_and(|code| code.flags().contains(MethodFlags::IL_STUB))
    }

    fn reset_gc_state(&mut self, only_intermediary: bool) {
        if !only_intermediary {
            self.sf_funclet_parent.clear();
            self.process_non_filter_funclet = false;
        }
        self.sf_intermediary_funclet_parent.clear();
        self.process_intermediary_non_filter_funclet = false;
    }

    /// Explicit frames between the current managed frame and the reference
    /// SP are nested inside it. Returns whether one is now the position.
    fn check_for_skipped_frames(&mut self) -> Result<bool, WalkError> {
        if self.crawl.frame.is_none() {
            return Ok(false);
        }
        let reference_sp = match self.ordering {
            SkippedFrameOrdering::AfterContainingFrame => self.crawl.regs.sp(),
            SkippedFrameOrdering::BeforeContainingFrame => self.caller_sp()?,
        };
        loop {
            let Some(frame) = &self.crawl.frame else {
                return Ok(false);
            };
            if frame.address >= reference_sp {
                return Ok(false);
            }
            if self.flags.contains(WalkFlags::SUPPRESS_SKIPPED_FRAMES) {
                self.goto_next_frame(false)?;
                continue;
            }
            self.crawl.method = frame.owning_method();
            self.crawl.is_frameless = false;
            self.crawl.code = None;
            self.crawl.state = FrameState::SkippedFrame;
            self.log_position("CONSIDER");
            return Ok(true);
        }
    }

    fn pre_processing_for_managed_frames(&mut self) -> Result<(), WalkError> {
        if let Some(target) = self.resumable_frame_target_sp.take() {
            if self.crawl.regs.caller_sp() != Some(target) {
                return Err(WalkError::Inconsistent(
                    "resumable frame did not resume into its managed caller",
                ));
            }
            self.crawl.is_first = true;
        }

        let region = self.current_region()?;
        let info = region.method_info().map_err(UnwindError::from)?;
        if let Some(offset) = info.gs_cookie_offset {
            if !self.flags.contains(WalkFlags::SKIP_GS_COOKIE_CHECK) {
                let caller_sp = caller_sp_of(&self.crawl.regs.current, &region)?;
                self.crawl
                    .set_cur_gs_cookie(caller_sp.wrapping_add_signed(i64::from(offset)));
            }
        }

        self.crawl.state = FrameState::FramelessMethod;
        self.log_position("CONSIDER");
        Ok(())
    }

    fn post_processing_for_managed_frames(&mut self) {
        self.ex_info.walk_to_position(self.exceptions, self.crawl.regs.sp());
        self.process_ip(self.crawl.regs.ip());
        if !self.crawl.is_frameless {
            self.crawl.state = FrameState::NativeMarker;
            self.crawl.is_native_marker = true;
        }
    }

    fn post_processing_for_no_frame_transition(&mut self) -> Result<(), WalkError> {
        let Some(ctx) = self.ex_info.context(self.exceptions) else {
            return Err(WalkError::Inconsistent("no-frame transition without a fault context"));
        };
        self.process_ip(ctx.ip);
        if !self.crawl.is_frameless {
            return Err(WalkError::Inconsistent("fault context is not in managed code"));
        }
        self.crawl.regs.set_current(ctx);
        self.crawl.is_interrupted = true;
        self.crawl.has_faulted = ctx.exception_active;
        if !self.crawl.has_faulted {
            // the fault was unwound out of a helper into its managed caller
            self.crawl.is_first = false;
        }
        self.ex_info.walk_one();
        self.crawl.is_no_frame_transition = false;
        self.crawl.no_frame_transition_marker = 0;
        Ok(())
    }

    /// Classifies the position reached by the last raw step.
    fn process_current_frame(&mut self) -> Result<(), WalkError> {
        self.check_gs_cookies()?;

        let mut done = false;
        if self.crawl.state == FrameState::Uninitialized {
            if !self.crawl.is_frameless {
                self.crawl.state = FrameState::InitialNativeContext;
                done = true;
            }
        } else {
            self.crawl.state = FrameState::Uninitialized;
        }

        if !done && !self.crawl.is_frameless {
            let code = self.code;
            self.ex_info
                .walk_to_managed(self.exceptions, |ip| code.is_managed_code(ip));
            if let Some(ctx) = self.ex_info.context(self.exceptions) {
                let context_sp = ctx.sp();
                let newer_than_next_frame = match &self.crawl.frame {
                    None => true,
                    Some(frame) => {
                        context_sp < frame.address
                            && !matches!(frame.kind, FrameKind::FaultingException { .. })
                    }
                };
                if newer_than_next_frame {
                    self.crawl.state = FrameState::NoFrameTransition;
                    self.crawl.is_no_frame_transition = true;
                    self.crawl.no_frame_transition_marker = context_sp;
                    done = true;
                }
            }
        }

        if done {
            return Ok(());
        }

        if !self.crawl.is_frameless && self.crawl.frame.is_none() {
            trace!(step = self.frames_processed, "reached the end of the stack");
            self.crawl.state = FrameState::Done;
            return Ok(());
        }

        if self.crawl.is_frameless {
            self.crawl.method = self.crawl.code.as_ref().map(CodeRegion::method);
            self.cached_code = self.crawl.code.clone();
            let skipped = self.ordering == SkippedFrameOrdering::BeforeContainingFrame
                && self.check_for_skipped_frames()?;
            if !skipped {
                self.pre_processing_for_managed_frames()?;
            }
        } else {
            self.crawl.method = self.crawl.frame.as_ref().and_then(|frame| frame.owning_method());
            self.crawl.state = FrameState::Frame;
            self.log_position("CONSIDER");
        }
        Ok(())
    }

    /// Advances one position regardless of the walk flags.
    fn next_raw(&mut self) -> Result<(), WalkError> {
        self.frames_processed += 1;

        match self.crawl.state {
            FrameState::SkippedFrame => {
                self.goto_next_frame(true)?;
                if self.check_for_skipped_frames()? {
                    return Ok(());
                }
                match self.ordering {
                    SkippedFrameOrdering::AfterContainingFrame => {
                        // the containing frame was delivered before its nested frames
                        self.post_processing_for_managed_frames();
                        if self.crawl.state == FrameState::NativeMarker {
                            return Ok(());
                        }
                    }
                    SkippedFrameOrdering::BeforeContainingFrame => {
                        self.crawl.is_frameless = true;
                        self.crawl.code = self.cached_code.clone();
                        self.crawl.method = self.crawl.code.as_ref().map(CodeRegion::method);
                        return self.pre_processing_for_managed_frames();
                    }
                }
            }
            FrameState::FramelessMethod => {
                if let Some(frame) = &self.crawl.frame {
                    let sp = self.crawl.regs.sp();
                    let pushed_after_entry = matches!(frame.kind, FrameKind::FaultingException { .. });
                    if frame.address <= sp && !pushed_after_entry {
                        return Err(self.frame_order_violation(frame.address, sp));
                    }
                }

                let region = self.current_region()?;
                self.queue_monitor_release(&region)?;
                let old_sp = self.crawl.regs.sp();
                let light = self.light_unwind();
                unwind_stack_frame(&mut self.crawl.regs, &region, self.memory, light)?;
                let new_sp = self.crawl.regs.sp();
                trace!(
                    step = self.frames_processed,
                    method = %region.method(),
                    old_sp,
                    new_sp,
                    ip = self.crawl.regs.ip(),
                    "unwound managed frame"
                );

                if new_sp <= old_sp {
                    return Err(UnwindError::NoProgress { old_sp, new_sp }.into());
                }
                self.check_unwound_sp(new_sp)?;

                self.crawl.is_first = false;
                self.crawl.is_interrupted = false;
                self.crawl.has_faulted = false;

                if self.ordering == SkippedFrameOrdering::AfterContainingFrame
                    && self.check_for_skipped_frames()?
                {
                    return Ok(());
                }

                self.post_processing_for_managed_frames();
                if self.crawl.state == FrameState::NativeMarker {
                    return Ok(());
                }
            }
            FrameState::Frame => {
                let Some(frame) = self.crawl.frame.clone() else {
                    return Err(WalkError::Inconsistent("explicit frame position without a frame"));
                };
                self.apply_frame_attributes(frame.attributes());

                let return_address = frame.return_address();
                if return_address != 0 {
                    self.process_ip(return_address);
                    if self.crawl.is_frameless {
                        let old_sp = self.crawl.regs.sp();
                        frame.unwind_to_caller(&mut self.crawl.regs);
                        let new_sp = self.crawl.regs.sp();
                        self.check_unwound_sp(new_sp)?;
                        // an inlined call marker lives inside the frame it returns to
                        let frame_limit = match frame.kind {
                            FrameKind::InlinedCall { .. } => self.caller_sp()?,
                            _ => new_sp,
                        };
                        if new_sp < old_sp || frame.address >= frame_limit {
                            return Err(self.frame_order_violation(frame.address, new_sp));
                        }
                        if self.crawl.is_first {
                            if self.flags.contains(WalkFlags::SPECULATIVE | WalkFlags::THREAD_IS_SUSPENDED) {
                                // unwinding a resumable frame may need locks the suspended thread holds
                                return Err(WalkError::Inconsistent(
                                    "resumable frame on a thread suspended for sampling",
                                ));
                            }
                            self.resumable_frame_target_sp = Some(self.caller_sp()?);
                        }
                    }
                }
                self.goto_next_frame(true)?;
            }
            FrameState::NoFrameTransition => self.post_processing_for_no_frame_transition()?,
            FrameState::NativeMarker => self.crawl.is_native_marker = false,
            FrameState::InitialNativeContext => {}
            FrameState::Uninitialized | FrameState::Done => return Err(WalkError::NotPositioned),
        }

        self.process_current_frame()
    }

    /// Advances until the current position is one the walk flags accept.
    fn filter(&mut self) -> Result<(), WalkError> {
        while self.is_valid() {
            self.crawl.parent_skips_gc_reporting = false;
            self.crawl.should_report_gc_refs = true;
            self.crawl.parent_uses_unwind_target_pc = false;
            self.crawl.unwind_target_ip = 0;
            let mut skipping_funclet = !self.sf_parent.is_null();

            let stop = match self.crawl.state {
                FrameState::FramelessMethod => self.filter_frameless(&mut skipping_funclet)?,
                FrameState::Frame | FrameState::SkippedFrame => {
                    self.filter_explicit_frame(skipping_funclet)?
                }
                FrameState::NoFrameTransition => {
                    !skipping_funclet && self.flags.contains(WalkFlags::NOTIFY_ON_NO_FRAME_TRANSITIONS)
                }
                FrameState::NativeMarker => {
                    !skipping_funclet && self.flags.contains(WalkFlags::NOTIFY_ON_U2M_TRANSITIONS)
                }
                FrameState::InitialNativeContext => {
                    !skipping_funclet
                        && self.flags.contains(WalkFlags::NOTIFY_ON_INITIAL_NATIVE_CONTEXT)
                }
                FrameState::Uninitialized | FrameState::Done => {
                    fail_fast(FatalError::Unreachable("filtering an unpositioned iterator"))
                }
            };
            if stop {
                break;
            }
            self.log_position("FILTER");
            self.next_raw()?;
        }
        Ok(())
    }

    fn filter_explicit_frame(&mut self, skipping_funclet: bool) -> Result<bool, WalkError> {
        if skipping_funclet {
            return Ok(false);
        }
        if self.flags.contains(WalkFlags::GC_FUNCLET_REFERENCE_REPORTING) {
            if self.has_been_unwound_by_any_exception()? {
                // still delivered so the frame's method stays alive
                self.crawl.should_report_gc_refs = false;
            }
        } else if self.flags.skips_to_funclet_parent()
            && self.is_in_region_unwound_by_current_exception()?
        {
            return Ok(false);
        }
        Ok(self.crawl.method.is_some() || !self.flags.contains(WalkFlags::FUNCTIONS_ONLY))
    }

    /// Tracks funclet parents while reporting GC references. Loops while the
    /// current frame must be examined again as a fresh frame.
    fn process_funclets_for_gc_reporting(
        &mut self,
        skip_funclet_callback: &mut bool,
    ) -> Result<(), WalkError> {
        loop {
            let mut recheck = false;
            if !self.sf_funclet_parent.is_null() {
                if !self.process_non_filter_funclet && !self.process_intermediary_non_filter_funclet {
                    if self.is_unwound_to_parent(self.sf_funclet_parent)? {
                        trace!(parent = ?self.sf_funclet_parent, "reached parent of filter funclet");
                        // the parent is live while its filter runs; both report
                        self.crawl.parent_skips_gc_reporting = false;
                        self.reset_gc_state(false);
                        // the parent may itself be a funclet
                        recheck = true;
                    } else if self.crawl.is_filter_funclet() {
                        return Err(WalkError::Inconsistent("filter funclet nested in a filter funclet"));
                    } else if self.crawl.is_funclet() {
                        // a non-filter funclet called while a filter is on the stack
                        self.sf_intermediary_funclet_parent = self.find_parent(true)?;
                        self.process_intermediary_non_filter_funclet = true;
                        self.sf_parent = self.sf_intermediary_funclet_parent;
                        *skip_funclet_callback = false;
                    }
                }
            } else if self.crawl.is_funclet() {
                self.sf_funclet_parent = self.find_parent(true)?;
                if !self.sf_funclet_parent.is_null() {
                    let is_filter = self.crawl.is_filter_funclet();
                    trace!(
                        filter = is_filter,
                        sp = self.crawl.regs.sp(),
                        parent = ?self.sf_funclet_parent,
                        "found funclet"
                    );
                    if is_filter {
                        self.process_non_filter_funclet = false;
                    } else {
                        self.process_non_filter_funclet = true;
                        self.sf_parent = self.sf_funclet_parent;
                        *skip_funclet_callback = false;
                    }
                }
            }
            if !recheck {
                return Ok(());
            }
        }
    }

    fn filter_frameless(&mut self, skipping_funclet: &mut bool) -> Result<bool, WalkError> {
        let gc_reporting = self.flags.contains(WalkFlags::GC_FUNCLET_REFERENCE_REPORTING);
        let mut skip_funclet_callback = true;
        let mut reexamined = false;

        'process: loop {
            if gc_reporting {
                self.process_funclets_for_gc_reporting(&mut skip_funclet_callback)?;
            }

            let skipping_to_parent = self.process_non_filter_funclet
                || self.process_intermediary_non_filter_funclet
                || self.flags.skips_to_funclet_parent();
            if !skipping_to_parent {
                if gc_reporting && self.has_been_unwound_by_any_exception()? {
                    self.crawl.should_report_gc_refs = false;
                }
                return Ok(true);
            }

            let mut skip_due_to_unwind = false;
            if gc_reporting {
                if self.has_been_unwound_by_any_exception()? {
                    self.crawl.should_report_gc_refs = false;
                    skip_due_to_unwind = true;
                    if self.crawl.is_funclet() && !*skipping_funclet {
                        // an unwound funclet has nothing left to report for its parent
                        self.did_funclet_report_gc_refs = false;
                    }
                }
            } else if self.is_in_region_unwound_by_current_exception()? {
                skip_due_to_unwind = true;
            }

            if skip_due_to_unwind {
                if gc_reporting && !self.sf_parent.is_null() {
                    let parent = self.sf_parent;
                    if parent.is_max() || self.is_unwound_to_parent(parent)? {
                        *skipping_funclet = false;
                        if self.process_intermediary_non_filter_funclet || self.process_non_filter_funclet {
                            trace!(parent = ?parent, "reached unwound parent of non-filter funclet");
                            self.crawl.parent_skips_gc_reporting = true;
                            self.did_funclet_report_gc_refs = true;
                            self.reset_gc_state(self.process_intermediary_non_filter_funclet);
                        }
                        self.sf_parent.clear();
                        if self.crawl.is_funclet() {
                            continue 'process;
                        }
                    }
                }
                // unwound frames are delivered in GC walks, without references
                return Ok(!self.crawl.should_report_gc_refs);
            }

            if !self.sf_parent.is_null() {
                let parent = self.sf_parent;
                if parent.is_max() || self.is_unwound_to_parent(parent)? {
                    if self.process_intermediary_non_filter_funclet || self.process_non_filter_funclet {
                        debug_assert!(gc_reporting);
                        let mut should_skip_reporting = true;
                        if !self.did_funclet_report_gc_refs {
                            let handler = self
                                .exceptions
                                .current()
                                .filter(|tracker| {
                                    tracker.caller_of_actual_handler_frame == self.sf_funclet_parent
                                })
                                .map(|tracker| tracker.resume_ip);
                            if let Some(resume_ip) = handler {
                                // the funclet was unwound before reporting and the
                                // parent catches; its catch handler needs the roots
                                should_skip_reporting = false;
                                self.did_funclet_report_gc_refs = true;
                                self.crawl.parent_uses_unwind_target_pc = true;
                                self.crawl.unwind_target_ip = resume_ip;
                            } else if !self.crawl.is_funclet() {
                                self.did_funclet_report_gc_refs = true;
                            }
                        }
                        trace!(
                            parent = ?parent,
                            skip_reporting = should_skip_reporting,
                            "reached parent of non-filter funclet"
                        );
                        self.crawl.parent_skips_gc_reporting = should_skip_reporting;
                        self.reset_gc_state(self.process_intermediary_non_filter_funclet);
                    }
                    self.sf_parent.clear();
                }
            }

            if self.sf_parent.is_null() && self.crawl.is_funclet() {
                if gc_reporting {
                    if !reexamined {
                        reexamined = true;
                        continue 'process;
                    }
                } else {
                    self.sf_parent = self.find_parent(false)?;
                }
            }

            if self.flags.skips_to_funclet_parent() {
                if !self.sf_parent.is_null() || self.is_il_stub() {
                    return Ok(false);
                }
            } else if skip_funclet_callback && gc_reporting && !self.sf_parent.is_null() {
                return Ok(false);
            }
            return Ok(true);
        }
    }
}
