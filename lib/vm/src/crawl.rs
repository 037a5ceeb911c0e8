//! The position a stack walk is currently at.

use crate::code_registry::CodeRegion;
use crate::frames::{ExplicitFrame, FrameId};
use stackcrawl_types::{FuncletKind, MethodHandle, RegisterSet};

/// The kind of position the iterator is on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Not positioned yet, or repositioning.
    Uninitialized,
    /// The walk started in native code.
    InitialNativeContext,
    /// A managed frame described by metadata.
    FramelessMethod,
    /// An explicit frame.
    Frame,
    /// An explicit frame nested inside a managed frame.
    SkippedFrame,
    /// An exception record standing in for a missing explicit frame.
    NoFrameTransition,
    /// Managed code was entered from native code here.
    NativeMarker,
    /// The walk reached the root of the stack.
    Done,
}

/// Everything known about the current position of a walk.
///
/// A fresh value is computed at every step; callbacks receive it by
/// reference and must not keep it.
#[derive(Clone, Debug)]
pub struct CrawlFrame {
    pub(crate) state: FrameState,
    pub(crate) regs: RegisterSet,
    pub(crate) is_frameless: bool,
    pub(crate) code: Option<CodeRegion>,
    pub(crate) method: Option<MethodHandle>,
    pub(crate) frame_id: Option<FrameId>,
    pub(crate) frame: Option<ExplicitFrame>,
    pub(crate) is_first: bool,
    pub(crate) is_interrupted: bool,
    pub(crate) has_faulted: bool,
    pub(crate) is_native_marker: bool,
    pub(crate) is_no_frame_transition: bool,
    pub(crate) no_frame_transition_marker: u64,
    pub(crate) is_speculative: bool,
    pub(crate) should_report_gc_refs: bool,
    pub(crate) parent_skips_gc_reporting: bool,
    pub(crate) parent_uses_unwind_target_pc: bool,
    pub(crate) unwind_target_ip: u64,
    pub(crate) first_gs_cookie: Option<u64>,
    pub(crate) cur_gs_cookie: Option<u64>,
}

impl CrawlFrame {
    pub(crate) fn new(regs: RegisterSet, is_speculative: bool) -> Self {
        Self {
            state: FrameState::Uninitialized,
            regs,
            is_frameless: false,
            code: None,
            method: None,
            frame_id: None,
            frame: None,
            is_first: true,
            is_interrupted: false,
            has_faulted: false,
            is_native_marker: false,
            is_no_frame_transition: false,
            no_frame_transition_marker: 0,
            is_speculative,
            should_report_gc_refs: true,
            parent_skips_gc_reporting: false,
            parent_uses_unwind_target_pc: false,
            unwind_target_ip: 0,
            first_gs_cookie: None,
            cur_gs_cookie: None,
        }
    }

    /// Kind of position.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Whether the position is a managed frame described by metadata.
    pub fn is_frameless(&self) -> bool {
        self.is_frameless
    }

    /// Registers at the position.
    pub fn registers(&self) -> &RegisterSet {
        &self.regs
    }

    /// The code region of a managed position.
    pub fn code_region(&self) -> Option<&CodeRegion> {
        self.code.as_ref()
    }

    /// The method of the position, if any.
    pub fn method(&self) -> Option<MethodHandle> {
        self.method
    }

    /// The explicit frame of the position, or the next explicit frame
    /// towards the root for managed positions.
    pub fn explicit_frame(&self) -> Option<&ExplicitFrame> {
        self.frame.as_ref()
    }

    /// Handle of [`CrawlFrame::explicit_frame`].
    pub fn explicit_frame_id(&self) -> Option<FrameId> {
        self.frame_id
    }

    /// Funclet kind of a managed position.
    pub fn funclet_kind(&self) -> FuncletKind {
        self.code
            .as_ref()
            .map_or(FuncletKind::None, CodeRegion::funclet_kind)
    }

    /// Whether the position is a funclet.
    pub fn is_funclet(&self) -> bool {
        self.is_frameless && self.funclet_kind().is_funclet()
    }

    /// Whether the position is a filter funclet.
    pub fn is_filter_funclet(&self) -> bool {
        self.is_frameless && self.funclet_kind() == FuncletKind::Filter
    }

    /// Offset of the position's instruction pointer in its code region.
    pub fn code_offset(&self) -> Option<u32> {
        self.code
            .as_ref()
            .map(|code| code.code_offset(self.regs.ip()))
    }

    /// Whether the position is the most recent frame of the walk, or was
    /// interrupted where it can resume.
    pub fn is_active_frame(&self) -> bool {
        self.is_first
    }

    /// Whether the position was interrupted by an exception or a GC.
    pub fn is_interrupted(&self) -> bool {
        self.is_interrupted
    }

    /// Whether the position was interrupted by a hardware fault.
    pub fn has_faulted(&self) -> bool {
        self.has_faulted
    }

    /// Whether the position marks an entry from native code.
    pub fn is_native_marker(&self) -> bool {
        self.is_native_marker
    }

    /// Whether the position is a no-frame transition marker.
    pub fn is_no_frame_transition(&self) -> bool {
        self.is_no_frame_transition
    }

    /// Stack address of the no-frame transition, when on one.
    pub fn no_frame_transition_marker(&self) -> Option<u64> {
        self.is_no_frame_transition
            .then_some(self.no_frame_transition_marker)
    }

    /// Whether the walk is speculative.
    pub fn is_speculative(&self) -> bool {
        self.is_speculative
    }

    /// Whether references of the position are live roots. False for frames
    /// an exception has already unwound.
    pub fn should_report_gc_refs(&self) -> bool {
        self.should_report_gc_refs
    }

    /// Whether a funclet of this frame already reported its references.
    pub fn parent_skips_gc_reporting(&self) -> bool {
        self.parent_skips_gc_reporting
    }

    /// Whether the frame must report liveness at the exception's resume
    /// point instead of its current instruction pointer.
    pub fn parent_uses_unwind_target_pc(&self) -> bool {
        self.parent_uses_unwind_target_pc
    }

    /// The code offset GC liveness must be evaluated at: the exception's
    /// resume point for a parent reporting on behalf of its unwound funclet,
    /// the current instruction pointer otherwise.
    pub fn gc_liveness_offset(&self) -> Option<u32> {
        let code = self.code.as_ref()?;
        if self.parent_uses_unwind_target_pc && code.range().contains(self.unwind_target_ip) {
            return Some(code.code_offset(self.unwind_target_ip));
        }
        Some(code.code_offset(self.regs.ip()))
    }

    pub(crate) fn set_cur_gs_cookie(&mut self, address: u64) {
        if self.first_gs_cookie.is_none() {
            self.first_gs_cookie = Some(address);
        }
        self.cur_gs_cookie = Some(address);
    }
}
