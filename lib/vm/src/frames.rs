//! Explicit frames pushed by the runtime.
//!
//! Most managed frames carry no record at all and are unwound from
//! metadata. The runtime pushes an explicit frame wherever that is not
//! enough: at every transition between managed and native code, when an
//! exception is raised, when a thread is interrupted for a GC, and when the
//! exception dispatcher calls into a funclet. Each frame knows how to
//! restore the registers of its logical caller.

use bitflags::bitflags;
use slab::Slab;
use stackcrawl_types::{MethodHandle, RegisterContext, RegisterSet};
use std::fmt;

bitflags! {
    /// Properties of the position an explicit frame interrupts.
    #[derive(Default)]
    pub struct FrameAttributes: u32 {
        /// The frame's caller was interrupted and will resume where it stopped.
        const RESUMABLE = 0x1;
        /// The frame marks an exception raised in its caller.
        const EXCEPTION = 0x2;
        /// The exception was a hardware fault.
        const FAULTED = 0x4;
    }
}

/// Work to perform when a frame is popped by an exception unwind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CleanupAction {
    /// Release the monitor a synchronized method holds on `object`.
    ReleaseMonitor {
        /// Handle of the locked object.
        object: u64,
    },
}

/// The closed set of explicit frame kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Managed code called a native runtime helper; `caller` is the managed
    /// context at the call.
    NativeCallBoundary {
        /// Registers of the managed caller.
        caller: RegisterContext,
    },
    /// A native call inlined into a managed method. Lives inside the managed
    /// frame and is only active while the call is in progress.
    InlinedCall {
        /// Return address in the managed method, zero when no call is active.
        return_address: u64,
        /// Stack pointer of the managed method at the call.
        call_site_sp: u64,
        /// Frame pointer of the managed method at the call.
        callee_saved_fp: u64,
    },
    /// A hardware fault in managed code.
    FaultingException {
        /// Registers at the faulting instruction.
        context: RegisterContext,
    },
    /// An exception thrown by software.
    SoftwareException {
        /// Registers at the throw site.
        context: RegisterContext,
    },
    /// A thread redirected or interrupted so the GC can run.
    Resumable {
        /// Registers at the interruption point.
        context: RegisterContext,
    },
    /// The exception dispatcher calling a funclet.
    FuncletEntry {
        /// Registers of the dispatcher's managed caller.
        caller: RegisterContext,
    },
    /// Native code entering managed code. Has no managed caller.
    NativeEntry,
}

/// One explicit frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExplicitFrame {
    /// Address of the frame record on the stack.
    pub address: u64,
    /// What the frame marks.
    pub kind: FrameKind,
    /// Method the frame belongs to, if any.
    pub method: Option<MethodHandle>,
    /// Work to perform when the frame is popped by an exception unwind.
    pub on_unwind: Option<CleanupAction>,
}

impl ExplicitFrame {
    /// A frame at `address`.
    pub fn new(address: u64, kind: FrameKind) -> Self {
        Self {
            address,
            kind,
            method: None,
            on_unwind: None,
        }
    }

    /// Sets the owning method.
    pub fn with_method(mut self, method: MethodHandle) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the pop-time cleanup.
    pub fn with_cleanup(mut self, action: CleanupAction) -> Self {
        self.on_unwind = Some(action);
        self
    }

    /// The method owning the frame.
    pub fn owning_method(&self) -> Option<MethodHandle> {
        self.method
    }

    /// Where control returns once the frame's callee finishes; zero when
    /// there is no managed caller to return to.
    pub fn return_address(&self) -> u64 {
        match &self.kind {
            FrameKind::NativeCallBoundary { caller } | FrameKind::FuncletEntry { caller } => {
                caller.ip
            }
            FrameKind::InlinedCall { return_address, .. } => *return_address,
            FrameKind::FaultingException { context }
            | FrameKind::SoftwareException { context }
            | FrameKind::Resumable { context } => context.ip,
            FrameKind::NativeEntry => 0,
        }
    }

    /// Whether the frame is an inlined call marker with a call in progress.
    pub fn has_active_call(&self) -> bool {
        matches!(self.kind, FrameKind::InlinedCall { return_address, .. } if return_address != 0)
    }

    /// Attributes describing the interrupted position.
    pub fn attributes(&self) -> FrameAttributes {
        match self.kind {
            FrameKind::FaultingException { .. } => {
                FrameAttributes::EXCEPTION | FrameAttributes::FAULTED
            }
            FrameKind::SoftwareException { .. } => FrameAttributes::EXCEPTION,
            FrameKind::Resumable { .. } => FrameAttributes::RESUMABLE,
            FrameKind::NativeCallBoundary { .. }
            | FrameKind::InlinedCall { .. }
            | FrameKind::FuncletEntry { .. }
            | FrameKind::NativeEntry => FrameAttributes::empty(),
        }
    }

    /// Rewrites `regs` to the context of the frame's managed caller.
    pub fn unwind_to_caller(&self, regs: &mut RegisterSet) {
        match &self.kind {
            FrameKind::NativeCallBoundary { caller } | FrameKind::FuncletEntry { caller } => {
                regs.set_current(*caller);
            }
            FrameKind::InlinedCall {
                return_address,
                call_site_sp,
                callee_saved_fp,
            } => {
                let mut ctx = regs.current;
                ctx.ip = *return_address;
                ctx.set_sp(*call_site_sp);
                ctx.set_fp(*callee_saved_fp);
                ctx.exception_active = false;
                regs.set_current(ctx);
            }
            FrameKind::FaultingException { context }
            | FrameKind::SoftwareException { context }
            | FrameKind::Resumable { context } => {
                regs.set_current(*context);
            }
            FrameKind::NativeEntry => {}
        }
    }

    /// A short name of the frame kind, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            FrameKind::NativeCallBoundary { .. } => "NativeCallBoundary",
            FrameKind::InlinedCall { .. } => "InlinedCall",
            FrameKind::FaultingException { .. } => "FaultingException",
            FrameKind::SoftwareException { .. } => "SoftwareException",
            FrameKind::Resumable { .. } => "Resumable",
            FrameKind::FuncletEntry { .. } => "FuncletEntry",
            FrameKind::NativeEntry => "NativeEntry",
        }
    }
}

/// Handle to a frame in a [`FrameChain`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

struct FrameNode {
    frame: ExplicitFrame,
    next: Option<FrameId>,
}

/// A thread's explicit frames, most recent first.
///
/// Only the owning thread pushes and pops. Walkers borrow the chain.
#[derive(Default)]
pub struct FrameChain {
    nodes: Slab<FrameNode>,
    head: Option<FrameId>,
}

impl FrameChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `frame` as the most recent frame.
    pub fn push(&mut self, frame: ExplicitFrame) -> FrameId {
        let id = FrameId(self.nodes.insert(FrameNode {
            frame,
            next: self.head,
        }));
        self.head = Some(id);
        id
    }

    /// Unlinks the most recent frame.
    pub fn pop(&mut self) -> Option<ExplicitFrame> {
        let head = self.head?;
        let node = self.nodes.try_remove(head.0)?;
        self.head = node.next;
        Some(node.frame)
    }

    /// The most recent frame.
    pub fn head(&self) -> Option<FrameId> {
        self.head
    }

    /// Looks a frame up.
    pub fn get(&self, id: FrameId) -> Option<&ExplicitFrame> {
        self.nodes.get(id.0).map(|node| &node.frame)
    }

    /// The frame older than `id`.
    pub fn next(&self, id: FrameId) -> Option<FrameId> {
        self.nodes.get(id.0).and_then(|node| node.next)
    }

    /// Frames from the most recent to the oldest.
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &ExplicitFrame)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            let node = self.nodes.get(id.0)?;
            cursor = node.next;
            Some((id, &node.frame))
        })
    }

    /// Number of linked frames.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no frame is linked.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl fmt::Debug for FrameChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.iter()
                    .map(|(_, frame)| (frame.kind_name(), format!("{:#x}", frame.address))),
            )
            .finish()
    }
}
