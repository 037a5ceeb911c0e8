//! Synthetic thread stacks shared by the integration tests.
//!
//! Every managed frame uses the SP-based layout: the return address sits
//! just below the caller's SP, and the frame's own SP is `frame_size + 8`
//! bytes lower. Callees are placed directly below their callers.

#![allow(dead_code)]

use stackcrawl_vm::{
    CodeRange, CodeRegistration, CodeRegistry, CompiledFunclet, CompiledMethod, CrawlFrame,
    ExplicitFrame, FrameKind, FrameState, FuncletKind, ManagedThread, MethodHandle, MethodInfo,
    RegisterContext, SyntheticStack,
};
use stackcrawl_types::{GPR, GcInfo, GcSlot, SlotLocation, UnwindInfo};

pub const LIMIT: u64 = 0x40_0000;
pub const STACK_WORDS: usize = 128;
/// An address outside every registered method.
pub const NATIVE_CODE: u64 = 0x9000;

pub const METHOD_A: MethodHandle = MethodHandle::new(0xa);
pub const METHOD_B: MethodHandle = MethodHandle::new(0xb);
pub const METHOD_C: MethodHandle = MethodHandle::new(0xc);
pub const METHOD_P: MethodHandle = MethodHandle::new(0xf);
/// Owner of the native call boundary frame.
pub const HELPER: MethodHandle = MethodHandle::new(0x20);

pub const FRAME_SIZE: u64 = 0x18;

// A is called by B, which was entered from native code that in turn was
// called by C through a native call boundary. C was entered from native code.
pub const SP_A: u64 = LIMIT + 0x1c0;
pub const SP_B: u64 = LIMIT + 0x1e0;
pub const B_CALLER_SP: u64 = LIMIT + 0x200;
pub const BOUNDARY_FRAME: u64 = LIMIT + 0x2f0;
pub const SP_C: u64 = LIMIT + 0x300;
pub const C_CALLER_SP: u64 = LIMIT + 0x320;
pub const ENTRY_FRAME: u64 = LIMIT + 0x3f0;

pub const IP_A: u64 = 0x1010;
pub const IP_B: u64 = 0x2010;
pub const IP_C: u64 = 0x3010;

/// Registers A, B and C.
pub fn register_methods(registry: &CodeRegistry) -> CodeRegistration {
    let method = |handle, start| {
        CompiledMethod::new(
            handle,
            CodeRange::new(start, 0x100),
            MethodInfo::new(UnwindInfo::sp_based(FRAME_SIZE as u32))
                .encode()
                .unwrap(),
        )
    };
    registry
        .register(vec![
            method(METHOD_A, 0x1000),
            method(METHOD_B, 0x2000),
            method(METHOD_C, 0x3000),
        ])
        .unwrap()
}

/// Writes the return address of a frame whose caller's SP is `caller_sp`.
pub fn link(stack: &SyntheticStack, caller_sp: u64, return_address: u64) {
    assert!(stack.write_word(caller_sp - 8, return_address));
}

/// The stack of the mixed managed/native thread.
pub fn mixed_stack() -> SyntheticStack {
    let stack = SyntheticStack::new(LIMIT, STACK_WORDS);
    link(&stack, SP_B, IP_B);
    link(&stack, B_CALLER_SP, NATIVE_CODE);
    link(&stack, C_CALLER_SP, NATIVE_CODE);
    stack
}

pub fn boundary_frame() -> ExplicitFrame {
    ExplicitFrame::new(
        BOUNDARY_FRAME,
        FrameKind::NativeCallBoundary {
            caller: RegisterContext::new(IP_C, SP_C, 0),
        },
    )
    .with_method(HELPER)
}

/// A boundary frame at the usual address whose saved caller lies below it.
pub fn misplaced_boundary_frame() -> ExplicitFrame {
    ExplicitFrame::new(
        BOUNDARY_FRAME,
        FrameKind::NativeCallBoundary {
            caller: RegisterContext::new(IP_C, LIMIT + 0x100, 0),
        },
    )
    .with_method(HELPER)
}

pub fn entry_frame() -> ExplicitFrame {
    ExplicitFrame::new(ENTRY_FRAME, FrameKind::NativeEntry)
}

/// The calling thread, owning the explicit frames of the mixed stack.
pub fn mixed_thread(stack: &SyntheticStack) -> ManagedThread {
    let mut thread = ManagedThread::new(1, stack.bounds());
    thread.push_frame(entry_frame());
    thread.push_frame(boundary_frame());
    thread
}

/// Registers of A, the leaf.
pub fn leaf_context() -> RegisterContext {
    RegisterContext::new(IP_A, SP_A, 0)
}

/// What a position looked like when it was visited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Visit {
    pub state: FrameState,
    pub method: Option<MethodHandle>,
    pub sp: u64,
}

impl Visit {
    pub fn of(frame: &CrawlFrame) -> Self {
        Self {
            state: frame.state(),
            method: frame.method(),
            sp: frame.registers().sp(),
        }
    }
}

pub fn managed(method: MethodHandle, sp: u64) -> Visit {
    Visit {
        state: FrameState::FramelessMethod,
        method: Some(method),
        sp,
    }
}

pub fn explicit(method: Option<MethodHandle>, sp: u64) -> Visit {
    Visit {
        state: FrameState::Frame,
        method,
        sp,
    }
}

// A funclet F of method P, called by the exception dispatcher (native code)
// on behalf of P, which was interrupted at IP_P.
pub const SP_F: u64 = LIMIT + 0x100;
pub const F_CALLER_SP: u64 = LIMIT + 0x110;
pub const FUNCLET_ENTRY_FRAME: u64 = LIMIT + 0x180;
pub const SP_P: u64 = LIMIT + 0x200;
pub const P_CALLER_SP: u64 = LIMIT + 0x220;

pub const IP_P: u64 = 0x4020;
/// RBX of P when it called the dispatcher.
pub const P_RBX: u64 = 0x0b0b;
/// The object P's stack slot refers to.
pub const P_OBJECT: u64 = 0x0b1e;
pub const HANDLER_START: u64 = 0x4100;
pub const FILTER_START: u64 = 0x4140;

/// Registers P with a handler and a filter funclet. P's references are a
/// stack slot live over `[0, 0x40)` and a callee-saved register live over
/// `[0x40, 0x80)`; each funclet reports one slot of P's frame.
pub fn register_parent(registry: &CodeRegistry) -> CodeRegistration {
    let mut body = MethodInfo::new(UnwindInfo::sp_based(FRAME_SIZE as u32));
    body.gc = GcInfo {
        slots: vec![
            GcSlot::new(SlotLocation::StackPointer(0), 0, 0x40),
            GcSlot::new(SlotLocation::Register(GPR::RBX), 0x40, 0x80),
        ],
    };
    let funclet = |start, kind| {
        let mut info = MethodInfo::new(UnwindInfo::sp_based(8).parent_slot(0));
        info.gc = GcInfo {
            slots: vec![GcSlot::new(SlotLocation::ParentCallerStackPointer(-0x20), 0, 0x40)],
        };
        CompiledFunclet {
            range: CodeRange::new(start, 0x40),
            kind,
            info: info.encode().unwrap(),
        }
    };
    let mut method = CompiledMethod::new(METHOD_P, CodeRange::new(0x4000, 0x100), body.encode().unwrap());
    method.funclets.push(funclet(HANDLER_START, FuncletKind::Handler));
    method.funclets.push(funclet(FILTER_START, FuncletKind::Filter));
    registry.register(vec![method]).unwrap()
}

/// The stack of a thread running a funclet of P.
pub fn funclet_stack() -> SyntheticStack {
    let stack = SyntheticStack::new(LIMIT, STACK_WORDS);
    link(&stack, F_CALLER_SP, NATIVE_CODE);
    assert!(stack.write_word(SP_F, P_CALLER_SP));
    assert!(stack.write_word(SP_P, P_OBJECT));
    link(&stack, P_CALLER_SP, NATIVE_CODE);
    stack
}

/// The calling thread, inside the dispatcher's call of a funclet of P.
pub fn funclet_thread(stack: &SyntheticStack) -> ManagedThread {
    let mut caller = RegisterContext::new(IP_P, SP_P, 0);
    caller.set(GPR::RBX, P_RBX);
    let mut thread = ManagedThread::new(2, stack.bounds());
    thread.push_frame(entry_frame());
    thread.push_frame(ExplicitFrame::new(
        FUNCLET_ENTRY_FRAME,
        FrameKind::FuncletEntry { caller },
    ));
    thread
}
