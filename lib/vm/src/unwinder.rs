//! Single-frame unwinding.
//!
//! Managed frames are unwound from the method info the JIT emitted for
//! their code region. Native frames (runtime helpers, stubs) have no such
//! metadata and are unwound through a [`NativeUnwinder`], by default by
//! following the frame-pointer chain.

use crate::code_registry::{CodeManager, CodeRegion};
use crate::memory::StackMemory;
use stackcrawl_types::{GPR, MethodInfo, RegisterContext, RegisterSet, UnwindError, WORD_SIZE};

/// Unwinds frames of code the runtime has no metadata for.
pub trait NativeUnwinder: Sync {
    /// Replaces `ctx` with the context of its caller.
    fn unwind_native_frame(
        &self,
        ctx: &mut RegisterContext,
        memory: &dyn StackMemory,
    ) -> Result<(), UnwindError>;
}

/// Unwinds native frames by following saved frame pointers.
///
/// Every native frame is expected to start with `push rbp; mov rbp, rsp`,
/// so the caller's frame pointer sits at `[rbp]` and the return address at
/// `[rbp + 8]`.
#[derive(Copy, Clone, Debug, Default)]
pub struct FramePointerUnwinder;

impl NativeUnwinder for FramePointerUnwinder {
    fn unwind_native_frame(
        &self,
        ctx: &mut RegisterContext,
        memory: &dyn StackMemory,
    ) -> Result<(), UnwindError> {
        let fp = ctx.fp();
        if fp == 0 || fp < ctx.sp() {
            return Err(UnwindError::NativeFrame { pc: ctx.ip });
        }
        let return_address = memory.load(fp.wrapping_add(WORD_SIZE))?;
        let caller_fp = memory.load(fp)?;
        let caller_sp = fp.wrapping_add(2 * WORD_SIZE);
        if caller_sp <= ctx.sp() {
            return Err(UnwindError::NoProgress {
                old_sp: ctx.sp(),
                new_sp: caller_sp,
            });
        }
        ctx.ip = return_address;
        ctx.set_sp(caller_sp);
        ctx.set_fp(caller_fp);
        ctx.exception_active = false;
        if ctx.ssp != 0 {
            ctx.ssp += WORD_SIZE;
        }
        Ok(())
    }
}

/// Computes the caller of a managed frame from its method info.
///
/// A light unwind restores only the control registers (IP, SP and the
/// frame pointer); other callee-saved registers keep their current values.
pub fn compute_caller_context(
    ctx: &RegisterContext,
    info: &MethodInfo,
    memory: &dyn StackMemory,
    light: bool,
) -> Result<RegisterContext, UnwindError> {
    let unwind = &info.unwind;
    let cfa = unwind.caller_sp(ctx.sp(), ctx.fp());
    if cfa <= ctx.sp() {
        return Err(UnwindError::NoProgress {
            old_sp: ctx.sp(),
            new_sp: cfa,
        });
    }

    let mut caller = *ctx;
    caller.exception_active = false;
    caller.ip = memory.load(cfa - WORD_SIZE)?;
    if unwind.frame_pointer {
        caller.set_fp(memory.load(cfa - 2 * WORD_SIZE)?);
    }
    for saved in &unwind.saved_registers {
        if light && saved.reg != GPR::RBP {
            continue;
        }
        let slot = cfa.wrapping_add_signed(i64::from(saved.offset));
        caller.set(saved.reg, memory.load(slot)?);
    }
    caller.set_sp(cfa);
    if ctx.ssp != 0 {
        caller.ssp = ctx.ssp + WORD_SIZE;
    }
    Ok(caller)
}

/// Makes sure `regs.caller` describes the caller of the current managed
/// frame and returns the caller's stack pointer.
pub fn ensure_caller_context_valid(
    regs: &mut RegisterSet,
    region: &CodeRegion,
    memory: &dyn StackMemory,
    light: bool,
) -> Result<u64, UnwindError> {
    if !regs.caller_valid {
        let info = region.method_info()?;
        let caller = compute_caller_context(&regs.current, info, memory, light)?;
        regs.set_caller(caller);
    }
    Ok(regs.caller.sp())
}

/// Unwinds the current managed frame, reusing a cached caller when there is one.
pub fn unwind_stack_frame(
    regs: &mut RegisterSet,
    region: &CodeRegion,
    memory: &dyn StackMemory,
    light: bool,
) -> Result<(), UnwindError> {
    if regs.advance_to_caller() {
        return Ok(());
    }
    let info = region.method_info()?;
    let caller = compute_caller_context(&regs.current, info, memory, light)?;
    regs.set_current(caller);
    Ok(())
}

/// The caller stack pointer of a managed frame, computed without reading memory.
pub fn caller_sp_of(ctx: &RegisterContext, region: &CodeRegion) -> Result<u64, UnwindError> {
    Ok(region.method_info()?.unwind.caller_sp(ctx.sp(), ctx.fp()))
}

/// Unwinds native frames until `ctx` is positioned in managed code.
pub fn virtual_unwind_to_first_managed_call_frame(
    ctx: &mut RegisterContext,
    code: &dyn CodeManager,
    native: &dyn NativeUnwinder,
    memory: &dyn StackMemory,
) -> Result<(), UnwindError> {
    while !code.is_managed_code(ctx.ip) {
        native.unwind_native_frame(ctx, memory)?;
    }
    Ok(())
}
