//! Moving a running frame onto its OSR variant.
//!
//! The OSR variant is compiled to take over the frame of the original
//! method as it is: it expects the original stack and frame pointers, and
//! the callee-saved registers of the original method's caller. Building
//! that context means unwinding out of the patchpoint helper to the
//! original frame, remembering its SP and FP, unwinding once more to get
//! the caller's registers, and then putting SP and FP back.

use crate::code_registry::CodeManager;
use crate::memory::StackMemory;
use crate::unwinder::{
    NativeUnwinder, compute_caller_context, virtual_unwind_to_first_managed_call_frame,
};
use stackcrawl_types::{OsrError, RegisterContext, UnwindError};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Bytes subtracted from the original SP so the OSR variant sees the
        /// misalignment a call leaves behind.
        pub const OSR_ENTRY_SP_ADJUSTMENT: u64 = 8;
    } else {
        /// Bytes subtracted from the original SP so the OSR variant sees the
        /// misalignment a call leaves behind.
        pub const OSR_ENTRY_SP_ADJUSTMENT: u64 = 0;
    }
}

/// The context an OSR variant is entered with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransitionPlan {
    /// Registers to restore.
    pub context: RegisterContext,
    /// Stack pointer of the original frame.
    pub original_sp: u64,
    /// Frame pointer of the original frame.
    pub original_fp: u64,
}

/// Builds the entry context of the OSR variant at `osr_entry`.
///
/// `helper_context` holds the registers at entry to the patchpoint helper,
/// which must have been called from the original method with return
/// address `patchpoint_ip`.
pub fn prepare_transition(
    code: &dyn CodeManager,
    native: &dyn NativeUnwinder,
    memory: &dyn StackMemory,
    helper_context: RegisterContext,
    patchpoint_ip: u64,
    osr_entry: u64,
) -> Result<TransitionPlan, OsrError> {
    let mut ctx = helper_context;
    virtual_unwind_to_first_managed_call_frame(&mut ctx, code, native, memory)?;

    let original_sp = ctx.sp();
    let original_fp = ctx.fp();
    if ctx.ip != patchpoint_ip {
        return Err(OsrError::UnexpectedContextIp {
            expected: patchpoint_ip,
            actual: ctx.ip,
        });
    }

    let region = code
        .lookup(ctx.ip)
        .ok_or(OsrError::NotManagedCode { pc: ctx.ip })?;
    let info = region.method_info().map_err(UnwindError::from)?;
    let mut entry = compute_caller_context(&ctx, info, memory, false)?;

    let mut sp = original_sp;
    if OSR_ENTRY_SP_ADJUSTMENT != 0 {
        if sp % 16 != 0 {
            return Err(OsrError::MisalignedFrame { sp });
        }
        sp -= OSR_ENTRY_SP_ADJUSTMENT;
        if entry.ssp != 0 {
            entry.ssp -= OSR_ENTRY_SP_ADJUSTMENT;
        }
    }
    entry.set_fp(original_fp);
    entry.set_sp(sp);
    entry.ip = osr_entry;
    entry.exception_active = false;

    Ok(TransitionPlan {
        context: entry,
        original_sp,
        original_fp,
    })
}

/// Resumes execution from a register context.
pub trait ContextRestorer: Send + Sync {
    /// Loads `context` into the machine and jumps to its instruction pointer.
    fn restore(&self, context: &RegisterContext) -> !;
}

/// Performs the transition described by `plan`.
pub fn transition(plan: &TransitionPlan, restorer: &dyn ContextRestorer) -> ! {
    tracing::debug!(
        ip = plan.context.ip,
        sp = plan.context.sp(),
        fp = plan.context.fp(),
        "transitioning to OSR variant"
    );
    restorer.restore(&plan.context)
}

/// Restores the callee-saved registers, SP and IP of the current thread.
///
/// Scratch registers are not restored: the OSR variant is entered as if
/// called, so it assumes nothing about them.
#[derive(Copy, Clone, Debug, Default)]
pub struct NativeContextRestorer;

#[cfg(all(target_arch = "x86_64", unix))]
mod native {
    use stackcrawl_types::{GPR, RegisterContext};

    #[repr(C)]
    struct NonvolatileState {
        rbx: u64,
        rbp: u64,
        r12: u64,
        r13: u64,
        r14: u64,
        r15: u64,
        rsp: u64,
        rip: u64,
    }

    /// # Safety
    ///
    /// `context` must describe a frame the OSR variant can run on.
    pub(super) unsafe fn restore(context: &RegisterContext) -> ! {
        let state = NonvolatileState {
            rbx: context.get(GPR::RBX),
            rbp: context.get(GPR::RBP),
            r12: context.get(GPR::R12),
            r13: context.get(GPR::R13),
            r14: context.get(GPR::R14),
            r15: context.get(GPR::R15),
            rsp: context.sp(),
            rip: context.ip,
        };
        unsafe {
            core::arch::asm!(
                "mov rbx, [rax]",
                "mov rbp, [rax + 8]",
                "mov r12, [rax + 16]",
                "mov r13, [rax + 24]",
                "mov r14, [rax + 32]",
                "mov r15, [rax + 40]",
                "mov rsp, [rax + 48]",
                "jmp qword ptr [rax + 56]",
                in("rax") &state as *const NonvolatileState,
                options(noreturn),
            )
        }
    }
}

impl ContextRestorer for NativeContextRestorer {
    #[cfg(all(target_arch = "x86_64", unix))]
    fn restore(&self, context: &RegisterContext) -> ! {
        // SAFETY: the context was built by `prepare_transition` from the
        // current thread's own stack.
        unsafe { native::restore(context) }
    }

    #[cfg(not(all(target_arch = "x86_64", unix)))]
    fn restore(&self, _context: &RegisterContext) -> ! {
        crate::fatal::fail_fast(crate::fatal::FatalError::Unreachable(
            "no native context restorer for this target",
        ))
    }
}
