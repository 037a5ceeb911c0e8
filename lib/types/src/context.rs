//! Machine register state used by unwinding and on-stack replacement.
//!
//! The layout follows the x86-64 general purpose register file. Other
//! targets map their registers onto the same sixteen slots (stack pointer
//! in [`GPR::RSP`], frame pointer in [`GPR::RBP`]) so the unwinder and the
//! metadata encoding stay target independent.

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// General-purpose registers.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GPR {
    /// RAX register
    RAX,
    /// RCX register
    RCX,
    /// RDX register
    RDX,
    /// RBX register
    RBX,
    /// RSP register
    RSP,
    /// RBP register
    RBP,
    /// RSI register
    RSI,
    /// RDI register
    RDI,
    /// R8 register
    R8,
    /// R9 register
    R9,
    /// R10 register
    R10,
    /// R11 register
    R11,
    /// R12 register
    R12,
    /// R13 register
    R13,
    /// R14 register
    R14,
    /// R15 register
    R15,
}

/// Registers preserved across calls, in the order a prologue saves them.
pub const CALLEE_SAVED: [GPR; 6] = [GPR::RBX, GPR::RBP, GPR::R12, GPR::R13, GPR::R14, GPR::R15];

impl GPR {
    /// Number of general-purpose registers.
    pub const COUNT: usize = 16;

    /// Returns the index of the register in [`RegisterContext::gprs`].
    pub fn to_index(self) -> usize {
        self as usize
    }

    /// Converts an encoded register index back to a register.
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => Self::RAX,
            1 => Self::RCX,
            2 => Self::RDX,
            3 => Self::RBX,
            4 => Self::RSP,
            5 => Self::RBP,
            6 => Self::RSI,
            7 => Self::RDI,
            8 => Self::R8,
            9 => Self::R9,
            10 => Self::R10,
            11 => Self::R11,
            12 => Self::R12,
            13 => Self::R13,
            14 => Self::R14,
            15 => Self::R15,
            _ => return None,
        })
    }

    /// Whether the register survives a call.
    pub fn is_callee_saved(self) -> bool {
        CALLEE_SAVED.contains(&self)
    }
}

/// A snapshot of the machine state of one frame.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Hash)]
pub struct RegisterContext {
    /// Instruction pointer.
    pub ip: u64,
    /// General-purpose registers, indexed by [`GPR::to_index`].
    pub gprs: [u64; GPR::COUNT],
    /// Shadow stack pointer, zero when the target has no shadow stack.
    pub ssp: u64,
    /// The context was captured at a hardware fault.
    pub exception_active: bool,
}

impl RegisterContext {
    /// Builds a context from its three control registers.
    pub fn new(ip: u64, sp: u64, fp: u64) -> Self {
        let mut ctx = Self {
            ip,
            ..Default::default()
        };
        ctx.set_sp(sp);
        ctx.set_fp(fp);
        ctx
    }

    /// Stack pointer.
    pub fn sp(&self) -> u64 {
        self.gprs[GPR::RSP.to_index()]
    }

    /// Frame pointer.
    pub fn fp(&self) -> u64 {
        self.gprs[GPR::RBP.to_index()]
    }

    /// Sets the stack pointer.
    pub fn set_sp(&mut self, sp: u64) {
        self.gprs[GPR::RSP.to_index()] = sp;
    }

    /// Sets the frame pointer.
    pub fn set_fp(&mut self, fp: u64) {
        self.gprs[GPR::RBP.to_index()] = fp;
    }

    /// Reads a general-purpose register.
    pub fn get(&self, reg: GPR) -> u64 {
        self.gprs[reg.to_index()]
    }

    /// Writes a general-purpose register.
    pub fn set(&mut self, reg: GPR, value: u64) {
        self.gprs[reg.to_index()] = value;
    }
}

impl fmt::Debug for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterContext")
            .field("ip", &format_args!("{:#x}", self.ip))
            .field("sp", &format_args!("{:#x}", self.sp()))
            .field("fp", &format_args!("{:#x}", self.fp()))
            .field("ssp", &format_args!("{:#x}", self.ssp))
            .field("exception_active", &self.exception_active)
            .finish()
    }
}

/// The register display used while walking: the frame being looked at
/// plus a lazily computed view of its caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterSet {
    /// Registers of the current frame.
    pub current: RegisterContext,
    /// Registers of the caller; only meaningful when `caller_valid`.
    pub caller: RegisterContext,
    /// Whether `caller` was computed for the present `current`.
    pub caller_valid: bool,
}

impl RegisterSet {
    /// Creates a register set seeded with `current`.
    pub fn new(current: RegisterContext) -> Self {
        Self {
            current,
            caller: RegisterContext::default(),
            caller_valid: false,
        }
    }

    /// Replaces the current frame, dropping any cached caller.
    pub fn set_current(&mut self, current: RegisterContext) {
        self.current = current;
        self.caller_valid = false;
    }

    /// Records the caller of the current frame.
    pub fn set_caller(&mut self, caller: RegisterContext) {
        self.caller = caller;
        self.caller_valid = true;
    }

    /// Moves to the cached caller. Returns `false` when no caller was cached.
    pub fn advance_to_caller(&mut self) -> bool {
        if !self.caller_valid {
            return false;
        }
        self.current = self.caller;
        self.caller_valid = false;
        true
    }

    /// Instruction pointer of the current frame.
    pub fn ip(&self) -> u64 {
        self.current.ip
    }

    /// Stack pointer of the current frame.
    pub fn sp(&self) -> u64 {
        self.current.sp()
    }

    /// Frame pointer of the current frame.
    pub fn fp(&self) -> u64 {
        self.current.fp()
    }

    /// Stack pointer of the caller, if it has been computed.
    pub fn caller_sp(&self) -> Option<u64> {
        self.caller_valid.then(|| self.caller.sp())
    }
}
