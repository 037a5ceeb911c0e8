//! Reporting the live references of a managed frame to the GC.
//!
//! The GC walks a suspended thread with
//! [`WalkFlags::gc_root_enumeration`](crate::WalkFlags::gc_root_enumeration)
//! and calls [`enum_gc_refs`] on every position it is handed. The funclet
//! bookkeeping of the walk decides which of a funclet and its parent
//! reports; this module only honors those decisions.

use crate::crawl::CrawlFrame;
use crate::memory::StackMemory;
use stackcrawl_types::{GPR, GcSlotFlags, SlotLocation, UnwindError, WalkError};

/// Where a reported reference is stored.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RootLocation {
    /// A register of the frame.
    Register(GPR),
    /// A stack slot.
    Stack(u64),
}

/// One live reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GcRoot {
    /// Where the reference lives.
    pub location: RootLocation,
    /// The reference itself.
    pub value: u64,
    /// How the GC must treat it.
    pub flags: GcSlotFlags,
}

/// Reports the references of `frame` that are live at its current code
/// offset, returning how many were reported.
///
/// Positions that are not managed frames report nothing, and so do frames
/// an exception has already unwound and parents whose funclet reported on
/// their behalf.
pub fn enum_gc_refs<F>(
    frame: &CrawlFrame,
    memory: &dyn StackMemory,
    mut report: F,
) -> Result<usize, WalkError>
where
    F: FnMut(GcRoot),
{
    if !frame.is_frameless() || !frame.should_report_gc_refs() || frame.parent_skips_gc_reporting()
    {
        return Ok(0);
    }
    let (Some(region), Some(offset)) = (frame.code_region(), frame.gc_liveness_offset()) else {
        return Ok(0);
    };
    let info = region.method_info().map_err(UnwindError::from)?;
    let ctx = &frame.registers().current;
    // filter funclets and their parent both report, so nothing may move
    let pinned = frame.is_filter_funclet();

    let mut parent_caller_sp = None;
    let mut reported = 0;
    for slot in info.gc.live_slots_at(offset) {
        let location = match slot.location {
            SlotLocation::Register(reg) => {
                if !frame.is_active_frame() && !reg.is_callee_saved() {
                    // scratch registers do not survive the call this frame is in
                    continue;
                }
                RootLocation::Register(reg)
            }
            SlotLocation::StackPointer(offset) => {
                RootLocation::Stack(ctx.sp().wrapping_add_signed(i64::from(offset)))
            }
            SlotLocation::FramePointer(offset) => {
                RootLocation::Stack(ctx.fp().wrapping_add_signed(i64::from(offset)))
            }
            SlotLocation::CallerStackPointer(offset) => {
                let caller_sp = info.unwind.caller_sp(ctx.sp(), ctx.fp());
                RootLocation::Stack(caller_sp.wrapping_add_signed(i64::from(offset)))
            }
            SlotLocation::ParentCallerStackPointer(offset) => {
                let base = match parent_caller_sp {
                    Some(sp) => sp,
                    None => {
                        let Some(psp) = info.unwind.parent_sp_slot else {
                            return Err(WalkError::Inconsistent(
                                "parent-relative GC slot in a region without a parent",
                            ));
                        };
                        let sp = memory.load(ctx.sp().wrapping_add_signed(i64::from(psp)))?;
                        *parent_caller_sp.insert(sp)
                    }
                };
                RootLocation::Stack(base.wrapping_add_signed(i64::from(offset)))
            }
        };
        let value = match location {
            RootLocation::Register(reg) => ctx.get(reg),
            RootLocation::Stack(address) => memory.load(address)?,
        };
        let mut flags = slot.flags;
        if pinned {
            flags |= GcSlotFlags::PINNED;
        }
        report(GcRoot {
            location,
            value,
            flags,
        });
        reported += 1;
    }
    Ok(reported)
}
