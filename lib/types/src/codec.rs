//! Binary encoding of the per-region method info blob.
//!
//! The layout is a version byte followed by leb128 records:
//!
//! ```text
//! version:u8 flags:u8 frame_size:uleb
//! saved_count:uleb { reg:u8 offset:sleb }*
//! [gs_cookie_offset:sleb] [parent_sp_slot:sleb] [monitor_slot:sleb]
//! slot_count:uleb { kind:u8 (reg:u8 | offset:sleb) start:uleb end:uleb flags:u8 }*
//! patchpoint_count:uleb { il_offset:uleb native_offset:uleb }*
//! ```
use crate::context::GPR;
use crate::error::DecodeError;
use crate::gcinfo::{GcInfo, GcSlot, GcSlotFlags, SlotLocation};
use crate::patchpoint::{PatchpointDescriptor, PatchpointTable};
use crate::unwind::{SavedRegister, UnwindInfo};
use smallvec::SmallVec;
use std::io::{self, Write};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Current version of the method info encoding.
pub const METHOD_INFO_VERSION: u8 = 1;

const FLAG_FRAME_POINTER: u8 = 0x1;
const FLAG_GS_COOKIE: u8 = 0x2;
const FLAG_PARENT_SP_SLOT: u8 = 0x4;
const FLAG_MONITOR_SLOT: u8 = 0x8;

const SLOT_REGISTER: u8 = 0;
const SLOT_SP: u8 = 1;
const SLOT_FP: u8 = 2;
const SLOT_CALLER_SP: u8 = 3;
const SLOT_PARENT_CALLER_SP: u8 = 4;

/// Everything the runtime knows about one compiled code region.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MethodInfo {
    /// Frame layout.
    pub unwind: UnwindInfo,
    /// Offset of the stack guard cookie relative to the caller SP.
    pub gs_cookie_offset: Option<i32>,
    /// Offset, relative to the caller SP, of the slot holding the object a
    /// synchronized method has locked. Zero in the slot means no lock is held.
    pub monitor_slot: Option<i32>,
    /// Tracked references.
    pub gc: GcInfo,
    /// OSR patchpoints of the region.
    pub patchpoints: PatchpointTable,
}

impl MethodInfo {
    /// Info for a region with the given frame layout and nothing else.
    pub fn new(unwind: UnwindInfo) -> Self {
        Self {
            unwind,
            ..Default::default()
        }
    }

    /// Serializes the info into `writer`.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut flags = 0;
        if self.unwind.frame_pointer {
            flags |= FLAG_FRAME_POINTER;
        }
        if self.gs_cookie_offset.is_some() {
            flags |= FLAG_GS_COOKIE;
        }
        if self.unwind.parent_sp_slot.is_some() {
            flags |= FLAG_PARENT_SP_SLOT;
        }
        if self.monitor_slot.is_some() {
            flags |= FLAG_MONITOR_SLOT;
        }
        writer.write_all(&[METHOD_INFO_VERSION, flags])?;
        leb128::write::unsigned(writer, u64::from(self.unwind.frame_size))?;

        leb128::write::unsigned(writer, self.unwind.saved_registers.len() as u64)?;
        for saved in &self.unwind.saved_registers {
            writer.write_all(&[saved.reg as u8])?;
            leb128::write::signed(writer, i64::from(saved.offset))?;
        }
        if let Some(offset) = self.gs_cookie_offset {
            leb128::write::signed(writer, i64::from(offset))?;
        }
        if let Some(slot) = self.unwind.parent_sp_slot {
            leb128::write::signed(writer, i64::from(slot))?;
        }
        if let Some(slot) = self.monitor_slot {
            leb128::write::signed(writer, i64::from(slot))?;
        }

        leb128::write::unsigned(writer, self.gc.slots.len() as u64)?;
        for slot in &self.gc.slots {
            match slot.location {
                SlotLocation::Register(reg) => writer.write_all(&[SLOT_REGISTER, reg as u8])?,
                SlotLocation::StackPointer(offset) => encode_offset(writer, SLOT_SP, offset)?,
                SlotLocation::FramePointer(offset) => encode_offset(writer, SLOT_FP, offset)?,
                SlotLocation::CallerStackPointer(offset) => {
                    encode_offset(writer, SLOT_CALLER_SP, offset)?
                }
                SlotLocation::ParentCallerStackPointer(offset) => {
                    encode_offset(writer, SLOT_PARENT_CALLER_SP, offset)?
                }
            }
            leb128::write::unsigned(writer, u64::from(slot.live_start))?;
            leb128::write::unsigned(writer, u64::from(slot.live_end))?;
            writer.write_all(&[slot.flags.bits()])?;
        }

        let patchpoints = self.patchpoints.entries();
        leb128::write::unsigned(writer, patchpoints.len() as u64)?;
        for patchpoint in patchpoints {
            leb128::write::unsigned(writer, u64::from(patchpoint.il_offset))?;
            leb128::write::unsigned(writer, u64::from(patchpoint.native_offset))?;
        }
        Ok(())
    }

    /// Serializes the info into a fresh buffer.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.encode_into(&mut bytes)?;
        Ok(bytes)
    }

    /// Decodes a blob produced by [`MethodInfo::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = bytes;
        let version = read_u8(&mut reader)?;
        if version != METHOD_INFO_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flags = read_u8(&mut reader)?;
        let frame_size = read_u32(&mut reader)?;

        let saved_count = read_len(&mut reader)?;
        let mut saved_registers = SmallVec::new();
        for _ in 0..saved_count {
            let reg = read_register(&mut reader)?;
            let offset = read_i32(&mut reader)?;
            saved_registers.push(SavedRegister { reg, offset });
        }
        let gs_cookie_offset = if flags & FLAG_GS_COOKIE != 0 {
            Some(read_i32(&mut reader)?)
        } else {
            None
        };
        let parent_sp_slot = if flags & FLAG_PARENT_SP_SLOT != 0 {
            Some(read_i32(&mut reader)?)
        } else {
            None
        };
        let monitor_slot = if flags & FLAG_MONITOR_SLOT != 0 {
            Some(read_i32(&mut reader)?)
        } else {
            None
        };

        let slot_count = read_len(&mut reader)?;
        let mut slots = Vec::with_capacity(slot_count.min(256));
        for _ in 0..slot_count {
            let location = match read_u8(&mut reader)? {
                SLOT_REGISTER => SlotLocation::Register(read_register(&mut reader)?),
                SLOT_SP => SlotLocation::StackPointer(read_i32(&mut reader)?),
                SLOT_FP => SlotLocation::FramePointer(read_i32(&mut reader)?),
                SLOT_CALLER_SP => SlotLocation::CallerStackPointer(read_i32(&mut reader)?),
                SLOT_PARENT_CALLER_SP => {
                    SlotLocation::ParentCallerStackPointer(read_i32(&mut reader)?)
                }
                other => return Err(DecodeError::InvalidSlotKind(other)),
            };
            let live_start = read_u32(&mut reader)?;
            let live_end = read_u32(&mut reader)?;
            let flags = GcSlotFlags::from_bits_truncate(read_u8(&mut reader)?);
            slots.push(GcSlot {
                location,
                live_start,
                live_end,
                flags,
            });
        }

        let patchpoint_count = read_len(&mut reader)?;
        let mut patchpoints = Vec::with_capacity(patchpoint_count.min(256));
        for _ in 0..patchpoint_count {
            let il_offset = read_u32(&mut reader)?;
            let native_offset = read_u32(&mut reader)?;
            patchpoints.push(PatchpointDescriptor {
                il_offset,
                native_offset,
            });
        }

        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.len()));
        }

        Ok(Self {
            unwind: UnwindInfo {
                frame_size,
                frame_pointer: flags & FLAG_FRAME_POINTER != 0,
                saved_registers,
                parent_sp_slot,
            },
            gs_cookie_offset,
            monitor_slot,
            gc: GcInfo { slots },
            patchpoints: PatchpointTable::new(patchpoints),
        })
    }
}

fn encode_offset<W: Write>(writer: &mut W, kind: u8, offset: i32) -> io::Result<()> {
    writer.write_all(&[kind])?;
    leb128::write::signed(writer, i64::from(offset))?;
    Ok(())
}

fn read_u8(reader: &mut &[u8]) -> Result<u8, DecodeError> {
    let (&byte, rest) = reader.split_first().ok_or(DecodeError::Truncated)?;
    *reader = rest;
    Ok(byte)
}

fn read_register(reader: &mut &[u8]) -> Result<GPR, DecodeError> {
    let index = read_u8(reader)?;
    GPR::from_index(index).ok_or(DecodeError::InvalidRegister(index))
}

fn read_unsigned(reader: &mut &[u8]) -> Result<u64, DecodeError> {
    leb128::read::unsigned(reader).map_err(|e| match e {
        leb128::read::Error::Overflow => DecodeError::Overflow,
        leb128::read::Error::IoError(_) => DecodeError::Truncated,
    })
}

fn read_u32(reader: &mut &[u8]) -> Result<u32, DecodeError> {
    u32::try_from(read_unsigned(reader)?).map_err(|_| DecodeError::Overflow)
}

fn read_len(reader: &mut &[u8]) -> Result<usize, DecodeError> {
    usize::try_from(read_unsigned(reader)?).map_err(|_| DecodeError::Overflow)
}

fn read_i32(reader: &mut &[u8]) -> Result<i32, DecodeError> {
    let value = leb128::read::signed(reader).map_err(|e| match e {
        leb128::read::Error::Overflow => DecodeError::Overflow,
        leb128::read::Error::IoError(_) => DecodeError::Truncated,
    })?;
    i32::try_from(value).map_err(|_| DecodeError::Overflow)
}
