use bitflags::bitflags;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

bitflags! {
    /// State bits of a patchpoint.
    pub struct PatchpointFlags: u32 {
        /// A thread has claimed the compilation of the OSR variant.
        const TRIGGERED = 0x1;
        /// The OSR variant cannot be built. Never cleared.
        const INVALID = 0x2;
    }
}

/// Runtime state of one patchpoint, shared by every thread that hits it.
///
/// `osr_code` goes from zero to the entry point of the OSR variant exactly
/// once; a thread that reads a non-zero entry point also sees the code it
/// points to.
#[derive(Debug)]
pub struct PatchpointRecord {
    id: u32,
    hit_count: AtomicI32,
    flags: AtomicU32,
    osr_code: AtomicU64,
}

impl PatchpointRecord {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            hit_count: AtomicI32::new(0),
            flags: AtomicU32::new(0),
            osr_code: AtomicU64::new(0),
        }
    }

    /// Sequential id, in order of first hit.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of counted hits so far.
    pub fn hit_count(&self) -> i32 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Counts a hit, returning the new count.
    pub fn record_hit(&self) -> i32 {
        self.hit_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Current state bits.
    pub fn flags(&self) -> PatchpointFlags {
        PatchpointFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether the OSR variant was found impossible to build.
    pub fn is_invalid(&self) -> bool {
        self.flags().contains(PatchpointFlags::INVALID)
    }

    /// Whether a thread has claimed the compilation.
    pub fn is_triggered(&self) -> bool {
        self.flags().contains(PatchpointFlags::TRIGGERED)
    }

    /// Claims the compilation. Exactly one caller ever wins.
    pub fn try_trigger(&self) -> bool {
        let old = self.flags.load(Ordering::Acquire);
        if old & PatchpointFlags::TRIGGERED.bits() != 0 {
            return false;
        }
        self.flags
            .compare_exchange(
                old,
                old | PatchpointFlags::TRIGGERED.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the patchpoint invalid for good.
    pub fn mark_invalid(&self) {
        self.flags
            .fetch_or(PatchpointFlags::INVALID.bits(), Ordering::AcqRel);
    }

    /// Entry point of the OSR variant, once published.
    pub fn osr_code(&self) -> Option<u64> {
        match self.osr_code.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    /// Publishes the entry point of the OSR variant.
    pub(crate) fn publish_osr_code(&self, code: u64) {
        debug_assert_ne!(code, 0);
        debug_assert_eq!(self.osr_code(), None, "OSR code published twice");
        self.osr_code.store(code, Ordering::Release);
    }
}
