//! OSR patchpoint descriptors recorded in method debug info.

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// One instrumented safe point of an unoptimized method.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchpointDescriptor {
    /// IL offset the optimized variant resumes at.
    pub il_offset: u32,
    /// Native offset of the patchpoint helper call's return address.
    pub native_offset: u32,
}

/// The patchpoints of a method, sorted by IL offset.
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PatchpointTable {
    entries: Vec<PatchpointDescriptor>,
}

impl PatchpointTable {
    /// Builds a table, sorting the entries by IL offset.
    pub fn new(mut entries: Vec<PatchpointDescriptor>) -> Self {
        entries.sort_by_key(|entry| entry.il_offset);
        Self { entries }
    }

    /// Finds the descriptor for an IL offset.
    pub fn find(&self, il_offset: u32) -> Option<&PatchpointDescriptor> {
        self.entries
            .binary_search_by_key(&il_offset, |entry| entry.il_offset)
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Finds the descriptor whose helper call returns to `native_offset`.
    pub fn find_by_native_offset(&self, native_offset: u32) -> Option<&PatchpointDescriptor> {
        self.entries
            .iter()
            .find(|entry| entry.native_offset == native_offset)
    }

    /// All descriptors.
    pub fn entries(&self) -> &[PatchpointDescriptor] {
        &self.entries
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
