use super::patchpoint::PatchpointRecord;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of a patchpoint: the method's code and the IL offset the OSR
/// variant resumes at.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchpointKey {
    /// Start of the method's main body.
    pub method_start: u64,
    /// IL offset of the patchpoint.
    pub il_offset: u32,
}

/// The patchpoint records of the methods of one loader allocator.
#[derive(Debug, Default)]
pub struct OnStackReplacementManager {
    records: Mutex<HashMap<PatchpointKey, Arc<PatchpointRecord>>>,
}

impl OnStackReplacementManager {
    /// A manager without records.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record of a patchpoint, created on first use.
    pub fn patchpoint(&self, method_start: u64, il_offset: u32) -> Arc<PatchpointRecord> {
        let key = PatchpointKey {
            method_start,
            il_offset,
        };
        let mut records = self.records.lock();
        let id = records.len() as u32;
        Arc::clone(records.entry(key).or_insert_with(|| {
            tracing::debug!(method_start, il_offset, id, "new patchpoint record");
            Arc::new(PatchpointRecord::new(id))
        }))
    }

    /// Number of patchpoints hit so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no patchpoint was hit yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The owner of the runtime data of a set of loaded methods.
///
/// Patchpoint records live as long as the methods they belong to, so they
/// hang off the allocator that owns those methods.
#[derive(Debug, Default)]
pub struct LoaderAllocator {
    osr: OnceCell<OnStackReplacementManager>,
}

impl LoaderAllocator {
    /// An allocator without OSR state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The OSR manager, created on first use.
    pub fn osr_manager(&self) -> &OnStackReplacementManager {
        self.osr.get_or_init(OnStackReplacementManager::new)
    }
}
