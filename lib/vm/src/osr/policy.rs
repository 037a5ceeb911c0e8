//! When a patchpoint hit leads to a transition.

use super::config::OsrConfig;
use super::patchpoint::PatchpointRecord;
use crate::fatal::{FatalError, fail_fast};
use stackcrawl_types::{MethodHandle, OsrError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Backoffs that only yield before the waiting thread starts sleeping.
const YIELD_BACKOFFS: u32 = 32;

/// What a patchpoint hit resolves to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyDecision {
    /// Keep running the original code.
    Continue,
    /// Transition to the OSR variant at `code`.
    Transition {
        /// Entry point of the OSR variant.
        code: u64,
        /// Whether this hit compiled it.
        is_new: bool,
    },
}

/// The patchpoint a policy decides for, for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchpointSite {
    /// The method being executed.
    pub method: MethodHandle,
    /// IL offset of the patchpoint.
    pub il_offset: u32,
    /// Return address of the patchpoint helper call.
    pub ip: u64,
}

/// Counted patchpoints: compile once the patchpoint is hot, never block.
///
/// `counter` is the method's patchpoint counter, shared by all of its
/// patchpoints; it is always reset so the other patchpoints keep counting.
pub fn optimizing_policy<C>(
    config: &OsrConfig,
    site: &PatchpointSite,
    record: &PatchpointRecord,
    counter: &mut i32,
    compile: C,
) -> PolicyDecision
where
    C: FnOnce() -> Result<u64, OsrError>,
{
    *counter = config.counter_bump;

    if record.is_invalid() {
        trace!(id = record.id(), ip = site.ip, "invalid patchpoint");
        return PolicyDecision::Continue;
    }
    if let Some(code) = record.osr_code() {
        return PolicyDecision::Transition {
            code,
            is_new: false,
        };
    }
    if !config.enabled {
        return PolicyDecision::Continue;
    }
    if !config.in_window(record.id()) {
        debug!(id = record.id(), ip = site.ip, "ignoring patchpoint outside the OSR window");
        return PolicyDecision::Continue;
    }

    let hits = record.record_hit();
    trace!(
        id = record.id(),
        ip = site.ip,
        hits,
        limit = config.hit_limit,
        method = %site.method,
        "patchpoint hit"
    );
    if hits < config.hit_limit {
        return PolicyDecision::Continue;
    }
    if record.is_triggered() {
        trace!(id = record.id(), "awaiting OSR variant");
        return PolicyDecision::Continue;
    }
    if !record.try_trigger() {
        trace!(id = record.id(), "lost the race, awaiting OSR variant");
        return PolicyDecision::Continue;
    }

    // another thread may have published between our check and the claim
    if let Some(code) = record.osr_code() {
        return PolicyDecision::Transition {
            code,
            is_new: false,
        };
    }
    info!(
        id = record.id(),
        method = %site.method,
        il_offset = site.il_offset,
        hits,
        "compiling OSR variant"
    );
    match compile() {
        Ok(code) => {
            record.publish_osr_code(code);
            PolicyDecision::Transition { code, is_new: true }
        }
        Err(error) => {
            warn!(
                %error,
                id = record.id(),
                method = %site.method,
                il_offset = site.il_offset,
                "OSR variant creation failed, marking patchpoint invalid"
            );
            record.mark_invalid();
            PolicyDecision::Continue
        }
    }
}

/// Required patchpoints: the original code cannot continue, so wait for
/// the OSR variant or compile it. Never returns without code.
pub fn required_policy<C>(
    config: &OsrConfig,
    site: &PatchpointSite,
    record: &PatchpointRecord,
    compile: C,
) -> PolicyDecision
where
    C: FnOnce() -> Result<u64, OsrError>,
{
    if record.is_invalid() {
        invalid_required_patchpoint(site);
    }

    let mut compile = Some(compile);
    let mut backoffs = 0;
    loop {
        if let Some(code) = record.osr_code() {
            return PolicyDecision::Transition {
                code,
                is_new: false,
            };
        }
        if record.is_invalid() {
            invalid_required_patchpoint(site);
        }
        if record.is_triggered() || !record.try_trigger() {
            trace!(id = record.id(), backoffs, "awaiting required OSR variant");
            backoff(config, site, &mut backoffs);
            continue;
        }

        info!(
            id = record.id(),
            method = %site.method,
            il_offset = site.il_offset,
            "compiling required OSR variant"
        );
        let Some(compile) = compile.take() else {
            fail_fast(FatalError::Unreachable("required patchpoint triggered twice"));
        };
        match compile() {
            Ok(code) => {
                record.publish_osr_code(code);
                return PolicyDecision::Transition { code, is_new: true };
            }
            Err(reason) => {
                warn!(
                    error = %reason,
                    id = record.id(),
                    "required OSR variant creation failed, marking patchpoint invalid"
                );
                record.mark_invalid();
                fail_fast(FatalError::RequiredPatchpointFailed {
                    method: site.method,
                    il_offset: site.il_offset,
                    reason,
                });
            }
        }
    }
}

fn invalid_required_patchpoint(site: &PatchpointSite) -> ! {
    fail_fast(FatalError::RequiredPatchpointFailed {
        method: site.method,
        il_offset: site.il_offset,
        reason: OsrError::InvalidPatchpoint {
            method: site.method,
            il_offset: site.il_offset,
        },
    })
}

fn backoff(config: &OsrConfig, site: &PatchpointSite, backoffs: &mut u32) {
    if *backoffs >= config.required_max_backoffs {
        fail_fast(FatalError::RequiredPatchpointTimeout {
            method: site.method,
            il_offset: site.il_offset,
            backoffs: *backoffs,
        });
    }
    if *backoffs < YIELD_BACKOFFS {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
    *backoffs += 1;
}
