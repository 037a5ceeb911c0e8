//! The process-wide stack guard cookie.
//!
//! The JIT places a copy of this value in the frame of every method that
//! has stack buffers. The walker re-reads those copies whenever control has
//! left its hands; a changed copy means the stack was overwritten.

use once_cell::sync::Lazy;

static PROCESS_GS_COOKIE: Lazy<u64> = Lazy::new(generate_cookie);

fn generate_cookie() -> u64 {
    let mut bytes = [0u8; 8];
    let cookie = match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_ne_bytes(bytes),
        Err(error) => {
            tracing::warn!(%error, "no OS randomness for the stack guard cookie");
            fallback_entropy()
        }
    };
    // zero is what an untouched stack slot holds
    if cookie == 0 { 0x2b99_2ddf_a232_49d6 } else { cookie }
}

fn fallback_entropy() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ u64::from(std::process::id()).rotate_left(32)
}

/// The cookie value every guarded frame must hold.
pub fn process_gs_cookie() -> u64 {
    *PROCESS_GS_COOKIE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_stable_and_non_zero() {
        let cookie = process_gs_cookie();
        assert_ne!(cookie, 0);
        assert_eq!(cookie, process_gs_cookie());
    }
}
