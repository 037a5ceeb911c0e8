//! Access to the memory of the stack being walked.
//!
//! The walker never dereferences stack addresses directly: every read goes
//! through [`StackMemory`], so the same code can walk the live stack of the
//! current thread, a snapshot copied out of a sampled thread, or a
//! synthetic stack built by a test.

use stackcrawl_types::{UnwindError, WORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};

/// Read access to stack words.
pub trait StackMemory: Sync {
    /// Reads the aligned word at `address`, or `None` when it is not readable.
    fn read_word(&self, address: u64) -> Option<u64>;

    /// Reads a word, turning a failed read into an unwind error.
    fn load(&self, address: u64) -> Result<u64, UnwindError> {
        self.read_word(address)
            .ok_or(UnwindError::UnreadableMemory { address })
    }
}

/// The address range `[limit, base)` occupied by a thread's stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest usable address.
    pub limit: u64,
    /// One past the highest address; the stack grows down from here.
    pub base: u64,
}

impl StackBounds {
    /// Bounds covering `[limit, base)`, or `None` when `limit` lies above
    /// `base`.
    pub fn new(limit: u64, base: u64) -> Option<Self> {
        (limit <= base).then_some(Self { limit, base })
    }

    /// Bounds that accept every address, for stacks of unknown extent.
    pub fn unbounded() -> Self {
        Self {
            limit: 0,
            base: u64::MAX,
        }
    }

    /// Whether `sp` is a plausible stack pointer for this stack.
    pub fn contains(&self, sp: u64) -> bool {
        self.limit <= sp && sp < self.base
    }

    /// Checks a stack pointer against the bounds.
    pub fn check(&self, sp: u64) -> Result<(), UnwindError> {
        if self.contains(sp) {
            Ok(())
        } else {
            Err(UnwindError::StackOutOfBounds {
                sp,
                limit: self.limit,
                base: self.base,
            })
        }
    }

    /// Bounds of the calling thread's stack.
    #[cfg(unix)]
    pub fn current_thread() -> Option<Self> {
        let (stackaddr, stacksize) = unsafe { thread_stack() }?;
        Some(Self {
            limit: stackaddr as u64,
            base: (stackaddr + stacksize) as u64,
        })
    }

    /// Bounds of the calling thread's stack.
    #[cfg(not(unix))]
    pub fn current_thread() -> Option<Self> {
        None
    }
}

#[cfg(target_os = "macos")]
unsafe fn thread_stack() -> Option<(usize, usize)> {
    unsafe {
        let this_thread = libc::pthread_self();
        let stackaddr = libc::pthread_get_stackaddr_np(this_thread);
        let stacksize = libc::pthread_get_stacksize_np(this_thread);
        Some((stackaddr as usize - stacksize, stacksize))
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
unsafe fn thread_stack() -> Option<(usize, usize)> {
    unsafe {
        let this_thread = libc::pthread_self();
        let mut thread_attrs: libc::pthread_attr_t = std::mem::zeroed();
        #[cfg(not(target_os = "freebsd"))]
        let rc = libc::pthread_getattr_np(this_thread, &mut thread_attrs);
        #[cfg(target_os = "freebsd")]
        let rc = libc::pthread_attr_get_np(this_thread, &mut thread_attrs);
        if rc != 0 {
            return None;
        }
        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&thread_attrs, &mut stackaddr, &mut stacksize);
        libc::pthread_attr_destroy(&mut thread_attrs);
        (rc == 0).then_some((stackaddr as usize, stacksize))
    }
}

/// A word-addressed copy of a stack region.
///
/// Words are atomics so a snapshot can be patched while a walk borrows it,
/// which is how a racing thread (or a corrupted stack) is simulated.
#[derive(Debug)]
pub struct SyntheticStack {
    limit: u64,
    words: Vec<AtomicU64>,
}

impl SyntheticStack {
    /// A zero-filled stack of `len_words` words starting at `limit`.
    pub fn new(limit: u64, len_words: usize) -> Self {
        let mut words = Vec::with_capacity(len_words);
        words.resize_with(len_words, || AtomicU64::new(0));
        Self { limit, words }
    }

    /// A stack initialized from captured words.
    pub fn from_words(limit: u64, words: &[u64]) -> Self {
        Self {
            limit,
            words: words.iter().map(|&word| AtomicU64::new(word)).collect(),
        }
    }

    /// The address range the stack covers.
    pub fn bounds(&self) -> StackBounds {
        StackBounds {
            limit: self.limit,
            base: self.limit + self.words.len() as u64 * WORD_SIZE,
        }
    }

    fn index(&self, address: u64) -> Option<usize> {
        if address % WORD_SIZE != 0 || address < self.limit {
            return None;
        }
        let index = usize::try_from((address - self.limit) / WORD_SIZE).ok()?;
        (index < self.words.len()).then_some(index)
    }

    /// Overwrites the word at `address`. Returns `false` when it is out of range.
    pub fn write_word(&self, address: u64, value: u64) -> bool {
        match self.index(address) {
            Some(index) => {
                self.words[index].store(value, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

impl StackMemory for SyntheticStack {
    fn read_word(&self, address: u64) -> Option<u64> {
        self.index(address)
            .map(|index| self.words[index].load(Ordering::Relaxed))
    }
}

/// The stack of the current process, read in place.
#[derive(Debug)]
pub struct LiveStack {
    bounds: StackBounds,
}

impl LiveStack {
    /// Reads the stack within `bounds` directly.
    ///
    /// # Safety
    ///
    /// Every aligned address inside `bounds` must be mapped and readable for
    /// as long as the value is used.
    pub unsafe fn new(bounds: StackBounds) -> Self {
        Self { bounds }
    }
}

impl StackMemory for LiveStack {
    fn read_word(&self, address: u64) -> Option<u64> {
        if address % WORD_SIZE != 0 || !self.bounds.contains(address) {
            return None;
        }
        let end = address.checked_add(WORD_SIZE)?;
        if end > self.bounds.base {
            return None;
        }
        // SAFETY: the constructor guarantees the bounds are mapped.
        Some(unsafe { std::ptr::read_volatile(address as usize as *const u64) })
    }
}
