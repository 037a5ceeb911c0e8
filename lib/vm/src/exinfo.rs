//! Exception trackers of a thread, as seen by the stack walker.
//!
//! The exception dispatcher keeps one tracker per exception in flight
//! (nested exceptions push further trackers). The walker only reads them:
//! to learn which frames the second pass has already unwound, which frame
//! will catch, and to find the fault context of an exception that did not
//! push an explicit frame.

use stackcrawl_types::{RegisterContext, StackFrame};

/// The dispatch pass an exception is in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionPass {
    /// Searching for a handler; nothing has been unwound.
    First,
    /// Unwinding towards the handler.
    Second,
}

/// A stack range `(lower, upper]` of caller stack pointers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StackRange {
    /// Exclusive lower bound.
    pub lower: u64,
    /// Inclusive upper bound.
    pub upper: u64,
}

impl StackRange {
    /// The range `(lower, upper]`.
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// Whether a frame identified by `sp` falls in the range.
    pub fn contains(&self, sp: u64) -> bool {
        self.lower < sp && sp <= self.upper
    }
}

/// One exception in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionTracker {
    /// Address of the tracker record on the stack.
    pub address: u64,
    /// Current dispatch pass.
    pub pass: ExceptionPass,
    /// Frames the second pass has unwound so far, by caller stack pointer.
    pub unwound: Option<StackRange>,
    /// Caller stack pointer of the frame whose clause catches the exception.
    pub caller_of_actual_handler_frame: StackFrame,
    /// Where the catching frame resumes once its catch funclet returns, zero
    /// until known.
    pub resume_ip: u64,
    /// Registers at the fault, when the exception pushed no explicit frame.
    pub context: Option<RegisterContext>,
}

impl ExceptionTracker {
    /// A first-pass tracker at `address`.
    pub fn new(address: u64) -> Self {
        Self {
            address,
            pass: ExceptionPass::First,
            unwound: None,
            caller_of_actual_handler_frame: StackFrame::NULL,
            resume_ip: 0,
            context: None,
        }
    }

    /// Whether the second pass has unwound the frame identified by `sp`.
    pub fn has_unwound(&self, sp: u64) -> bool {
        self.pass == ExceptionPass::Second && self.unwound.is_some_and(|range| range.contains(sp))
    }
}

/// The exception trackers of a thread, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionTrackers {
    trackers: Vec<ExceptionTracker>,
}

impl ExceptionTrackers {
    /// No exception in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a new, innermost exception.
    pub fn push(&mut self, tracker: ExceptionTracker) {
        self.trackers.insert(0, tracker);
    }

    /// Stops tracking the innermost exception.
    pub fn pop(&mut self) -> Option<ExceptionTracker> {
        (!self.trackers.is_empty()).then(|| self.trackers.remove(0))
    }

    /// The innermost exception.
    pub fn current(&self) -> Option<&ExceptionTracker> {
        self.trackers.first()
    }

    /// The innermost exception, mutably.
    pub fn current_mut(&mut self) -> Option<&mut ExceptionTracker> {
        self.trackers.first_mut()
    }

    /// Tracker at `index`, counting from the innermost.
    pub fn get(&self, index: usize) -> Option<&ExceptionTracker> {
        self.trackers.get(index)
    }

    /// All trackers, innermost first.
    pub fn iter(&self) -> impl Iterator<Item = &ExceptionTracker> + '_ {
        self.trackers.iter()
    }

    /// Whether any exception in flight has unwound the frame identified by `sp`.
    pub fn has_frame_been_unwound_by_any(&self, sp: u64) -> bool {
        self.trackers.iter().any(|tracker| tracker.has_unwound(sp))
    }

    /// Whether the innermost exception has unwound the frame identified by `sp`.
    pub fn is_in_region_unwound_by_current(&self, sp: u64) -> bool {
        self.current().is_some_and(|tracker| tracker.has_unwound(sp))
    }
}

/// Cursor over the fault contexts of the exception trackers.
///
/// A fault context stands in for an explicit frame that was never pushed;
/// the walker consumes these contexts in stack order as it passes them.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ExInfoWalker {
    index: usize,
}

impl ExInfoWalker {
    pub(crate) fn context(&self, trackers: &ExceptionTrackers) -> Option<RegisterContext> {
        trackers.get(self.index).and_then(|tracker| tracker.context)
    }

    pub(crate) fn walk_one(&mut self) {
        self.index += 1;
    }

    /// Skips trackers whose context is more recent than `sp` or absent.
    pub(crate) fn walk_to_position(&mut self, trackers: &ExceptionTrackers, sp: u64) {
        while let Some(tracker) = trackers.get(self.index) {
            match tracker.context {
                Some(ctx) if ctx.sp() >= sp => break,
                _ => self.walk_one(),
            }
        }
    }

    /// Skips trackers without a context in managed code.
    pub(crate) fn walk_to_managed(
        &mut self,
        trackers: &ExceptionTrackers,
        is_managed: impl Fn(u64) -> bool,
    ) {
        while let Some(tracker) = trackers.get(self.index) {
            match tracker.context {
                Some(ctx) if is_managed(ctx.ip) => break,
                _ => self.walk_one(),
            }
        }
    }
}
