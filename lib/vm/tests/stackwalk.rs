mod common;

use common::*;
use pretty_assertions::assert_eq;
use stackcrawl_types::UnwindInfo;
use stackcrawl_vm::{
    CodeRange, CodeRegistration, CompiledMethod, ExceptionPass, ExceptionTracker, ExplicitFrame,
    FrameKind, FrameState, ManagedThread, MethodFlags, MethodInfo, RegisterContext,
    SkippedFrameOrdering, StackBounds, StackWalk, UnwindError, WalkError, WalkFlags, WalkOutcome,
};
use std::ops::ControlFlow;

fn collect(walk: &StackWalk<'_>, thread: &ManagedThread) -> anyhow::Result<Vec<Visit>> {
    let mut visits = Vec::new();
    let outcome = walk.walk(thread, |frame| {
        visits.push(Visit::of(frame));
        ControlFlow::Continue(())
    })?;
    assert_eq!(outcome, WalkOutcome::Completed);
    Ok(visits)
}

#[test_log::test]
fn managed_and_explicit_frames_are_merged_leaf_to_root() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = mixed_thread(&stack);

    let walk = StackWalk::new(&registry, &stack).with_context(leaf_context());
    assert_eq!(
        collect(&walk, &thread)?,
        vec![
            managed(METHOD_A, SP_A),
            managed(METHOD_B, SP_B),
            explicit(Some(HELPER), B_CALLER_SP),
            managed(METHOD_C, SP_C),
            explicit(None, C_CALLER_SP),
        ]
    );
    Ok(())
}

#[test_log::test]
fn walks_are_deterministic() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = mixed_thread(&stack);

    let walk = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::NOTIFY_ON_U2M_TRANSITIONS);
    let first = collect(&walk, &thread)?;
    assert_eq!(first.len(), 7);
    assert_eq!(
        first
            .iter()
            .filter(|visit| visit.state == FrameState::NativeMarker)
            .count(),
        2
    );
    assert_eq!(collect(&walk, &thread)?, first);
    Ok(())
}

#[test_log::test]
fn callback_can_stop_the_walk() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = mixed_thread(&stack);

    let mut visited = 0;
    let outcome = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .walk(&thread, |_| {
            visited += 1;
            if visited == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
    assert_eq!(outcome, WalkOutcome::Aborted);
    assert_eq!(visited, 3);
    Ok(())
}

#[test_log::test]
fn functions_only_drops_frames_without_a_method() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = mixed_thread(&stack);

    let walk = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::FUNCTIONS_ONLY);
    let visits = collect(&walk, &thread)?;
    assert_eq!(
        visits.iter().map(|visit| visit.method).collect::<Vec<_>>(),
        vec![Some(METHOD_A), Some(METHOD_B), Some(HELPER), Some(METHOD_C)]
    );
    Ok(())
}

/// A thread whose B frame contains an inlined native call marker.
fn thread_with_inlined_call(stack: &stackcrawl_vm::SyntheticStack) -> ManagedThread {
    let mut thread = mixed_thread(stack);
    thread.push_frame(
        ExplicitFrame::new(
            SP_B + 8,
            FrameKind::InlinedCall {
                return_address: IP_B,
                call_site_sp: SP_B,
                callee_saved_fp: 0,
            },
        )
        .with_method(METHOD_B),
    );
    thread
}

fn skipped(sp: u64) -> Visit {
    Visit {
        state: FrameState::SkippedFrame,
        method: Some(METHOD_B),
        sp,
    }
}

#[test_log::test]
fn nested_frames_come_before_their_container() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = thread_with_inlined_call(&stack);

    let walk = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .skipped_frame_ordering(SkippedFrameOrdering::BeforeContainingFrame);
    let visits = collect(&walk, &thread)?;
    assert_eq!(
        &visits[..4],
        &[
            managed(METHOD_A, SP_A),
            skipped(SP_B),
            managed(METHOD_B, SP_B),
            explicit(Some(HELPER), B_CALLER_SP),
        ]
    );
    Ok(())
}

#[test_log::test]
fn nested_frames_come_after_their_container() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = thread_with_inlined_call(&stack);

    let walk = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .skipped_frame_ordering(SkippedFrameOrdering::AfterContainingFrame);
    let visits = collect(&walk, &thread)?;
    assert_eq!(
        &visits[..4],
        &[
            managed(METHOD_A, SP_A),
            managed(METHOD_B, SP_B),
            skipped(B_CALLER_SP),
            explicit(Some(HELPER), B_CALLER_SP),
        ]
    );
    Ok(())
}

#[test_log::test]
fn suppressed_nested_frames_are_passed_silently() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = thread_with_inlined_call(&stack);

    for ordering in [
        SkippedFrameOrdering::BeforeContainingFrame,
        SkippedFrameOrdering::AfterContainingFrame,
    ] {
        let walk = StackWalk::new(&registry, &stack)
            .with_context(leaf_context())
            .skipped_frame_ordering(ordering)
            .flags(WalkFlags::SUPPRESS_SKIPPED_FRAMES);
        assert_eq!(
            collect(&walk, &thread)?,
            vec![
                managed(METHOD_A, SP_A),
                managed(METHOD_B, SP_B),
                explicit(Some(HELPER), B_CALLER_SP),
                managed(METHOD_C, SP_C),
                explicit(None, C_CALLER_SP),
            ]
        );
    }
    Ok(())
}

fn unwinding_leaf(thread: &mut ManagedThread) {
    // the second pass has unwound A, whose caller SP is SP_B
    thread.exceptions_mut().push(ExceptionTracker {
        pass: ExceptionPass::Second,
        unwound: Some(stackcrawl_vm::StackRange::new(LIMIT + 0x100, SP_B)),
        ..ExceptionTracker::new(LIMIT + 0x80)
    });
}

#[test_log::test]
fn dispatch_walks_skip_frames_the_exception_unwound() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let mut thread = mixed_thread(&stack);
    unwinding_leaf(&mut thread);

    let walk = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::exception_dispatch());
    assert_eq!(
        collect(&walk, &thread)?
            .iter()
            .map(|visit| visit.method)
            .collect::<Vec<_>>(),
        vec![Some(METHOD_B), Some(HELPER), Some(METHOD_C)]
    );
    Ok(())
}

#[test_log::test]
fn gc_walks_deliver_unwound_frames_without_references() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let mut thread = mixed_thread(&stack);
    unwinding_leaf(&mut thread);

    let mut reporting = Vec::new();
    StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::gc_root_enumeration())
        .walk(&thread, |frame| {
            reporting.push((frame.method(), frame.should_report_gc_refs()));
            ControlFlow::Continue(())
        })?;
    assert_eq!(
        reporting,
        vec![
            (Some(METHOD_A), false),
            (Some(METHOD_B), true),
            (Some(HELPER), true),
            (Some(METHOD_C), true),
            (None, true),
        ]
    );
    Ok(())
}

#[test_log::test]
fn fault_without_a_frame_resumes_at_the_fault_context() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let mut thread = mixed_thread(&stack);
    let mut fault = leaf_context();
    fault.exception_active = true;
    thread.exceptions_mut().push(ExceptionTracker {
        context: Some(fault),
        ..ExceptionTracker::new(LIMIT + 0x80)
    });

    // the walk starts in the native fault handler
    let handler = stackcrawl_vm::RegisterContext::new(NATIVE_CODE, LIMIT + 0x40, 0);
    let mut positions = Vec::new();
    StackWalk::new(&registry, &stack)
        .with_context(handler)
        .flags(
            WalkFlags::NOTIFY_ON_INITIAL_NATIVE_CONTEXT | WalkFlags::NOTIFY_ON_NO_FRAME_TRANSITIONS,
        )
        .walk(&thread, |frame| {
            positions.push((
                frame.state(),
                frame.no_frame_transition_marker(),
                frame.has_faulted(),
            ));
            ControlFlow::Continue(())
        })?;
    assert_eq!(
        &positions[..4],
        &[
            (FrameState::InitialNativeContext, None, false),
            (FrameState::NoFrameTransition, Some(SP_A), false),
            (FrameState::FramelessMethod, None, true),
            (FrameState::FramelessMethod, None, false),
        ]
    );
    Ok(())
}

#[test_log::test]
fn speculative_walk_fails_when_unwinding_leaves_the_stack() {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    // the thread's stack ends where B's frame starts
    let mut thread = ManagedThread::new(3, StackBounds::new(LIMIT, SP_B).unwrap());
    thread.push_frame(entry_frame());

    let mut visited = 0;
    let result = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::profiler_sample())
        .walk(&thread, |_| {
            visited += 1;
            ControlFlow::Continue(())
        });
    assert_eq!(visited, 1);
    assert_eq!(
        result,
        Err(WalkError::Unwind(UnwindError::StackOutOfBounds {
            sp: SP_B,
            limit: LIMIT,
            base: SP_B,
        }))
    );
}

#[test_log::test]
fn speculative_walk_refuses_a_seed_outside_the_stack() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let base = stack.bounds().base;
    // the thread's stack starts at B's frame, so A's SP lies below it
    let mut thread = ManagedThread::new(3, StackBounds::new(SP_B, base).unwrap());
    thread.push_frame(entry_frame());

    let mut visited = 0;
    let result = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::profiler_sample())
        .walk(&thread, |_| {
            visited += 1;
            ControlFlow::Continue(())
        });
    assert_eq!(visited, 0);
    assert_eq!(
        result,
        Err(WalkError::Unwind(UnwindError::StackOutOfBounds {
            sp: SP_A,
            limit: SP_B,
            base,
        }))
    );

    let thread = mixed_thread(&stack);
    let mut iter = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::profiler_sample())
        .iter(&thread)?;
    assert_eq!(Visit::of(iter.frame()), managed(METHOD_A, SP_A));
    assert_eq!(
        iter.reset_registers(RegisterContext::new(IP_B, base, 0), false),
        Err(WalkError::Unwind(UnwindError::StackOutOfBounds {
            sp: base,
            limit: LIMIT,
            base,
        }))
    );
    Ok(())
}

#[test_log::test]
fn speculative_walk_refuses_a_frame_restoring_a_lower_caller() {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let mut thread = ManagedThread::new(4, stack.bounds());
    thread.push_frame(entry_frame());
    thread.push_frame(misplaced_boundary_frame());

    let mut visits = Vec::new();
    let result = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::profiler_sample())
        .walk(&thread, |frame| {
            visits.push(Visit::of(frame));
            ControlFlow::Continue(())
        });
    assert!(matches!(result, Err(WalkError::Inconsistent(_))));
    // nothing below the frame is delivered after it
    assert_eq!(
        visits,
        vec![
            managed(METHOD_A, SP_A),
            managed(METHOD_B, SP_B),
            explicit(Some(HELPER), B_CALLER_SP),
        ]
    );
}

#[test_log::test]
fn speculative_walk_reports_a_corrupted_frame_chain() {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let mut thread = ManagedThread::new(4, stack.bounds());
    // pushed in the wrong order: the older frame is now the head
    thread.push_frame(boundary_frame());
    thread.push_frame(entry_frame());

    let result = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::SPECULATIVE)
        .walk(&thread, |_| ControlFlow::Continue(()));
    assert!(matches!(result, Err(WalkError::Inconsistent(_))));
}

#[test_log::test]
fn iterator_can_be_reseeded() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let thread = mixed_thread(&stack);

    let walk = StackWalk::new(&registry, &stack).with_context(leaf_context());
    let mut iter = walk.iter(&thread)?;
    assert_eq!(Visit::of(iter.frame()), managed(METHOD_A, SP_A));

    iter.reset_registers(stackcrawl_vm::RegisterContext::new(IP_B, SP_B, 0), false)?;
    assert_eq!(Visit::of(iter.frame()), managed(METHOD_B, SP_B));
    assert!(!iter.frame().is_active_frame());
    iter.advance()?;
    assert_eq!(Visit::of(iter.frame()), explicit(Some(HELPER), B_CALLER_SP));

    // past the boundary frame, which is dropped from the walk
    iter.reset_registers(stackcrawl_vm::RegisterContext::new(IP_C, SP_C, 0), false)?;
    assert_eq!(Visit::of(iter.frame()), managed(METHOD_C, SP_C));
    iter.advance()?;
    assert_eq!(Visit::of(iter.frame()), explicit(None, C_CALLER_SP));
    iter.advance()?;
    assert!(!iter.is_valid());
    Ok(())
}

#[test_log::test]
fn popping_walk_unlinks_every_frame_it_passes() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_methods(&registry);
    let stack = mixed_stack();
    let mut thread = ManagedThread::new(5, stack.bounds());
    thread.set_gc_mode(stackcrawl_vm::GcMode::Cooperative);
    thread.push_frame(entry_frame().with_cleanup(stackcrawl_vm::CleanupAction::ReleaseMonitor {
        object: 0x77,
    }));
    thread.push_frame(boundary_frame());

    let mut released = Vec::new();
    let mut methods = Vec::new();
    let outcome = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .flags(WalkFlags::FUNCTIONS_ONLY)
        .walk_popping(
            &mut thread,
            |action| released.push(*action),
            |frame| {
                methods.push(frame.method());
                ControlFlow::Continue(())
            },
        )?;
    assert_eq!(outcome, WalkOutcome::Completed);
    assert_eq!(
        methods,
        vec![Some(METHOD_A), Some(METHOD_B), Some(HELPER), Some(METHOD_C)]
    );
    assert_eq!(
        released,
        vec![stackcrawl_vm::CleanupAction::ReleaseMonitor { object: 0x77 }]
    );
    assert!(thread.frames().is_empty());
    Ok(())
}

const MONITOR_OBJECT: u64 = 0x5eed;
/// Slot of B's frame holding the object B locked, relative to its caller SP.
const MONITOR_SLOT: i32 = -0x10;

/// Registers A, B and C with B synchronized.
fn register_with_synchronized_b(registry: &stackcrawl_vm::CodeRegistry) -> CodeRegistration {
    let layout = || MethodInfo::new(UnwindInfo::sp_based(FRAME_SIZE as u32));
    let method = |handle, start, info: MethodInfo| {
        CompiledMethod::new(handle, CodeRange::new(start, 0x100), info.encode().unwrap())
    };
    let mut info = layout();
    info.monitor_slot = Some(MONITOR_SLOT);
    let mut synchronized = method(METHOD_B, 0x2000, info);
    synchronized.flags = MethodFlags::SYNCHRONIZED;
    registry
        .register(vec![
            method(METHOD_A, 0x1000, layout()),
            synchronized,
            method(METHOD_C, 0x3000, layout()),
        ])
        .unwrap()
}

#[test_log::test]
fn popping_walk_leaves_monitors_of_synchronized_methods() -> anyhow::Result<()> {
    let registry = stackcrawl_vm::CodeRegistry::new();
    let _registration = register_with_synchronized_b(&registry);
    let stack = mixed_stack();
    assert!(stack.write_word(
        B_CALLER_SP.wrapping_add_signed(i64::from(MONITOR_SLOT)),
        MONITOR_OBJECT
    ));

    for (ordering, expected) in [
        (
            SkippedFrameOrdering::AfterContainingFrame,
            vec![stackcrawl_vm::CleanupAction::ReleaseMonitor {
                object: MONITOR_OBJECT,
            }],
        ),
        // the compiled code leaves the monitor itself
        (SkippedFrameOrdering::BeforeContainingFrame, vec![]),
    ] {
        let mut thread = ManagedThread::new(6, stack.bounds());
        thread.set_gc_mode(stackcrawl_vm::GcMode::Cooperative);
        thread.push_frame(entry_frame());
        thread.push_frame(boundary_frame());

        let mut released = Vec::new();
        let outcome = StackWalk::new(&registry, &stack)
            .with_context(leaf_context())
            .skipped_frame_ordering(ordering)
            .flags(WalkFlags::FUNCTIONS_ONLY)
            .walk_popping(
                &mut thread,
                |action| released.push(*action),
                |_| ControlFlow::Continue(()),
            )?;
        assert_eq!(outcome, WalkOutcome::Completed);
        assert_eq!(released, expected, "{ordering:?}");
        assert!(thread.frames().is_empty());
    }

    // a read-only walk never releases anything
    let thread = mixed_thread(&stack);
    let walk = StackWalk::new(&registry, &stack)
        .with_context(leaf_context())
        .skipped_frame_ordering(SkippedFrameOrdering::AfterContainingFrame);
    assert_eq!(collect(&walk, &thread)?.len(), 5);
    Ok(())
}
