//! Patchpoint hits through the installed OSR runtime.
//!
//! The runtime is process-wide, so every test shares the one installed by
//! [`runtime`] and keeps its patchpoints apart by using its own method and
//! loader allocator.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use stackcrawl_types::{GPR, MethodFlags, PatchpointDescriptor, PatchpointTable, UnwindInfo};
use stackcrawl_vm::osr::{
    ContextRestorer, LoaderAllocator, OSR_ENTRY_SP_ADJUSTMENT, OsrCompiler, OsrConfig, OsrRuntime,
    PatchpointCall, PatchpointEnv, jit_patchpoint, prepare_transition,
};
use stackcrawl_vm::{
    CodeRange, CodeRegion, CodeRegistration, CodeRegistry, CompiledMethod, FramePointerUnwinder,
    MethodHandle, MethodInfo, OsrError, RegisterContext, SyntheticStack,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

const LIMIT: u64 = 0x50_0000;
const METHOD_START: u64 = 0x5000;
const IL_OFFSET: u32 = 0x20;
const NATIVE_OFFSET: u32 = 0x30;
/// Return address of the helper call at the patchpoint.
const PATCHPOINT_IP: u64 = METHOD_START + NATIVE_OFFSET as u64;
/// Where the OSR variant of a method starting at `METHOD_START` is compiled to.
const OSR_CODE_DELTA: u64 = 0x2000;
const OSR_ENTRY: u64 = METHOD_START + OSR_CODE_DELTA + NATIVE_OFFSET as u64;

/// The helper's frame sits right below the original frame.
const HELPER_SP: u64 = LIMIT + 0x20;
const HELPER_FP: u64 = LIMIT + 0x30;
const ORIGINAL_SP: u64 = LIMIT + 0x40;
const ORIGINAL_FP: u64 = LIMIT + 0x60;
const CALLER_FP: u64 = LIMIT + 0x100;
const CALLER_IP: u64 = 0x6000;
/// RBX of the original method's caller, spilled by the original prologue.
const CALLER_RBX: u64 = 0x0b0b;

const HIT_LIMIT: i32 = 2;
const COUNTER_BUMP: i32 = 100;

/// Compiles nothing, but records what it was asked for.
#[derive(Default)]
struct RecordingCompiler {
    compiled: Mutex<Vec<MethodHandle>>,
}

impl RecordingCompiler {
    fn compilations(&self, method: MethodHandle) -> usize {
        self.compiled.lock().iter().filter(|&&m| m == method).count()
    }
}

impl OsrCompiler for &'static RecordingCompiler {
    fn compile_osr_method(
        &self,
        method: MethodHandle,
        region: &CodeRegion,
        patchpoint: &PatchpointDescriptor,
    ) -> Result<u64, OsrError> {
        self.compiled.lock().push(method);
        // keep other threads waiting for a while
        std::thread::sleep(Duration::from_millis(5));
        Ok(region.method_start() + OSR_CODE_DELTA + u64::from(patchpoint.native_offset))
    }
}

/// Hands the entry context back to the test by unwinding with it.
struct PanickingRestorer;

impl ContextRestorer for PanickingRestorer {
    fn restore(&self, context: &RegisterContext) -> ! {
        std::panic::panic_any(*context)
    }
}

static COMPILER: Lazy<RecordingCompiler> = Lazy::new(RecordingCompiler::default);

static RUNTIME: Lazy<&'static OsrRuntime> = Lazy::new(|| {
    let config = OsrConfig {
        hit_limit: HIT_LIMIT,
        counter_bump: COUNTER_BUMP,
        ..OsrConfig::default()
    };
    OsrRuntime::new(config, Box::new(&*COMPILER), Box::new(PanickingRestorer))
        .install()
        .expect("no other runtime is installed by this test binary")
});

fn runtime() -> &'static OsrRuntime {
    *RUNTIME
}

fn register(registry: &CodeRegistry, method: MethodHandle) -> CodeRegistration {
    let mut info = MethodInfo::new(UnwindInfo::with_frame_pointer(0x18).save(GPR::RBX, -0x18));
    info.patchpoints = PatchpointTable::new(vec![PatchpointDescriptor {
        il_offset: IL_OFFSET,
        native_offset: NATIVE_OFFSET,
    }]);
    let mut compiled = CompiledMethod::new(method, CodeRange::new(METHOD_START, 0x100), info.encode().unwrap());
    compiled.flags = MethodFlags::HAS_PATCHPOINTS;
    registry.register(vec![compiled]).unwrap()
}

/// A thread inside the patchpoint helper called by the original method.
fn patchpoint_stack() -> SyntheticStack {
    let stack = SyntheticStack::new(LIMIT, 64);
    assert!(stack.write_word(HELPER_FP, ORIGINAL_FP));
    assert!(stack.write_word(HELPER_FP + 8, PATCHPOINT_IP));
    assert!(stack.write_word(ORIGINAL_FP - 8, CALLER_RBX));
    assert!(stack.write_word(ORIGINAL_FP, CALLER_FP));
    assert!(stack.write_word(ORIGINAL_FP + 8, CALLER_IP));
    stack
}

fn helper_context() -> RegisterContext {
    let mut context = RegisterContext::new(0x9000, HELPER_SP, HELPER_FP);
    // the helper clobbered it
    context.set(GPR::RBX, 0x5555);
    context
}

fn env<'a>(
    registry: &'a CodeRegistry,
    stack: &'a SyntheticStack,
    loader: &'a LoaderAllocator,
) -> PatchpointEnv<'a> {
    PatchpointEnv {
        code: registry,
        memory: stack,
        native: &FramePointerUnwinder,
        loader,
        context: helper_context(),
    }
}

fn assert_enters_osr_variant(context: &RegisterContext) {
    assert_eq!(context.ip, OSR_ENTRY);
    assert_eq!(context.sp() + OSR_ENTRY_SP_ADJUSTMENT, ORIGINAL_SP);
    assert_eq!(context.fp(), ORIGINAL_FP);
    assert_eq!(context.get(GPR::RBX), CALLER_RBX);
    assert!(!context.exception_active);
}

#[test_log::test]
fn transition_keeps_the_original_frame() -> anyhow::Result<()> {
    let registry = CodeRegistry::new();
    let _registration = register(&registry, MethodHandle::new(0x51));
    let stack = patchpoint_stack();

    let plan = prepare_transition(
        &registry,
        &FramePointerUnwinder,
        &stack,
        helper_context(),
        PATCHPOINT_IP,
        OSR_ENTRY,
    )?;
    assert_eq!(plan.original_sp, ORIGINAL_SP);
    assert_eq!(plan.original_fp, ORIGINAL_FP);
    assert_enters_osr_variant(&plan.context);
    Ok(())
}

#[test_log::test]
fn hot_patchpoint_moves_the_frame_to_the_osr_variant() {
    let method = MethodHandle::new(0x52);
    let registry = CodeRegistry::new();
    let _registration = register(&registry, method);
    let stack = patchpoint_stack();
    let loader = LoaderAllocator::new();
    let env = env(&registry, &stack, &loader);
    let runtime = runtime();

    let mut counter = 0;
    jit_patchpoint(
        &env,
        PatchpointCall {
            return_address: PATCHPOINT_IP,
            counter: Some(&mut counter),
            il_offset: IL_OFFSET,
        },
    );
    assert_eq!(counter, COUNTER_BUMP);
    assert_eq!(COMPILER.compilations(method), 0);

    counter = 0;
    let entered = catch_unwind(AssertUnwindSafe(|| {
        runtime.on_patchpoint(
            &env,
            PatchpointCall {
                return_address: PATCHPOINT_IP,
                counter: Some(&mut counter),
                il_offset: IL_OFFSET,
            },
        )
    }))
    .expect_err("the second hit transitions");
    let context = entered
        .downcast::<RegisterContext>()
        .expect("the restorer unwinds with the entry context");
    assert_enters_osr_variant(&context);
    assert_eq!(counter, COUNTER_BUMP);
    assert_eq!(COMPILER.compilations(method), 1);

    let record = loader.osr_manager().patchpoint(METHOD_START, IL_OFFSET);
    assert_eq!(record.osr_code(), Some(OSR_ENTRY));
    assert_eq!(record.hit_count(), HIT_LIMIT);
}

#[test_log::test]
fn patchpoint_without_a_descriptor_is_invalidated() -> anyhow::Result<()> {
    let method = MethodHandle::new(0x53);
    let registry = CodeRegistry::new();
    let _registration = register(&registry, method);
    let stack = patchpoint_stack();
    let loader = LoaderAllocator::new();
    let env = env(&registry, &stack, &loader);

    for _ in 0..4 {
        let mut counter = 0;
        let plan = runtime().resolve_patchpoint(
            &env,
            PatchpointCall {
                return_address: PATCHPOINT_IP,
                counter: Some(&mut counter),
                il_offset: 0x99,
            },
        )?;
        assert_eq!(plan, None);
    }
    let record = loader.osr_manager().patchpoint(METHOD_START, 0x99);
    assert!(record.is_invalid());
    assert_eq!(record.hit_count(), HIT_LIMIT);
    assert_eq!(COMPILER.compilations(method), 0);
    Ok(())
}

#[test_log::test]
fn helper_called_from_native_code_is_refused() {
    let registry = CodeRegistry::new();
    let _registration = register(&registry, MethodHandle::new(0x54));
    let stack = patchpoint_stack();
    let loader = LoaderAllocator::new();
    let env = env(&registry, &stack, &loader);

    let mut counter = 0;
    let result = runtime().resolve_patchpoint(
        &env,
        PatchpointCall {
            return_address: CALLER_IP,
            counter: Some(&mut counter),
            il_offset: IL_OFFSET,
        },
    );
    assert_eq!(result, Err(OsrError::NotManagedCode { pc: CALLER_IP }));
    assert!(loader.osr_manager().is_empty());
}

#[test_log::test]
fn method_without_patchpoints_is_refused() {
    let method = MethodHandle::new(0x57);
    let registry = CodeRegistry::new();
    let info = MethodInfo::new(UnwindInfo::with_frame_pointer(0x18).save(GPR::RBX, -0x18));
    let _registration = registry
        .register(vec![CompiledMethod::new(
            method,
            CodeRange::new(METHOD_START, 0x100),
            info.encode().unwrap(),
        )])
        .unwrap();
    let stack = patchpoint_stack();
    let loader = LoaderAllocator::new();
    let env = env(&registry, &stack, &loader);

    let mut counter = 0;
    let result = runtime().resolve_patchpoint(
        &env,
        PatchpointCall {
            return_address: PATCHPOINT_IP,
            counter: Some(&mut counter),
            il_offset: IL_OFFSET,
        },
    );
    assert_eq!(result, Err(OsrError::NotInstrumented { method }));
    assert!(loader.osr_manager().is_empty());
    assert_eq!(COMPILER.compilations(method), 0);
}

#[test_log::test]
fn required_patchpoint_compiles_once_under_contention() -> anyhow::Result<()> {
    let method = MethodHandle::new(0x55);
    let registry = CodeRegistry::new();
    let _registration = register(&registry, method);
    let stack = patchpoint_stack();
    let loader = LoaderAllocator::new();
    let env = env(&registry, &stack, &loader);
    let runtime = runtime();

    let plans = std::thread::scope(|scope| {
        let threads: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    runtime.resolve_patchpoint(
                        &env,
                        PatchpointCall {
                            return_address: PATCHPOINT_IP,
                            counter: None,
                            il_offset: IL_OFFSET,
                        },
                    )
                })
            })
            .collect();
        threads
            .into_iter()
            .map(|thread| thread.join().expect("patchpoint thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    assert_eq!(plans.len(), 4);
    for plan in &plans {
        let plan = plan.as_ref().expect("required patchpoints always transition");
        assert_enters_osr_variant(&plan.context);
    }
    assert_eq!(COMPILER.compilations(method), 1);
    // required hits are not counted
    assert_eq!(loader.osr_manager().patchpoint(METHOD_START, IL_OFFSET).hit_count(), 0);
    Ok(())
}

#[test_log::test]
fn counted_patchpoint_compiles_once_under_contention() -> anyhow::Result<()> {
    let method = MethodHandle::new(0x56);
    let registry = CodeRegistry::new();
    let _registration = register(&registry, method);
    let stack = patchpoint_stack();
    let loader = LoaderAllocator::new();
    let env = env(&registry, &stack, &loader);
    let runtime = runtime();

    // losers keep running the original code and hit the patchpoint again
    let hot_loop = || loop {
        let mut counter = 0;
        let plan = runtime.resolve_patchpoint(
            &env,
            PatchpointCall {
                return_address: PATCHPOINT_IP,
                counter: Some(&mut counter),
                il_offset: IL_OFFSET,
            },
        )?;
        if let Some(plan) = plan {
            return Ok::<_, OsrError>(plan);
        }
        std::thread::yield_now();
    };
    let plans = std::thread::scope(|scope| {
        let threads: Vec<_> = (0..4).map(|_| scope.spawn(hot_loop)).collect();
        threads
            .into_iter()
            .map(|thread| thread.join().expect("patchpoint thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    assert_eq!(plans.len(), 4);
    for plan in &plans {
        assert_enters_osr_variant(&plan.context);
    }
    assert_eq!(COMPILER.compilations(method), 1);
    Ok(())
}

#[test_log::test]
fn only_one_runtime_can_be_installed() {
    let installed = runtime();
    assert!(std::ptr::eq(OsrRuntime::get().unwrap(), installed));
    assert_eq!(installed.config().hit_limit, HIT_LIMIT);

    let second = OsrRuntime::new(
        OsrConfig::default(),
        Box::new(&*COMPILER),
        Box::new(PanickingRestorer),
    );
    assert_eq!(second.install().unwrap_err(), OsrError::AlreadyInstalled);
}
