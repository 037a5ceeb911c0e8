use super::config::OsrConfig;
use super::manager::LoaderAllocator;
use super::policy::{PatchpointSite, PolicyDecision, optimizing_policy, required_policy};
use super::transition::{ContextRestorer, TransitionPlan, prepare_transition, transition};
use crate::code_registry::{CodeManager, CodeRegion};
use crate::fatal::{FatalError, fail_fast};
use crate::memory::StackMemory;
use crate::unwinder::NativeUnwinder;
use once_cell::sync::OnceCell;
use stackcrawl_types::{
    MethodFlags, MethodHandle, OsrError, PatchpointDescriptor, RegisterContext, UnwindError,
};
use std::fmt;
use tracing::{debug, info};

static OSR_RUNTIME: OnceCell<OsrRuntime> = OnceCell::new();

/// Compiles OSR variants. Implemented by the JIT.
pub trait OsrCompiler: Send + Sync {
    /// Compiles the variant of `method` that resumes at `patchpoint`,
    /// returning its entry point.
    fn compile_osr_method(
        &self,
        method: MethodHandle,
        region: &CodeRegion,
        patchpoint: &PatchpointDescriptor,
    ) -> Result<u64, OsrError>;
}

/// The machine and runtime state a patchpoint helper runs in.
pub struct PatchpointEnv<'a> {
    /// Resolves code addresses.
    pub code: &'a dyn CodeManager,
    /// The stack of the current thread.
    pub memory: &'a dyn StackMemory,
    /// Unwinds the helper's own frames.
    pub native: &'a dyn NativeUnwinder,
    /// Owner of the method's patchpoint records.
    pub loader: &'a LoaderAllocator,
    /// Registers at entry to the helper.
    pub context: RegisterContext,
}

/// The arguments of a patchpoint helper call.
#[derive(Debug)]
pub struct PatchpointCall<'c> {
    /// Return address of the call; identifies the patchpoint's code location.
    pub return_address: u64,
    /// The method's patchpoint counter, `None` for a required patchpoint.
    pub counter: Option<&'c mut i32>,
    /// IL offset the OSR variant resumes at.
    pub il_offset: u32,
}

/// The process-wide OSR engine.
pub struct OsrRuntime {
    config: OsrConfig,
    compiler: Box<dyn OsrCompiler>,
    restorer: Box<dyn ContextRestorer>,
}

impl fmt::Debug for OsrRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsrRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OsrRuntime {
    /// An engine that compiles through `compiler` and enters OSR variants
    /// through `restorer`.
    pub fn new(
        config: OsrConfig,
        compiler: Box<dyn OsrCompiler>,
        restorer: Box<dyn ContextRestorer>,
    ) -> Self {
        Self {
            config,
            compiler,
            restorer,
        }
    }

    /// Publishes the engine for [`jit_patchpoint`]. Only the first call succeeds.
    pub fn install(self) -> Result<&'static Self, OsrError> {
        let mut installed = false;
        let runtime = OSR_RUNTIME.get_or_init(|| {
            installed = true;
            self
        });
        if !installed {
            return Err(OsrError::AlreadyInstalled);
        }
        info!(config = ?runtime.config, "installed OSR runtime");
        Ok(runtime)
    }

    /// The installed engine.
    pub fn get() -> Option<&'static Self> {
        OSR_RUNTIME.get()
    }

    /// The engine's configuration.
    pub fn config(&self) -> &OsrConfig {
        &self.config
    }

    /// Decides whether the patchpoint hit described by `call` transitions,
    /// returning the entry context of the OSR variant when it does.
    ///
    /// Blocks while another thread compiles a required patchpoint, and
    /// terminates the process when a required patchpoint cannot be compiled.
    pub fn resolve_patchpoint(
        &self,
        env: &PatchpointEnv<'_>,
        call: PatchpointCall<'_>,
    ) -> Result<Option<TransitionPlan>, OsrError> {
        let region = env
            .code
            .lookup(call.return_address)
            .ok_or(OsrError::NotManagedCode {
                pc: call.return_address,
            })?;
        if !region.flags().contains(MethodFlags::HAS_PATCHPOINTS) {
            return Err(OsrError::NotInstrumented {
                method: region.method(),
            });
        }
        let site = PatchpointSite {
            method: region.method(),
            il_offset: call.il_offset,
            ip: call.return_address,
        };
        let record = env
            .loader
            .osr_manager()
            .patchpoint(region.method_start(), call.il_offset);
        let compile = || self.compile(&region, call.il_offset);

        let decision = match call.counter {
            Some(counter) => optimizing_policy(&self.config, &site, &record, counter, compile),
            None => required_policy(&self.config, &site, &record, compile),
        };
        let PolicyDecision::Transition { code, is_new } = decision else {
            return Ok(None);
        };

        let plan = prepare_transition(
            env.code,
            env.native,
            env.memory,
            env.context,
            call.return_address,
            code,
        )?;
        if is_new {
            info!(id = record.id(), ip = site.ip, entry = code, "OSR transition");
        } else {
            debug!(id = record.id(), ip = site.ip, entry = code, "OSR transition");
        }
        Ok(Some(plan))
    }

    /// Handles a patchpoint hit: returns to keep running the original code,
    /// or does not return at all because execution moved to the OSR variant.
    pub fn on_patchpoint(&self, env: &PatchpointEnv<'_>, call: PatchpointCall<'_>) {
        match self.resolve_patchpoint(env, call) {
            Ok(None) => {}
            Ok(Some(plan)) => transition(&plan, self.restorer.as_ref()),
            Err(error) => fail_fast(FatalError::OsrTransitionFailed(error)),
        }
    }

    fn compile(&self, region: &CodeRegion, il_offset: u32) -> Result<u64, OsrError> {
        let method = region.method();
        let info = region.method_info().map_err(UnwindError::from)?;
        let Some(descriptor) = info.patchpoints.find(il_offset) else {
            return Err(OsrError::CompilationFailed { method, il_offset });
        };
        self.compiler.compile_osr_method(method, region, descriptor)
    }
}

/// Entry point of the patchpoint helper the JIT calls from instrumented code.
///
/// Returns when the original code must keep running; otherwise execution
/// continues in the OSR variant and this call never returns.
pub fn jit_patchpoint(env: &PatchpointEnv<'_>, call: PatchpointCall<'_>) {
    match OsrRuntime::get() {
        Some(runtime) => runtime.on_patchpoint(env, call),
        None => fail_fast(FatalError::Unreachable(
            "patchpoint hit before the OSR runtime was installed",
        )),
    }
}
