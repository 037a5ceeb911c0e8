//! Maps code addresses to the compiled methods that contain them.
//!
//! Once the JIT has produced a batch of methods (bodies, funclets and the
//! encoded method info of every region) the batch is registered here, and
//! the stack walker resolves every program counter it meets through
//! [`CodeManager::lookup`].
//!
//! # Example
//! ```ignore
//! use stackcrawl_vm::{CodeRegistry, CompiledMethod};
//!
//! let registration = CodeRegistry::global().register(methods)?;
//! // ... the code is now visible to stack walks until `registration` drops.
//! ```
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use stackcrawl_types::{
    CodeRange, DecodeError, FuncletKind, MethodFlags, MethodHandle, MethodInfo,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;

lazy_static::lazy_static! {
    /// The process-wide code registry.
    ///
    /// Populated when the JIT publishes code and cleared region by region as
    /// the owning [`CodeRegistration`]s are dropped.
    static ref GLOBAL_CODE_REGISTRY: CodeRegistry = CodeRegistry::new();
}

/// Resolves program counters to code regions.
pub trait CodeManager: Sync {
    /// Returns the region containing `pc`, or `None` when `pc` is not managed code.
    fn lookup(&self, pc: u64) -> Option<CodeRegion>;

    /// Whether `pc` lies in managed code.
    fn is_managed_code(&self, pc: u64) -> bool {
        self.lookup(pc).is_some()
    }
}

/// A funclet emitted for one exception clause of a method.
#[derive(Clone, Debug)]
pub struct CompiledFunclet {
    /// Code bounds of the funclet.
    pub range: CodeRange,
    /// Handler or filter.
    pub kind: FuncletKind,
    /// Encoded [`MethodInfo`] of the funclet.
    pub info: Vec<u8>,
}

/// A method as published by the JIT.
#[derive(Clone, Debug)]
pub struct CompiledMethod {
    /// Owning method.
    pub method: MethodHandle,
    /// Code bounds of the main body.
    pub body: CodeRange,
    /// Classification bits.
    pub flags: MethodFlags,
    /// Encoded [`MethodInfo`] of the main body.
    pub info: Vec<u8>,
    /// Funclets, each in its own code range.
    pub funclets: Vec<CompiledFunclet>,
}

impl CompiledMethod {
    /// A method with a main body only.
    pub fn new(method: MethodHandle, body: CodeRange, info: Vec<u8>) -> Self {
        Self {
            method,
            body,
            flags: MethodFlags::empty(),
            info,
            funclets: Vec::new(),
        }
    }
}

/// Why a batch of code could not be registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The batch contained no code.
    #[error("no code to register")]
    Empty,
    /// A region of the batch covers no bytes.
    #[error("code region at {start:#x} is empty")]
    EmptyRegion {
        /// Start of the region.
        start: u64,
    },
    /// The batch overlaps itself or previously registered code.
    #[error("code range [{start:#x}, {end:#x}) overlaps registered code")]
    Overlap {
        /// Start of the offending range.
        start: u64,
        /// End of the offending range.
        end: u64,
    },
}

struct RegionData {
    method: MethodHandle,
    method_start: u64,
    range: CodeRange,
    funclet: FuncletKind,
    flags: MethodFlags,
    blob: Box<[u8]>,
    decoded: OnceCell<Result<MethodInfo, DecodeError>>,
}

/// One resolved code region: a method body or one of its funclets.
///
/// Cloning is cheap; the decoded method info is cached and shared by all
/// clones.
#[derive(Clone)]
pub struct CodeRegion {
    data: Arc<RegionData>,
}

impl CodeRegion {
    /// The owning method.
    pub fn method(&self) -> MethodHandle {
        self.data.method
    }

    /// Start of the method's main body, which identifies the method's code.
    pub fn method_start(&self) -> u64 {
        self.data.method_start
    }

    /// Bounds of this region.
    pub fn range(&self) -> CodeRange {
        self.data.range
    }

    /// The region's funclet kind.
    pub fn funclet_kind(&self) -> FuncletKind {
        self.data.funclet
    }

    /// Whether this region is a funclet.
    pub fn is_funclet(&self) -> bool {
        self.data.funclet.is_funclet()
    }

    /// Whether this region is a filter funclet.
    pub fn is_filter_funclet(&self) -> bool {
        self.data.funclet == FuncletKind::Filter
    }

    /// Classification bits of the owning method.
    pub fn flags(&self) -> MethodFlags {
        self.data.flags
    }

    /// Offset of `pc` from the start of this region.
    pub fn code_offset(&self, pc: u64) -> u32 {
        u32::try_from(pc.saturating_sub(self.data.range.start)).unwrap_or(u32::MAX)
    }

    /// The decoded method info, decoding it on first use.
    pub fn method_info(&self) -> Result<&MethodInfo, DecodeError> {
        self.data
            .decoded
            .get_or_init(|| MethodInfo::decode(&self.data.blob))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Whether both handles refer to the same region.
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRegion")
            .field("method", &self.data.method)
            .field("start", &format_args!("{:#x}", self.data.range.start))
            .field("end", &format_args!("{:#x}", self.data.range.end))
            .field("funclet", &self.data.funclet)
            .finish()
    }
}

struct ModuleCode {
    start: u64,
    regions: BTreeMap<u64, CodeRegion>,
}

impl ModuleCode {
    fn region(&self, pc: u64) -> Option<&CodeRegion> {
        let (end, region) = self.regions.range(pc..).next()?;
        if region.data.range.start <= pc && pc <= *end {
            Some(region)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Keyed by the last byte of each module's code.
    ranges: BTreeMap<u64, ModuleCode>,
}

impl RegistryInner {
    fn module(&self, pc: u64) -> Option<&ModuleCode> {
        let (end, module) = self.ranges.range(pc..).next()?;
        if module.start <= pc && pc <= *end {
            Some(module)
        } else {
            None
        }
    }
}

/// A registry of compiled code.
#[derive(Clone, Default)]
pub struct CodeRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

/// An RAII structure that unregisters a batch of code when dropped.
pub struct CodeRegistration {
    key: u64,
    registry: Weak<RwLock<RegistryInner>>,
}

impl Drop for CodeRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.write().ranges.remove(&self.key);
        }
    }
}

impl fmt::Debug for CodeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRegistration")
            .field("key", &format_args!("{:#x}", self.key))
            .finish()
    }
}

impl CodeRegistry {
    /// Creates an empty, private registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        &GLOBAL_CODE_REGISTRY
    }

    /// Registers a batch of compiled methods.
    ///
    /// Every method body and funclet must be non-empty and the batch must
    /// not overlap itself or any code already registered.
    pub fn register(
        &self,
        methods: Vec<CompiledMethod>,
    ) -> Result<CodeRegistration, RegistrationError> {
        let mut min = u64::MAX;
        let mut max = 0;
        let mut regions: BTreeMap<u64, CodeRegion> = BTreeMap::new();

        let mut add = |method: &CompiledMethod,
                       range: CodeRange,
                       funclet: FuncletKind,
                       blob: &[u8]|
         -> Result<(), RegistrationError> {
            if range.is_empty() {
                return Err(RegistrationError::EmptyRegion { start: range.start });
            }
            // end is the last byte of the region
            let end = range.end - 1;
            let overlaps_next = regions
                .range(range.start..)
                .next()
                .is_some_and(|(_, next)| next.data.range.start <= end);
            if overlaps_next {
                return Err(RegistrationError::Overlap {
                    start: range.start,
                    end: range.end,
                });
            }
            min = min.min(range.start);
            max = max.max(end);
            let region = CodeRegion {
                data: Arc::new(RegionData {
                    method: method.method,
                    method_start: method.body.start,
                    range,
                    funclet,
                    flags: method.flags,
                    blob: blob.into(),
                    decoded: OnceCell::new(),
                }),
            };
            regions.insert(end, region);
            Ok(())
        };

        for method in &methods {
            add(method, method.body, FuncletKind::None, &method.info)?;
            for funclet in &method.funclets {
                add(method, funclet.range, funclet.kind, &funclet.info)?;
            }
        }
        if regions.is_empty() {
            return Err(RegistrationError::Empty);
        }

        let mut inner = self.inner.write();
        // the first module ending at or after `min` is the only candidate for a collision
        let collides = inner
            .ranges
            .range(min..)
            .next()
            .is_some_and(|(_, next)| next.start <= max);
        if collides {
            return Err(RegistrationError::Overlap {
                start: min,
                end: max + 1,
            });
        }
        inner.ranges.insert(
            max,
            ModuleCode {
                start: min,
                regions,
            },
        );
        tracing::debug!(start = min, end = max + 1, "registered managed code");
        Ok(CodeRegistration {
            key: max,
            registry: Arc::downgrade(&self.inner),
        })
    }
}

impl CodeManager for CodeRegistry {
    fn lookup(&self, pc: u64) -> Option<CodeRegion> {
        let inner = self.inner.read();
        inner.module(pc)?.region(pc).cloned()
    }
}
