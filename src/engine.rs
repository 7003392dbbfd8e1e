//! The execution engine: owns the bases, the caches and the dispatch loop.
//!
//! Per batch: plan (cache-aware fusion), then per kernel either dispatch a
//! registered extension, execute the whole kernel as one compiled block, or
//! fall back to single-instruction JIT. `execute_block` is where the pieces
//! meet: contraction, symbolization, compile-if-absent, base allocation
//! through the victim cache, the call, and frees.

use crate::base::{Base, BaseId};
use crate::block::{
    collapse_redundant_axes, push_reductions_inwards, split_for_threading, BlockTree,
};
use crate::codegen;
use crate::component::Component;
use crate::config::ConfigStore;
use crate::dtype::DType;
use crate::error::SmeltError;
use crate::fuse::{fuse_model_from_name, partition, compute_temps, FuseModel};
use crate::fuse_cache::{BatchHash, FuseCache};
use crate::instr::{BhIr, Instruction, Kernel, Opcode};
use crate::object::{IterSpaceDesc, ObjectStore, OperandDesc};
use crate::slab::Slab;
use crate::symtab::{IterLayout, Layout, SymbolTable};
use crate::tac::lower;
use crate::view::MAX_DIM;
use crate::{DebugMask, Map};
use num_complex::{Complex32, Complex64};
use std::path::PathBuf;

/// Worker thread binding policy, exported to the compiled kernels' OpenMP
/// runtime at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadBinding {
    #[default]
    None,
    PinPerThread,
    NumaNodeFirst,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub compiler_cmd: String,
    pub compiler_flags: String,
    pub object_ext: String,
    pub object_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub dump_src: bool,
    pub fusion: bool,
    pub jit_contraction: bool,
    pub fuse_model: String,
    pub fuse_cache: bool,
    pub cache_dir: PathBuf,
    pub vcache_bytes: usize,
    pub min_threading: u64,
    pub thread_limit: u64,
    pub thread_binding: ThreadBinding,
    pub openmp: bool,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        let root = std::env::temp_dir().join("smelt");
        EngineOptions {
            compiler_cmd: "cc".to_string(),
            compiler_flags: "-O2 -fPIC -shared -std=c99".to_string(),
            object_ext: "so".to_string(),
            object_dir: root.join("objects"),
            tmp_dir: root.join("src"),
            dump_src: false,
            fusion: true,
            jit_contraction: true,
            fuse_model: "broadest".to_string(),
            fuse_cache: true,
            cache_dir: root.join("fusion"),
            vcache_bytes: 1 << 28,
            min_threading: 1000,
            thread_limit: 0,
            thread_binding: ThreadBinding::None,
            openmp: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(cfg: &ConfigStore) -> Result<EngineOptions, SmeltError> {
        let d = EngineOptions::default();
        let binding = match cfg.string("engine", "thread_binding", "none").as_str() {
            "none" => ThreadBinding::None,
            "pin_per_thread" => ThreadBinding::PinPerThread,
            "numa_node_first" => ThreadBinding::NumaNodeFirst,
            other => {
                return Err(SmeltError::Config(
                    format!("engine.thread_binding: unknown policy {other:?}").into(),
                ))
            }
        };
        Ok(EngineOptions {
            compiler_cmd: cfg.string("engine", "compiler_cmd", &d.compiler_cmd),
            compiler_flags: cfg.string("engine", "compiler_flags", &d.compiler_flags),
            object_ext: cfg.string("engine", "object_ext", &d.object_ext),
            object_dir: cfg
                .existing_path("engine", "object_dir")?
                .unwrap_or(d.object_dir),
            tmp_dir: cfg.existing_path("engine", "tmp_dir")?.unwrap_or(d.tmp_dir),
            dump_src: cfg.boolean("engine", "dump_src", d.dump_src)?,
            fusion: cfg.boolean("engine", "fusion", d.fusion)?,
            jit_contraction: cfg.boolean("engine", "jit_contraction", d.jit_contraction)?,
            fuse_model: cfg.string("engine", "fuse_model", &d.fuse_model),
            fuse_cache: cfg.boolean("engine", "fuse_cache", d.fuse_cache)?,
            cache_dir: cfg.existing_path("engine", "cache_dir")?.unwrap_or(d.cache_dir),
            vcache_bytes: cfg.int(
                "engine",
                "vcache_bytes",
                d.vcache_bytes as i64,
                0,
                i64::MAX,
            )? as usize,
            min_threading: cfg.int("engine", "min_threading", d.min_threading as i64, 0, i64::MAX)?
                as u64,
            thread_limit: cfg.int("engine", "thread_limit", 0, 0, 4096)? as u64,
            thread_binding: binding,
            openmp: cfg.boolean("engine", "openmp", d.openmp)?,
        })
    }

    /// Options with per-instance cache directories, for tests and other
    /// embedders that must not share persisted state.
    #[must_use]
    pub fn sandboxed(tag: &str) -> EngineOptions {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let root =
            std::env::temp_dir().join(format!("smelt-{}-{n}-{tag}", std::process::id()));
        EngineOptions {
            object_dir: root.join("objects"),
            tmp_dir: root.join("src"),
            cache_dir: root.join("fusion"),
            ..EngineOptions::default()
        }
    }
}

/// A registered extension implementation. Extensions receive the engine so
/// they can reach operand bases.
pub type ExtMethod = fn(&mut Engine, &Instruction) -> Result<(), SmeltError>;

/// Element types the bridge can move in and out of bases.
pub trait Element: Copy {
    const DTYPE: DType;
}

macro_rules! element {
    ($($t:ty => $d:expr),* $(,)?) => {
        $(impl Element for $t { const DTYPE: DType = $d; })*
    };
}

element! {
    u8 => DType::U8, i8 => DType::I8, i16 => DType::I16, u16 => DType::U16,
    i32 => DType::I32, u32 => DType::U32, i64 => DType::I64, u64 => DType::U64,
    f32 => DType::F32, f64 => DType::F64,
    Complex32 => DType::CF32, Complex64 => DType::CF64,
}

pub struct Engine {
    opts: EngineOptions,
    bases: Slab<BaseId, Base>,
    vcache: crate::victim::VictimCache,
    fuse_cache: FuseCache,
    store: ObjectStore,
    model: Box<dyn FuseModel>,
    extensions: Map<u32, ExtMethod>,
    ext_registry: Map<String, ExtMethod>,
    debug: DebugMask,
    component_name: String,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Result<Engine, SmeltError> {
        let debug = DebugMask::from_env();
        if opts.thread_limit > 0 {
            std::env::set_var("OMP_NUM_THREADS", opts.thread_limit.to_string());
        }
        match opts.thread_binding {
            ThreadBinding::None => {}
            ThreadBinding::PinPerThread => {
                std::env::set_var("OMP_PROC_BIND", "close");
                std::env::set_var("OMP_PLACES", "threads");
            }
            ThreadBinding::NumaNodeFirst => {
                std::env::set_var("OMP_PROC_BIND", "spread");
                std::env::set_var("OMP_PLACES", "sockets");
            }
        }
        let store = ObjectStore::new(
            opts.compiler_cmd.clone(),
            opts.compiler_flags.clone(),
            opts.object_ext.clone(),
            opts.object_dir.clone(),
            opts.tmp_dir.clone(),
            opts.dump_src,
            debug,
        )?;
        let model = fuse_model_from_name(&opts.fuse_model)?;
        let mut fuse_cache = FuseCache::new(
            Some(opts.cache_dir.clone()),
            "greedy".to_string(),
            !opts.fuse_cache,
            debug,
        );
        fuse_cache.load_from_disk()?;
        Ok(Engine {
            vcache: crate::victim::VictimCache::new(opts.vcache_bytes),
            opts,
            bases: Slab::new(),
            fuse_cache,
            store,
            model,
            extensions: Map::default(),
            ext_registry: Map::default(),
            debug,
            component_name: "engine".to_string(),
        })
    }

    pub fn from_config(cfg: &ConfigStore) -> Result<Engine, SmeltError> {
        Engine::new(EngineOptions::from_config(cfg)?)
    }

    // ---- bridge surface -------------------------------------------------

    pub fn create_base(&mut self, dtype: DType, nelem: i64) -> BaseId {
        self.bases.push(Base::new(dtype, nelem))
    }

    #[must_use]
    pub fn base_exists(&self, id: BaseId) -> bool {
        self.bases.get(id).is_some()
    }

    /// Whether the base's backing storage has been materialised.
    #[must_use]
    pub fn base_is_allocated(&self, id: BaseId) -> bool {
        self.bases.get(id).is_some_and(|b| b.data.is_some())
    }

    fn base_checked(&mut self, id: BaseId, dtype: DType) -> Result<&mut Base, SmeltError> {
        let base = self
            .bases
            .get_mut(id)
            .ok_or_else(|| SmeltError::internal(format!("no such base: {id}")))?;
        if base.dtype != dtype {
            return Err(SmeltError::TypeNotSupported(
                format!("base {id} is {}, not {}", base.dtype, dtype).into(),
            ));
        }
        Ok(base)
    }

    pub fn write_base<T: Element>(&mut self, id: BaseId, data: &[T]) -> Result<(), SmeltError> {
        let Self { bases, vcache, .. } = self;
        let base = bases
            .get_mut(id)
            .ok_or_else(|| SmeltError::internal(format!("no such base: {id}")))?;
        if base.dtype != T::DTYPE {
            return Err(SmeltError::TypeNotSupported(
                format!("base {id} is {}, not {}", base.dtype, T::DTYPE).into(),
            ));
        }
        if data.len() as i64 > base.nelem {
            return Err(SmeltError::invalid_shape("write larger than the base"));
        }
        if base.data.is_none() {
            base.data = Some(vcache.malloc(base.nbytes()));
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), std::mem::size_of_val(data))
        };
        base.data.as_mut().unwrap().as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_base<T: Element>(&mut self, id: BaseId) -> Result<Vec<T>, SmeltError> {
        let base = self.base_checked(id, T::DTYPE)?;
        let nelem = usize::try_from(base.nelem).unwrap();
        let mut result: Vec<T> = Vec::with_capacity(nelem);
        match &base.data {
            Some(data) => {
                let src = data.as_ptr().cast::<T>();
                for i in 0..nelem {
                    result.push(unsafe { std::ptr::read_unaligned(src.add(i)) });
                }
            }
            None => {
                // Unmaterialised bases read as zero, mirroring the zeroed
                // lazy allocation the compiled kernels see.
                result.resize(nelem, unsafe { std::mem::zeroed() });
            }
        }
        Ok(result)
    }

    /// Make an implementation available under `name` so a later
    /// `register_extension(name, opcode)` can bind it.
    pub fn provide_extension(&mut self, name: &str, f: ExtMethod) {
        self.ext_registry.insert(name.to_string(), f);
    }

    /// Bind extension opcode `opcode` to the implementation provided under
    /// `name`. Subsequent instructions with `Opcode::Ext(opcode)` dispatch
    /// through it, bypassing the planner and code generator.
    pub fn register_extension(&mut self, name: &str, opcode: u32) -> Result<(), SmeltError> {
        let Some(&f) = self.ext_registry.get(name) else {
            return Err(SmeltError::ExtmethodNotSupported(
                format!("no extension implementation named {name:?}").into(),
            ));
        };
        self.extensions.insert(opcode, f);
        Ok(())
    }

    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.store.compile_count
    }

    #[must_use]
    pub const fn fuse_cache_hits(&self) -> u64 {
        self.fuse_cache.hits
    }

    #[must_use]
    pub const fn vcache_stats(&self) -> (u64, u64) {
        (self.vcache.allocs, self.vcache.frees)
    }

    // ---- batch execution ------------------------------------------------

    /// Execute a batch. The first failure aborts the remaining kernels;
    /// committed allocations and writes are kept.
    pub fn execute(&mut self, bhir: &mut BhIr) -> Result<(), SmeltError> {
        let begin = std::time::Instant::now();
        let hash = BatchHash::new(&bhir.instrs, self.model.name());
        let kernels = match self.fuse_cache.lookup(hash) {
            Some(mut cached) => {
                compute_temps(&bhir.instrs, &mut cached);
                cached
            }
            None => {
                let planned = partition(&bhir.instrs, self.model.as_ref());
                self.fuse_cache.insert(hash, self.model.name(), &planned);
                planned
            }
        };
        if self.debug.perf() {
            eprintln!(
                "[{}] planning took {}us for {} instruction(s)",
                self.component_name,
                begin.elapsed().as_micros(),
                bhir.instrs.len()
            );
        }
        if self.debug.sched() {
            eprintln!(
                "[{}] {} instruction(s) -> {} kernel(s)",
                self.component_name,
                bhir.instrs.len(),
                kernels.len()
            );
        }
        for kernel in &kernels {
            self.execute_kernel(&bhir.instrs, kernel)?;
        }
        bhir.kernels = kernels;
        Ok(())
    }

    fn execute_kernel(
        &mut self,
        instrs: &[Instruction],
        kernel: &Kernel,
    ) -> Result<(), SmeltError> {
        let has_ext = kernel.instr_idx.iter().any(|&i| instrs[i].opcode.is_ext());
        if has_ext {
            for &i in &kernel.instr_idx {
                let instr = &instrs[i];
                let Opcode::Ext(code) = instr.opcode else {
                    return Err(SmeltError::internal("mixed extension kernel"));
                };
                let Some(&f) = self.extensions.get(&code) else {
                    return Err(SmeltError::ExtmethodNotSupported(
                        format!("extension opcode {code:#x} is not registered").into(),
                    ));
                };
                f(self, instr)?;
            }
            return Ok(());
        }
        if kernel.instr_idx.iter().all(|&i| instrs[i].opcode.is_system()) {
            for &i in &kernel.instr_idx {
                self.execute_system(&instrs[i]);
            }
            return Ok(());
        }
        if self.opts.fusion && kernel.narray_ops(instrs) > 1 {
            let tacs = kernel
                .instr_idx
                .iter()
                .map(|&i| lower(&instrs[i], i))
                .collect::<Result<Vec<_>, _>>()?;
            let tree = self.transform(BlockTree::compose(tacs)?)?;
            self.execute_block(&tree, &kernel.temps, self.opts.jit_contraction)
        } else {
            // SIJ fallback: one block per instruction, no contraction.
            for &i in &kernel.instr_idx {
                let tree = self.transform(BlockTree::compose(vec![lower(&instrs[i], i)?])?)?;
                self.execute_block(&tree, &[], false)?;
            }
            Ok(())
        }
    }

    fn transform(&self, tree: BlockTree) -> Result<BlockTree, SmeltError> {
        let tree = push_reductions_inwards(&tree)?;
        let tree = split_for_threading(&tree, self.opts.min_threading, 1)?;
        collapse_redundant_axes(&tree)
    }

    fn execute_system(&mut self, instr: &Instruction) {
        match instr.opcode {
            Opcode::Free | Opcode::Discard => {
                if let Some(id) = instr.system_base() {
                    let Self { bases, vcache, .. } = self;
                    if let Some(base) = bases.remove(id) {
                        if let Some(data) = base.data {
                            vcache.free(data);
                        }
                    }
                }
            }
            // The dispatcher is single-threaded; every prior kernel has
            // already completed.
            Opcode::Sync => {}
            _ => unreachable!(),
        }
    }

    fn execute_block(
        &mut self,
        tree: &BlockTree,
        temps: &[BaseId],
        contraction: bool,
    ) -> Result<(), SmeltError> {
        let mut tab = SymbolTable::from_tree(tree, &self.bases);
        if contraction {
            for &b in temps {
                // Bases the bridge already materialised are left alone.
                if self.bases.get(b).is_some_and(|base| base.data.is_none()) {
                    tab.turn_contractable(b, &self.bases);
                }
            }
        }
        let ispace = tab.iterspace(tree);
        let Some(symbol) = tab.symbolize(tree) else {
            return Err(SmeltError::InstrNotSupported(
                "kernel without array operations reached the code generator".into(),
            ));
        };
        let openmp = self.opts.openmp;
        let debug_codegen = self.debug.codegen();
        let func = self.store.lookup_or_compile(&symbol, |entry| {
            let src =
                codegen::generate(tree, &tab, &ispace, &symbol, entry, codegen::Options { openmp })?;
            if debug_codegen {
                eprintln!("{src}");
            }
            Ok(src)
        })?;

        // Materialise every external operand base through the victim cache.
        {
            let Self { bases, vcache, .. } = self;
            for op in &tab.operands {
                if !op.layout.is_materialised() {
                    continue;
                }
                let Some(id) = op.view.base else { continue };
                let base = bases
                    .get_mut(id)
                    .ok_or_else(|| SmeltError::internal(format!("operand on freed base {id}")))?;
                if base.data.is_none() {
                    let bytes = base.nbytes();
                    base.data = Some(vcache.malloc(bytes));
                }
            }
        }

        // Constants need stable, 8-byte-aligned storage for the call.
        let mut const_store: Vec<[u64; 2]> = Vec::new();
        for op in &tab.operands {
            if op.layout == Layout::ScalarConst {
                let b = op.view.constant.as_ref().unwrap().to_ne_bytes();
                const_store.push([
                    u64::from_ne_bytes(b[..8].try_into().unwrap()),
                    u64::from_ne_bytes(b[8..].try_into().unwrap()),
                ]);
            }
        }
        let mut descs: Vec<OperandDesc> = Vec::with_capacity(tab.operands.len());
        let mut next_const = 0;
        for op in &tab.operands {
            let mut d = OperandDesc::zeroed();
            match op.layout {
                Layout::ScalarConst => {
                    d.data = const_store[next_const].as_ptr() as *mut std::ffi::c_void;
                    next_const += 1;
                    d.nelem = 1;
                    d.ndim = 1;
                    d.shape[0] = 1;
                }
                Layout::ScalarTemp | Layout::Contractable | Layout::Sparse => {}
                Layout::Scalar
                | Layout::Contiguous
                | Layout::Consecutive
                | Layout::Strided => {
                    let base = &mut self.bases[op.view.base.unwrap()];
                    d.data = base.data.as_mut().unwrap().as_mut_ptr().cast();
                    d.start = op.view.start;
                    d.nelem = base.nelem;
                    d.ndim = op.view.ndim() as i64;
                    for (i, (&sh, &st)) in
                        op.view.shape.iter().zip(op.view.stride.iter()).enumerate().take(MAX_DIM)
                    {
                        d.shape[i] = sh;
                        d.stride[i] = st;
                    }
                }
            }
            descs.push(d);
        }
        let mut ptrs: Vec<*mut OperandDesc> =
            descs.iter_mut().map(|d| d as *mut OperandDesc).collect();
        let mut isd = IterSpaceDesc {
            layout: match ispace.layout {
                IterLayout::Collapsible => 0,
                IterLayout::Strided => 1,
                IterLayout::Scalar => 2,
            },
            ndim: ispace.ndim as i64,
            nelem: ispace.nelem,
            shape: {
                let mut s = [0i64; MAX_DIM];
                for (i, &d) in ispace.shape.iter().enumerate().take(MAX_DIM) {
                    s[i] = d;
                }
                s
            },
        };
        unsafe { func(ptrs.as_mut_ptr(), &mut isd) };
        Ok(())
    }
}

impl Component for Engine {
    fn init(&mut self, name: &str, _cfg: &ConfigStore) -> Result<(), SmeltError> {
        self.component_name = name.to_string();
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SmeltError> {
        self.fuse_cache.write_to_disk()?;
        self.vcache.clear();
        Ok(())
    }

    fn execute(&mut self, bhir: &mut BhIr) -> Result<(), SmeltError> {
        Engine::execute(self, bhir)
    }

    fn extmethod(&mut self, name: &str, opcode: u32) -> Result<(), SmeltError> {
        self.register_extension(name, opcode)
    }
}
