//! Core of a deferred-execution array computing runtime.
//!
//! A bridge submits a [`BhIr`] batch: an ordered list of instructions over
//! strided views backed by engine-owned bases. The [`Engine`] partitions the
//! batch into kernels under a pluggable fusion model (memoized by a
//! persistent fusion cache), builds a loop-nest block tree per kernel, runs
//! the transformation passes, emits C99 from templates, JIT-compiles and
//! caches the object, and finally dispatches the compiled function over the
//! live operand buffers.

use std::hash::BuildHasherDefault;

mod base;
mod block;
mod codegen;
mod component;
mod config;
mod dtype;
mod engine;
mod error;
mod fuse;
mod fuse_cache;
mod instr;
mod object;
mod slab;
mod symtab;
mod tac;
mod victim;
mod view;

pub use base::{Base, BaseId};
pub use component::{build_component, Chain, Component};
pub use config::ConfigStore;
pub use dtype::{Constant, DType};
pub use engine::{Engine, EngineOptions, ExtMethod, ThreadBinding};
pub use error::SmeltError;
pub use fuse::{fuse_model_from_name, FuseModel};
pub use instr::{instr_dependency, BhIr, Instruction, Kernel, Opcode};
pub use view::{view_aligned, view_disjoint, view_same, View, MAX_DIM};

pub(crate) type Map<K, V> =
    std::collections::HashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
pub(crate) type Set<T> = std::collections::HashSet<T, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Diagnostic channels, selected through the `SMELT_DEBUG` environment
/// variable bit mask. All diagnostic output goes to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugMask(pub u32);

impl DebugMask {
    #[must_use]
    pub fn from_env() -> DebugMask {
        std::env::var("SMELT_DEBUG")
            .ok()
            .and_then(|x| x.parse().ok())
            .map_or(DebugMask(0), DebugMask)
    }

    /// Planner and fusion decisions
    #[must_use]
    pub const fn sched(self) -> bool {
        self.0 & 1 != 0
    }

    /// Generated kernel source
    #[must_use]
    pub const fn codegen(self) -> bool {
        self.0 & 2 != 0
    }

    /// Compiler invocations and object cache traffic
    #[must_use]
    pub const fn jit(self) -> bool {
        self.0 & 4 != 0
    }

    /// Timings and counters
    #[must_use]
    pub const fn perf(self) -> bool {
        self.0 & 8 != 0
    }
}
