//! JIT compile, link and object store.
//!
//! The store is keyed by the canonical kernel symbol. Each new symbol is
//! written to a source file under the temp directory, handed to the
//! configured compiler, loaded with `libloading` and resolved through a
//! well-known entry-point name derived from the symbol hash. Object files
//! are named `<compilation hash>--<symbol hash>.<ext>` so binaries built
//! for a different compiler/flag identity are never reused.

use crate::error::SmeltError;
use crate::symtab::symbol_hash;
use crate::view::MAX_DIM;
use crate::{DebugMask, Map};
use std::ffi::c_void;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Command;

/// Runtime operand descriptor, mirrored by the generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OperandDesc {
    pub data: *mut c_void,
    pub start: i64,
    pub nelem: i64,
    pub ndim: i64,
    pub shape: [i64; MAX_DIM],
    pub stride: [i64; MAX_DIM],
}

impl OperandDesc {
    #[must_use]
    pub fn zeroed() -> OperandDesc {
        OperandDesc {
            data: std::ptr::null_mut(),
            start: 0,
            nelem: 0,
            ndim: 0,
            shape: [0; MAX_DIM],
            stride: [0; MAX_DIM],
        }
    }
}

/// Runtime iteration-space descriptor, mirrored by the generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IterSpaceDesc {
    pub layout: i64,
    pub ndim: i64,
    pub nelem: i64,
    pub shape: [i64; MAX_DIM],
}

pub type KernelFn = unsafe extern "C" fn(*mut *mut OperandDesc, *mut IterSpaceDesc);

pub struct ObjectStore {
    /// Compiler command, e.g. `cc`.
    cmd: String,
    /// Compiler flags appended between command and source file.
    flags: Vec<String>,
    ext: String,
    object_dir: PathBuf,
    tmp_dir: PathBuf,
    /// Keep the source files around for debugging.
    dump_src: bool,
    /// Identity of the compiler configuration; part of every object name.
    compilation_hash: u64,
    functions: Map<u64, KernelFn>,
    // Loaded libraries must outlive their resolved function pointers.
    libraries: Vec<libloading::Library>,
    pub compile_count: u64,
    debug: DebugMask,
}

impl ObjectStore {
    pub fn new(
        cmd: String,
        flags: String,
        ext: String,
        object_dir: PathBuf,
        tmp_dir: PathBuf,
        dump_src: bool,
        debug: DebugMask,
    ) -> Result<ObjectStore, SmeltError> {
        std::fs::create_dir_all(&object_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        let mut h = rustc_hash::FxHasher::default();
        cmd.hash(&mut h);
        flags.hash(&mut h);
        let compilation_hash = h.finish();
        let mut store = ObjectStore {
            cmd,
            flags: flags.split_whitespace().map(str::to_string).collect(),
            ext,
            object_dir,
            tmp_dir,
            dump_src,
            compilation_hash,
            functions: Map::default(),
            libraries: Vec::new(),
            compile_count: 0,
            debug,
        };
        store.preload()?;
        Ok(store)
    }

    fn object_path(&self, shash: u64) -> PathBuf {
        self.object_dir
            .join(format!("{:016x}--{:016x}.{}", self.compilation_hash, shash, self.ext))
    }

    /// Load previously compiled objects for this compilation identity.
    fn preload(&mut self) -> Result<(), SmeltError> {
        let prefix = format!("{:016x}--", self.compilation_hash);
        let Ok(entries) = std::fs::read_dir(&self.object_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else { continue };
            let Some(hex) = rest.strip_suffix(&format!(".{}", self.ext)) else { continue };
            let Ok(shash) = u64::from_str_radix(hex, 16) else { continue };
            if self.load_object(shash, &entry.path()).is_ok() && self.debug.jit() {
                eprintln!("object store: preloaded {name}");
            }
        }
        Ok(())
    }

    fn load_object(&mut self, shash: u64, path: &std::path::Path) -> Result<KernelFn, SmeltError> {
        let lib = unsafe { libloading::Library::new(path) }.map_err(|e| {
            SmeltError::ComponentLoad(format!("cannot open {}: {e}", path.display()).into())
        })?;
        let entry = format!("krn_{shash:016x}\0");
        let func: KernelFn = unsafe {
            *lib.get::<KernelFn>(entry.as_bytes()).map_err(|e| {
                SmeltError::ComponentLoad(
                    format!("missing entry point in {}: {e}", path.display()).into(),
                )
            })?
        };
        self.libraries.push(lib);
        self.functions.insert(shash, func);
        Ok(func)
    }

    /// Look up the compiled function for `symbol`, compiling and loading
    /// the generated source on a miss.
    pub fn lookup_or_compile(
        &mut self,
        symbol: &str,
        source: impl FnOnce(&str) -> Result<String, SmeltError>,
    ) -> Result<KernelFn, SmeltError> {
        let shash = symbol_hash(symbol);
        if let Some(&func) = self.functions.get(&shash) {
            return Ok(func);
        }
        let entry = format!("krn_{shash:016x}");
        let src = source(&entry)?;
        let src_path =
            self.tmp_dir.join(format!("{:016x}--{:016x}.c", self.compilation_hash, shash));
        std::fs::write(&src_path, &src)?;
        let obj_path = self.object_path(shash);
        let output = Command::new(&self.cmd)
            .args(&self.flags)
            .arg(&src_path)
            .arg("-o")
            .arg(&obj_path)
            .arg("-lm")
            .output()
            .map_err(|e| SmeltError::Compile(format!("cannot run {}: {e}", self.cmd).into()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Leave the offending source in the temp directory for
            // inspection regardless of the dump flag.
            return Err(SmeltError::Compile(
                format!("{} failed on {}:\n{stderr}", self.cmd, src_path.display()).into(),
            ));
        }
        if self.debug.jit() {
            eprintln!("object store: compiled {symbol} -> {}", obj_path.display());
        }
        if self.dump_src {
            let dump = self.object_path(shash).with_extension("src");
            std::fs::write(dump, &src)?;
        } else {
            _ = std::fs::remove_file(&src_path);
        }
        self.compile_count += 1;
        self.load_object(shash, &obj_path)
    }
}
