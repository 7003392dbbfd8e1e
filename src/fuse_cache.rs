//! Fusion cache: memoized kernel partitions keyed by a structural batch
//! hash, persisted one file per entry.

use crate::instr::{Instruction, Kernel};
use crate::view::View;
use crate::{DebugMask, Map, SmeltError};
use nanoserde::{DeBin, SerBin};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

const ENTRY_VERSION: u32 = 1;

/// Structural hash of a batch. Each instruction contributes its opcode and,
/// per operand, the position of the view in a growing sequence set (first
/// occurrence appends, structurally equal views reuse their id). The hash
/// is salted with the fusion-model name so partitions computed under
/// different models never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHash(pub u64);

impl BatchHash {
    #[must_use]
    pub fn new(instrs: &[Instruction], fuse_model: &str) -> BatchHash {
        let mut seq: Map<&View, usize> = Map::default();
        let mut h = rustc_hash::FxHasher::default();
        fuse_model.hash(&mut h);
        for instr in instrs {
            instr.opcode.hash(&mut h);
            for view in &instr.operands {
                let next = seq.len();
                let id = *seq.entry(view).or_insert(next);
                id.hash(&mut h);
            }
        }
        BatchHash(h.finish())
    }
}

/// The serialized unit: one kernel partition of one batch.
#[derive(Debug, Clone, SerBin, DeBin)]
pub struct InstrIndexesList {
    version: u32,
    hash: u64,
    fuse_model: String,
    fuser_name: String,
    instr_indexes_list: Vec<Vec<u64>>,
}

impl InstrIndexesList {
    fn filename(&self) -> String {
        format!("{}--{:x}--{}", self.fuse_model, self.hash, self.fuser_name)
    }
}

#[derive(Debug)]
pub struct FuseCache {
    cache: Map<u64, InstrIndexesList>,
    dir_path: Option<PathBuf>,
    fuser_name: String,
    deactivated: bool,
    pub hits: u64,
    pub misses: u64,
    debug: DebugMask,
}

impl FuseCache {
    #[must_use]
    pub fn new(
        dir_path: Option<PathBuf>,
        fuser_name: String,
        deactivated: bool,
        debug: DebugMask,
    ) -> FuseCache {
        FuseCache {
            cache: Map::default(),
            dir_path,
            fuser_name,
            deactivated,
            hits: 0,
            misses: 0,
            debug,
        }
    }

    /// Rebuild the cached kernel partition for a batch. Temp lists are not
    /// cached; the planner recomputes them against the live batch.
    pub fn lookup(&mut self, hash: BatchHash) -> Option<Vec<Kernel>> {
        if self.deactivated {
            return None;
        }
        match self.cache.get(&hash.0) {
            Some(entry) => {
                self.hits += 1;
                if self.debug.sched() {
                    eprintln!("fuse cache: hit {:x}", hash.0);
                }
                Some(
                    entry
                        .instr_indexes_list
                        .iter()
                        .map(|idxs| Kernel::new(idxs.iter().map(|&i| i as usize).collect()))
                        .collect(),
                )
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, hash: BatchHash, fuse_model: &str, kernels: &[Kernel]) {
        if self.deactivated {
            return;
        }
        let entry = InstrIndexesList {
            version: ENTRY_VERSION,
            hash: hash.0,
            fuse_model: fuse_model.to_string(),
            fuser_name: self.fuser_name.clone(),
            instr_indexes_list: kernels
                .iter()
                .map(|k| k.instr_idx.iter().map(|&i| i as u64).collect())
                .collect(),
        };
        self.cache.insert(hash.0, entry);
    }

    /// One file per entry, written atomically (temp file then rename).
    pub fn write_to_disk(&self) -> Result<(), SmeltError> {
        if self.deactivated {
            return Ok(());
        }
        let Some(dir) = &self.dir_path else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        for entry in self.cache.values() {
            let path = dir.join(entry.filename());
            let tmp = dir.join(format!(".{}.tmp", entry.filename()));
            std::fs::write(&tmp, SerBin::serialize_bin(entry))?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(())
    }

    pub fn load_from_disk(&mut self) -> Result<(), SmeltError> {
        if self.deactivated {
            return Ok(());
        }
        let Some(dir) = &self.dir_path else {
            return Ok(());
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Ok(());
        };
        for file in entries.flatten() {
            let Ok(bytes) = std::fs::read(file.path()) else { continue };
            let Ok(entry) = InstrIndexesList::deserialize_bin(&bytes) else { continue };
            if entry.version != ENTRY_VERSION || entry.fuser_name != self.fuser_name {
                continue;
            }
            self.cache.insert(entry.hash, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseId;
    use crate::dtype::{Constant, DType};
    use crate::instr::Opcode;

    fn batch() -> Vec<Instruction> {
        let a = View::contiguous(BaseId(0), DType::F32, &[4, 4]);
        let b = View::contiguous(BaseId(1), DType::F32, &[4, 4]);
        let t = View::contiguous(BaseId(2), DType::F32, &[4, 4]);
        let c = View::contiguous(BaseId(3), DType::F32, &[4, 4]);
        vec![
            Instruction::new(Opcode::Add, vec![t.clone(), a, b]),
            Instruction::new(Opcode::Multiply, vec![c, t, View::scalar(Constant::F32(2.0))]),
        ]
    }

    #[test]
    fn equal_batches_hash_equally() {
        assert_eq!(BatchHash::new(&batch(), "broadest"), BatchHash::new(&batch(), "broadest"));
        // Model salt keeps partitions from different models apart.
        assert_ne!(BatchHash::new(&batch(), "broadest"), BatchHash::new(&batch(), "singleton"));
        // A different view sequence changes the hash.
        let mut other = batch();
        other[1].operands[1] = View::contiguous(BaseId(0), DType::F32, &[4, 4]);
        assert_ne!(BatchHash::new(&batch(), "broadest"), BatchHash::new(&other, "broadest"));
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = std::env::temp_dir().join(format!("smelt-fc-{}", std::process::id()));
        _ = std::fs::remove_dir_all(&dir);
        let hash = BatchHash::new(&batch(), "broadest");
        let kernels = vec![Kernel::new(vec![0, 1])];
        let mut cache =
            FuseCache::new(Some(dir.clone()), "greedy".into(), false, DebugMask(0));
        cache.insert(hash, "broadest", &kernels);
        cache.write_to_disk().unwrap();

        let mut fresh = FuseCache::new(Some(dir.clone()), "greedy".into(), false, DebugMask(0));
        fresh.load_from_disk().unwrap();
        let got = fresh.lookup(hash).unwrap();
        assert_eq!(got[0].instr_idx, [0, 1]);
        // A cache built by a different fuser ignores the entries.
        let mut other = FuseCache::new(Some(dir.clone()), "other".into(), false, DebugMask(0));
        other.load_from_disk().unwrap();
        assert!(other.lookup(hash).is_none());
        _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn deactivated_cache_never_hits() {
        let hash = BatchHash::new(&batch(), "broadest");
        let mut cache = FuseCache::new(None, "greedy".into(), true, DebugMask(0));
        cache.insert(hash, "broadest", &[Kernel::new(vec![0, 1])]);
        assert!(cache.lookup(hash).is_none());
    }
}
