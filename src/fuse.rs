//! Fusion models and the kernel planner.

use crate::base::BaseId;
use crate::instr::{instr_dependency, Instruction, Kernel};
use crate::view::View;
use crate::{Map, SmeltError};

/// A fusion model decides whether a candidate instruction may share a
/// kernel with the instructions gathered so far. Legality (dependencies,
/// ordering) is the planner's job; models only narrow the choice.
pub trait FuseModel {
    fn name(&self) -> &'static str;
    fn may_fuse(&self, kernel: &[&Instruction], candidate: &Instruction) -> bool;
}

/// The iteration shape of an instruction: input shape for sweeps (they
/// iterate the unreduced space), output shape otherwise.
fn iter_shape(instr: &Instruction) -> &[i64] {
    if instr.opcode.is_sweep() {
        &instr.operands[1].shape
    } else {
        &instr.operands[0].shape
    }
}

/// Baseline data-parallel legality: no index or control operations, and
/// both instructions walk the same iteration space.
fn fusible(a: &Instruction, b: &Instruction) -> bool {
    let irregular = |i: &Instruction| {
        matches!(i.opcode, crate::Opcode::Gather | crate::Opcode::Scatter)
            || i.opcode.is_system()
            || i.opcode.is_ext()
    };
    if irregular(a) || irregular(b) {
        return false;
    }
    iter_shape(a) == iter_shape(b)
}

/// Fuse whenever the data-parallel legality holds.
struct Broadest;

impl FuseModel for Broadest {
    fn name(&self) -> &'static str {
        "broadest"
    }

    fn may_fuse(&self, kernel: &[&Instruction], candidate: &Instruction) -> bool {
        kernel.iter().all(|k| fusible(k, candidate))
    }
}

/// Fuse only instructions whose every non-constant operand carries the
/// same shape.
struct SameShape;

impl FuseModel for SameShape {
    fn name(&self) -> &'static str {
        "same_shape"
    }

    fn may_fuse(&self, kernel: &[&Instruction], candidate: &Instruction) -> bool {
        let shape = iter_shape(candidate).to_vec();
        let uniform = |i: &Instruction| {
            i.operands.iter().all(|v: &View| v.is_constant() || v.shape == shape)
        };
        kernel.iter().all(|k| fusible(k, candidate) && uniform(k)) && uniform(candidate)
    }
}

/// One instruction per kernel.
struct Singleton;

impl FuseModel for Singleton {
    fn name(&self) -> &'static str {
        "singleton"
    }

    fn may_fuse(&self, _kernel: &[&Instruction], _candidate: &Instruction) -> bool {
        false
    }
}

pub fn fuse_model_from_name(name: &str) -> Result<Box<dyn FuseModel>, SmeltError> {
    match name {
        "broadest" => Ok(Box::new(Broadest)),
        "same_shape" => Ok(Box::new(SameShape)),
        "singleton" => Ok(Box::new(Singleton)),
        other => Err(SmeltError::Config(format!("unknown fuse model: {other:?}").into())),
    }
}

/// Partition a batch into ordered kernels under `model`.
///
/// Instructions are walked in submission order. Control and extension
/// opcodes terminate the current kernel and are packed into kernels of
/// their own. An array instruction may be placed into an earlier open
/// kernel when no dependency (per `instr_dependency`) ties it to anything
/// in between; the backward scan stops at the first conflict, so dependent
/// instructions are never reordered.
#[must_use]
pub fn partition(instrs: &[Instruction], model: &dyn FuseModel) -> Vec<Kernel> {
    let mut kernels: Vec<Vec<usize>> = Vec::new();
    // Control/extension kernels never accept fusion.
    let mut closed: Vec<bool> = Vec::new();
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode.is_system() || instr.opcode.is_ext() {
            kernels.push(vec![i]);
            closed.push(true);
            continue;
        }
        let mut placed = false;
        for k in (0..kernels.len()).rev() {
            let dep = kernels[k].iter().any(|&j| instr_dependency(instr, &instrs[j]));
            if !closed[k] {
                let members: Vec<&Instruction> = kernels[k].iter().map(|&j| &instrs[j]).collect();
                if model.may_fuse(&members, instr) {
                    kernels[k].push(i);
                    placed = true;
                    break;
                }
            }
            if dep {
                break;
            }
        }
        if !placed {
            kernels.push(vec![i]);
            closed.push(false);
        }
    }
    let mut out: Vec<Kernel> = kernels.into_iter().map(Kernel::new).collect();
    compute_temps(instrs, &mut out);
    out
}

/// A base is a temp of a kernel iff that kernel is the only compute kernel
/// touching it, its first access in the batch is a write, and a later
/// `Free`/`Discard` ends its lifetime within the batch.
pub fn compute_temps(instrs: &[Instruction], kernels: &mut [Kernel]) {
    #[derive(Default)]
    struct Usage {
        kernels: Vec<usize>,
        first_is_write: Option<bool>,
        freed: bool,
    }
    let mut usage: Map<BaseId, Usage> = Map::default();
    for (k, kernel) in kernels.iter().enumerate() {
        for &i in &kernel.instr_idx {
            let instr = &instrs[i];
            if instr.opcode.is_system() {
                if let Some(base) = instr.system_base() {
                    usage.entry(base).or_default().freed = true;
                }
                continue;
            }
            // Inputs are read before the output is written.
            for slot in (1..instr.operands.len()).chain([0]) {
                let Some(base) = instr.operands[slot].base else { continue };
                let entry = usage.entry(base).or_default();
                if !entry.kernels.contains(&k) {
                    entry.kernels.push(k);
                }
                if entry.first_is_write.is_none() {
                    entry.first_is_write = Some(slot == 0);
                }
            }
        }
    }
    for (base, info) in usage {
        if info.freed && info.first_is_write == Some(true) && info.kernels.len() == 1 {
            kernels[info.kernels[0]].temps.push(base);
        }
    }
    for kernel in kernels.iter_mut() {
        kernel.temps.sort_unstable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Constant, DType};
    use crate::instr::Opcode;

    fn elementwise_batch() -> Vec<Instruction> {
        let a = View::contiguous(BaseId(0), DType::F32, &[4, 4]);
        let b = View::contiguous(BaseId(1), DType::F32, &[4, 4]);
        let t = View::contiguous(BaseId(2), DType::F32, &[4, 4]);
        let c = View::contiguous(BaseId(3), DType::F32, &[4, 4]);
        vec![
            Instruction::new(Opcode::Add, vec![t.clone(), a, b]),
            Instruction::new(
                Opcode::Multiply,
                vec![c, t.clone(), View::scalar(Constant::F32(2.0))],
            ),
            Instruction::new(Opcode::Free, vec![t]),
        ]
    }

    #[test]
    fn dependent_elementwise_ops_fuse() {
        let instrs = elementwise_batch();
        let model = fuse_model_from_name("broadest").unwrap();
        let kernels = partition(&instrs, model.as_ref());
        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[0].instr_idx, [0, 1]);
        assert_eq!(kernels[1].instr_idx, [2]);
    }

    #[test]
    fn temp_detection() {
        let instrs = elementwise_batch();
        let model = fuse_model_from_name("broadest").unwrap();
        let kernels = partition(&instrs, model.as_ref());
        assert_eq!(kernels[0].temps, [BaseId(2)]);
        // Without the free, nothing is a temp.
        let model = fuse_model_from_name("broadest").unwrap();
        let kernels = partition(&instrs[..2], model.as_ref());
        assert!(kernels[0].temps.is_empty());
    }

    #[test]
    fn singleton_never_fuses() {
        let instrs = elementwise_batch();
        let model = fuse_model_from_name("singleton").unwrap();
        let kernels = partition(&instrs, model.as_ref());
        assert_eq!(kernels.len(), 3);
    }

    #[test]
    fn control_ops_split_kernels_in_order() {
        let a = View::contiguous(BaseId(0), DType::F32, &[4]);
        let b = View::contiguous(BaseId(1), DType::F32, &[4]);
        let one = View::scalar(Constant::F32(1.0));
        let instrs = vec![
            Instruction::new(Opcode::Add, vec![a.clone(), a.clone(), one.clone()]),
            Instruction::new(Opcode::Free, vec![a.clone()]),
            Instruction::new(Opcode::Add, vec![b.clone(), b.clone(), one]),
        ];
        let model = fuse_model_from_name("broadest").unwrap();
        let kernels = partition(&instrs, model.as_ref());
        // The second add commutes past the unrelated free into the first
        // kernel; the free keeps its position.
        assert_eq!(kernels[0].instr_idx, [0, 2]);
        assert_eq!(kernels[1].instr_idx, [1]);
    }

    #[test]
    fn commuting_stops_at_dependencies() {
        let a = View::contiguous(BaseId(0), DType::F32, &[4]);
        let b = View::contiguous(BaseId(1), DType::F32, &[4]);
        let one = View::scalar(Constant::F32(1.0));
        let instrs = vec![
            Instruction::new(Opcode::Add, vec![a.clone(), a.clone(), one.clone()]),
            Instruction::new(Opcode::Free, vec![a.clone()]),
            // Depends on the free'd base: must not commute past it.
            Instruction::new(Opcode::Add, vec![b, a, one]),
        ];
        let model = fuse_model_from_name("broadest").unwrap();
        let kernels = partition(&instrs, model.as_ref());
        assert_eq!(kernels.len(), 3);
        assert_eq!(kernels[2].instr_idx, [2]);
    }

    #[test]
    fn mismatched_shapes_do_not_fuse_under_broadest() {
        let a = View::contiguous(BaseId(0), DType::F32, &[4, 4]);
        let b = View::contiguous(BaseId(1), DType::F32, &[8]);
        let one = View::scalar(Constant::F32(1.0));
        let instrs = vec![
            Instruction::new(Opcode::Add, vec![a.clone(), a, one.clone()]),
            Instruction::new(Opcode::Add, vec![b.clone(), b, one]),
        ];
        let model = fuse_model_from_name("broadest").unwrap();
        let kernels = partition(&instrs, model.as_ref());
        assert_eq!(kernels.len(), 2);
    }
}
