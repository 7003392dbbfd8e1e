//! Instructions, batches and kernels.

use crate::base::BaseId;
use crate::view::{view_disjoint, View};

/// Instruction opcodes. Extension opcodes are registered at runtime and
/// dispatch through the engine's extension map instead of the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Opcode {
    // zip: out, in1, in2
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Power,
    Maximum,
    Minimum,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LeftShift,
    RightShift,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    // map: out, in1 (Identity doubles as cast when dtypes differ)
    Identity,
    Negative,
    Absolute,
    Invert,
    LogicalNot,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Floor,
    Ceil,
    // reduce: out, in1, axis constant
    AddReduce,
    MultiplyReduce,
    MinimumReduce,
    MaximumReduce,
    LogicalAndReduce,
    LogicalOrReduce,
    LogicalXorReduce,
    // scan: out, in1, axis constant
    AddAccumulate,
    MultiplyAccumulate,
    // index: out, in1 (flat data), in2 (indexes) / out (flat data), in1, in2
    Gather,
    Scatter,
    // generate: out [, r123 constant]
    Random,
    Range,
    // control: base view
    Free,
    Sync,
    Discard,
    /// Runtime-registered extension opcode
    Ext(u32),
}

impl Opcode {
    /// Operand count, fixed per opcode. Extensions carry their own arity.
    #[must_use]
    pub const fn noperands(self) -> Option<usize> {
        match self {
            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Mod
            | Opcode::Power
            | Opcode::Maximum
            | Opcode::Minimum
            | Opcode::BitwiseAnd
            | Opcode::BitwiseOr
            | Opcode::BitwiseXor
            | Opcode::LeftShift
            | Opcode::RightShift
            | Opcode::LogicalAnd
            | Opcode::LogicalOr
            | Opcode::LogicalXor
            | Opcode::Equal
            | Opcode::NotEqual
            | Opcode::Less
            | Opcode::LessEqual
            | Opcode::Greater
            | Opcode::GreaterEqual
            | Opcode::AddReduce
            | Opcode::MultiplyReduce
            | Opcode::MinimumReduce
            | Opcode::MaximumReduce
            | Opcode::LogicalAndReduce
            | Opcode::LogicalOrReduce
            | Opcode::LogicalXorReduce
            | Opcode::AddAccumulate
            | Opcode::MultiplyAccumulate
            | Opcode::Gather
            | Opcode::Scatter => Some(3),
            Opcode::Identity
            | Opcode::Negative
            | Opcode::Absolute
            | Opcode::Invert
            | Opcode::LogicalNot
            | Opcode::Sqrt
            | Opcode::Exp
            | Opcode::Log
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Floor
            | Opcode::Ceil
            | Opcode::Random => Some(2),
            Opcode::Range | Opcode::Free | Opcode::Sync | Opcode::Discard => Some(1),
            Opcode::Ext(_) => None,
        }
    }

    #[must_use]
    pub const fn is_zip(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Mod
                | Opcode::Power
                | Opcode::Maximum
                | Opcode::Minimum
                | Opcode::BitwiseAnd
                | Opcode::BitwiseOr
                | Opcode::BitwiseXor
                | Opcode::LeftShift
                | Opcode::RightShift
                | Opcode::LogicalAnd
                | Opcode::LogicalOr
                | Opcode::LogicalXor
                | Opcode::Equal
                | Opcode::NotEqual
                | Opcode::Less
                | Opcode::LessEqual
                | Opcode::Greater
                | Opcode::GreaterEqual
        )
    }

    #[must_use]
    pub const fn is_map(self) -> bool {
        matches!(
            self,
            Opcode::Identity
                | Opcode::Negative
                | Opcode::Absolute
                | Opcode::Invert
                | Opcode::LogicalNot
                | Opcode::Sqrt
                | Opcode::Exp
                | Opcode::Log
                | Opcode::Sin
                | Opcode::Cos
                | Opcode::Floor
                | Opcode::Ceil
        )
    }

    #[must_use]
    pub const fn is_reduction(self) -> bool {
        matches!(
            self,
            Opcode::AddReduce
                | Opcode::MultiplyReduce
                | Opcode::MinimumReduce
                | Opcode::MaximumReduce
                | Opcode::LogicalAndReduce
                | Opcode::LogicalOrReduce
                | Opcode::LogicalXorReduce
        )
    }

    #[must_use]
    pub const fn is_scan(self) -> bool {
        matches!(self, Opcode::AddAccumulate | Opcode::MultiplyAccumulate)
    }

    /// Reductions and scans consume one axis of their input.
    #[must_use]
    pub const fn is_sweep(self) -> bool {
        self.is_reduction() || self.is_scan()
    }

    #[must_use]
    pub const fn is_generate(self) -> bool {
        matches!(self, Opcode::Random | Opcode::Range)
    }

    #[must_use]
    pub const fn is_system(self) -> bool {
        matches!(self, Opcode::Free | Opcode::Sync | Opcode::Discard)
    }

    #[must_use]
    pub const fn is_ext(self) -> bool {
        matches!(self, Opcode::Ext(_))
    }

    /// Opcodes that touch array data (everything but control).
    #[must_use]
    pub const fn has_arrays(self) -> bool {
        !self.is_system()
    }
}

/// An opcode plus its operand views. Operand 0 is the output, except for
/// control opcodes where it names the base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<View>,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, operands: Vec<View>) -> Instruction {
        if let Some(n) = opcode.noperands() {
            debug_assert_eq!(operands.len(), n, "wrong arity for {opcode:?}");
        }
        Instruction { opcode, operands }
    }

    #[must_use]
    pub fn out(&self) -> &View {
        &self.operands[0]
    }

    /// The swept axis of a reduction or scan, normalised to `[0, ndim)` of
    /// the input.
    #[must_use]
    pub fn sweep_axis(&self) -> Option<usize> {
        if !self.opcode.is_sweep() {
            return None;
        }
        let axis = self.operands[2].constant.as_ref()?.as_axis()?;
        let ndim = self.operands[1].ndim() as i64;
        let axis = if axis < 0 { axis + ndim } else { axis };
        usize::try_from(axis).ok().filter(|&a| a < ndim as usize)
    }

    /// The base a control instruction names.
    #[must_use]
    pub fn system_base(&self) -> Option<BaseId> {
        if self.opcode.is_system() {
            self.operands[0].base
        } else {
            None
        }
    }
}

/// True iff the output of one instruction is not provably disjoint from any
/// operand of the other (reads and writes both included). Symmetric by
/// construction.
#[must_use]
pub fn instr_dependency(a: &Instruction, b: &Instruction) -> bool {
    let conflict = |x: &Instruction, y: &Instruction| {
        let out = x.out();
        y.operands.iter().any(|op| !view_disjoint(out, op))
    };
    conflict(a, b) || conflict(b, a)
}

/// A batch: the submitted instruction list plus the planner's kernel
/// partition.
#[derive(Debug, Default)]
pub struct BhIr {
    pub instrs: Vec<Instruction>,
    pub kernels: Vec<Kernel>,
}

impl BhIr {
    #[must_use]
    pub fn new(instrs: Vec<Instruction>) -> BhIr {
        BhIr { instrs, kernels: Vec::new() }
    }

    pub fn push(&mut self, instr: Instruction) {
        self.instrs.push(instr);
    }
}

/// Indexes into the batch instruction list (submission order preserved)
/// plus the bases whose entire lifetime is covered by this kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub instr_idx: Vec<usize>,
    pub temps: Vec<BaseId>,
}

impl Kernel {
    #[must_use]
    pub fn new(instr_idx: Vec<usize>) -> Kernel {
        Kernel { instr_idx, temps: Vec::new() }
    }

    /// Number of instructions touching array data.
    #[must_use]
    pub fn narray_ops(&self, instrs: &[Instruction]) -> usize {
        self.instr_idx.iter().filter(|&&i| instrs[i].opcode.has_arrays()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{Constant, DType};

    #[test]
    fn dependency_is_symmetric_on_conflict() {
        let base = BaseId(0);
        let other = BaseId(1);
        let a = Instruction::new(
            Opcode::Identity,
            vec![
                View::contiguous(base, DType::F32, &[4]),
                View::contiguous(other, DType::F32, &[4]),
            ],
        );
        let b = Instruction::new(
            Opcode::Identity,
            vec![
                View::contiguous(other, DType::F32, &[4]),
                View::contiguous(base, DType::F32, &[4]),
            ],
        );
        assert_eq!(instr_dependency(&a, &b), instr_dependency(&b, &a));
        assert!(instr_dependency(&a, &b));
    }

    #[test]
    fn writes_to_disjoint_slices_commute() {
        // write(base[0::2]) vs write(base[1::2]) over a length-10 base
        let base = BaseId(0);
        let even = View::strided(base, DType::F32, 0, &[5], &[2]);
        let odd = View::strided(base, DType::F32, 1, &[5], &[2]);
        let one = View::scalar(Constant::F32(1.0));
        let a = Instruction::new(Opcode::Identity, vec![even, one.clone()]);
        let b = Instruction::new(Opcode::Identity, vec![odd, one]);
        assert!(!instr_dependency(&a, &b));
    }

    #[test]
    fn sweep_axis_comes_from_the_constant() {
        let base = BaseId(0);
        let r = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(base, DType::F32, &[8]),
                View::contiguous(BaseId(1), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(0)),
            ],
        );
        assert_eq!(r.sweep_axis(), Some(0));
        let r = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(base, DType::F32, &[8]),
                View::contiguous(BaseId(1), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(-1)),
            ],
        );
        assert_eq!(r.sweep_axis(), Some(1));
    }
}
