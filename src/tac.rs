//! Three-address lowering of batch instructions.
//!
//! Kernels do not consume bridge instructions directly: each array
//! instruction is lowered to a tac with explicit out/in1/in2 views and the
//! swept axis pulled out of the constant operand. Reduction outputs are
//! normalised to the input rank by inserting the swept axis with stride 0,
//! which keeps axis surgery uniform across all operands.

use crate::dtype::DType;
use crate::error::SmeltError;
use crate::instr::{Instruction, Opcode};
use crate::view::View;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TacKind {
    Map,
    Zip,
    Reduce,
    Scan,
    Generate,
    Gather,
    Scatter,
}

#[derive(Debug, Clone)]
pub struct Tac {
    pub kind: TacKind,
    pub opcode: Opcode,
    pub out: View,
    pub in1: Option<View>,
    pub in2: Option<View>,
    pub sweep: Option<usize>,
    /// Index of the originating instruction in the batch.
    pub instr_idx: usize,
}

impl Tac {
    /// The view that defines the iteration space of this tac.
    #[must_use]
    pub fn iter_view(&self) -> &View {
        match self.kind {
            TacKind::Reduce | TacKind::Scan | TacKind::Scatter => self.in1.as_ref().unwrap(),
            _ => &self.out,
        }
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.iter_view().ndim()
    }

    #[must_use]
    pub fn shape_at(&self, rank: usize) -> i64 {
        self.iter_view().shape[rank]
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        std::iter::once(&self.out).chain(self.in1.iter()).chain(self.in2.iter())
    }

    fn views_mut(&mut self) -> impl Iterator<Item = &mut View> {
        std::iter::once(&mut self.out).chain(self.in1.iter_mut()).chain(self.in2.iter_mut())
    }

    /// Transpose iteration axes `a1` and `a2` in every operand view.
    /// Flat side views (gather/scatter data) keep their own layout.
    pub fn transpose(&mut self, a1: usize, a2: usize) {
        let ndim = self.ndim();
        debug_assert!(a1 < ndim && a2 < ndim);
        for view in self.views_mut() {
            if !view.is_constant() && view.ndim() == ndim {
                view.transpose(a1, a2);
            }
        }
        if let Some(s) = self.sweep {
            if s == a1 {
                self.sweep = Some(a2);
            } else if s == a2 {
                self.sweep = Some(a1);
            }
        }
    }

    /// Remove iteration axis `axis` from every operand view.
    pub fn remove_axis(&mut self, axis: usize) {
        let ndim = self.ndim();
        debug_assert!(axis < ndim);
        debug_assert_ne!(self.sweep, Some(axis));
        for view in self.views_mut() {
            if !view.is_constant() && view.ndim() == ndim {
                view.remove_axis(axis);
            }
        }
        if let Some(s) = self.sweep {
            if s > axis {
                self.sweep = Some(s - 1);
            }
        }
    }

    /// Merge iteration axes `axis` and `axis + 1`. Only legal when every
    /// operand is physically consistent with the merge: the inner extent
    /// must fill the outer stride exactly. Returns false (leaving the tac
    /// untouched) otherwise.
    #[must_use]
    pub fn collapse_axes(&mut self, axis: usize) -> bool {
        let ndim = self.ndim();
        if self.sweep == Some(axis) || self.sweep == Some(axis + 1) {
            return false;
        }
        for view in self.views() {
            if view.is_constant() || view.ndim() != ndim {
                continue;
            }
            if view.shape[axis + 1] * view.stride[axis + 1] != view.stride[axis] {
                return false;
            }
        }
        for view in self.views_mut() {
            if view.is_constant() || view.ndim() != ndim {
                continue;
            }
            view.shape[axis] *= view.shape[axis + 1];
            view.stride[axis] = view.stride[axis + 1];
        }
        self.remove_axis(axis + 1);
        true
    }
}

fn type_error(instr: &Instruction, what: &str) -> SmeltError {
    SmeltError::TypeNotSupported(
        format!("{:?} on {}: {what}", instr.opcode, instr.operands[0].dtype).into(),
    )
}

fn check_zip(instr: &Instruction) -> Result<(), SmeltError> {
    let out = instr.operands[0].dtype;
    let a = instr.operands[1].dtype;
    let b = instr.operands[2].dtype;
    if a != b {
        return Err(type_error(instr, "operand dtypes differ"));
    }
    match instr.opcode {
        Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide => {
            if !(a.is_int() || a.is_float() || a.is_complex()) {
                return Err(type_error(instr, "arithmetic needs a numeric type"));
            }
            if out != a {
                return Err(type_error(instr, "output dtype must match inputs"));
            }
        }
        Opcode::Mod | Opcode::Power | Opcode::Maximum | Opcode::Minimum => {
            let complex_pow = instr.opcode == Opcode::Power && a.is_complex();
            if !(a.is_int() || a.is_float() || complex_pow) {
                return Err(type_error(instr, "not defined for this type"));
            }
            if out != a {
                return Err(type_error(instr, "output dtype must match inputs"));
            }
        }
        Opcode::BitwiseAnd | Opcode::BitwiseOr | Opcode::BitwiseXor => {
            if !(a.is_int() || a == DType::Bool) {
                return Err(type_error(instr, "bitwise needs an integer type"));
            }
            if out != a {
                return Err(type_error(instr, "output dtype must match inputs"));
            }
        }
        Opcode::LeftShift | Opcode::RightShift => {
            if !a.is_int() {
                return Err(type_error(instr, "shift needs an integer type"));
            }
            if out != a {
                return Err(type_error(instr, "output dtype must match inputs"));
            }
        }
        Opcode::LogicalAnd | Opcode::LogicalOr | Opcode::LogicalXor => {
            if a != DType::Bool || out != DType::Bool {
                return Err(type_error(instr, "logical ops are boolean"));
            }
        }
        Opcode::Equal | Opcode::NotEqual => {
            if out != DType::Bool {
                return Err(type_error(instr, "comparison output must be bool"));
            }
        }
        Opcode::Less | Opcode::LessEqual | Opcode::Greater | Opcode::GreaterEqual => {
            if a.is_complex() {
                return Err(type_error(instr, "complex types are unordered"));
            }
            if out != DType::Bool {
                return Err(type_error(instr, "comparison output must be bool"));
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn check_map(instr: &Instruction) -> Result<(), SmeltError> {
    let out = instr.operands[0].dtype;
    let a = instr.operands[1].dtype;
    match instr.opcode {
        // Identity doubles as cast; any pair of non-opaque dtypes goes.
        Opcode::Identity => {
            if out == DType::R123 || a == DType::R123 {
                return Err(type_error(instr, "cannot cast the opaque type"));
            }
        }
        Opcode::Negative => {
            if !(a.is_signed() || a.is_complex()) || out != a {
                return Err(type_error(instr, "negation needs a signed type"));
            }
        }
        Opcode::Absolute => {
            if !(a.is_int() || a.is_float()) || out != a {
                return Err(type_error(instr, "abs needs a real numeric type"));
            }
        }
        Opcode::Invert => {
            if !(a.is_int() || a == DType::Bool) || out != a {
                return Err(type_error(instr, "invert needs an integer type"));
            }
        }
        Opcode::LogicalNot => {
            if a != DType::Bool || out != DType::Bool {
                return Err(type_error(instr, "logical not is boolean"));
            }
        }
        Opcode::Sqrt | Opcode::Exp | Opcode::Log | Opcode::Sin | Opcode::Cos => {
            if !(a.is_float() || a.is_complex()) || out != a {
                return Err(type_error(instr, "needs a floating or complex type"));
            }
        }
        Opcode::Floor | Opcode::Ceil => {
            if !a.is_float() || out != a {
                return Err(type_error(instr, "needs a floating type"));
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn check_sweep(instr: &Instruction) -> Result<(), SmeltError> {
    let out = instr.operands[0].dtype;
    let a = instr.operands[1].dtype;
    if out != a {
        return Err(type_error(instr, "output dtype must match input"));
    }
    match instr.opcode {
        Opcode::AddReduce
        | Opcode::MultiplyReduce
        | Opcode::AddAccumulate
        | Opcode::MultiplyAccumulate => {
            if !(a.is_int() || a.is_float() || a.is_complex()) {
                return Err(type_error(instr, "needs a numeric type"));
            }
        }
        Opcode::MinimumReduce | Opcode::MaximumReduce => {
            if !(a.is_int() || a.is_float() || a == DType::Bool) {
                return Err(type_error(instr, "complex types are unordered"));
            }
        }
        Opcode::LogicalAndReduce | Opcode::LogicalOrReduce | Opcode::LogicalXorReduce => {
            if a != DType::Bool {
                return Err(type_error(instr, "logical reductions are boolean"));
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Lower one array instruction into a tac. Control and extension
/// instructions never reach this point.
pub fn lower(instr: &Instruction, instr_idx: usize) -> Result<Tac, SmeltError> {
    let opcode = instr.opcode;
    if opcode.is_zip() {
        check_zip(instr)?;
        let out = instr.operands[0].clone();
        if instr.operands[1..].iter().any(|v| !v.is_constant() && v.shape != out.shape) {
            return Err(SmeltError::invalid_shape(format!(
                "{opcode:?}: operand shapes do not match the output"
            )));
        }
        return Ok(Tac {
            kind: TacKind::Zip,
            opcode,
            out,
            in1: Some(instr.operands[1].clone()),
            in2: Some(instr.operands[2].clone()),
            sweep: None,
            instr_idx,
        });
    }
    if opcode.is_map() {
        check_map(instr)?;
        let out = instr.operands[0].clone();
        let in1 = instr.operands[1].clone();
        if !in1.is_constant() && in1.shape != out.shape {
            return Err(SmeltError::invalid_shape(format!(
                "{opcode:?}: operand shapes do not match the output"
            )));
        }
        return Ok(Tac { kind: TacKind::Map, opcode, out, in1: Some(in1), in2: None, sweep: None, instr_idx });
    }
    if opcode.is_sweep() {
        check_sweep(instr)?;
        let in1 = instr.operands[1].clone();
        let Some(axis) = instr.sweep_axis() else {
            return Err(SmeltError::InstrNotSupported(
                format!("{opcode:?}: missing or out-of-range axis constant").into(),
            ));
        };
        let mut out = instr.operands[0].clone();
        if opcode.is_reduction() {
            if out.ndim() + 1 != in1.ndim() && !(in1.ndim() == 1 && out.nelements() == 1) {
                return Err(SmeltError::invalid_shape(format!(
                    "{opcode:?}: output rank must be one below the input"
                )));
            }
            if in1.ndim() == 1 {
                // Scalar result of a rank-1 reduction.
                out.shape = vec![in1.shape[0]];
                out.stride = vec![0];
            } else {
                out.insert_axis(axis, in1.shape[axis], 0);
            }
        } else if out.shape != in1.shape {
            return Err(SmeltError::invalid_shape(format!(
                "{opcode:?}: scan output shape must match the input"
            )));
        }
        let kind = if opcode.is_reduction() { TacKind::Reduce } else { TacKind::Scan };
        return Ok(Tac { kind, opcode, out, in1: Some(in1), in2: None, sweep: Some(axis), instr_idx });
    }
    match opcode {
        Opcode::Gather => {
            let out = instr.operands[0].clone();
            let data = instr.operands[1].clone();
            let index = instr.operands[2].clone();
            if data.dtype != out.dtype {
                return Err(type_error(instr, "gather data dtype must match the output"));
            }
            if !index.dtype.is_int() {
                return Err(type_error(instr, "gather index must be an integer type"));
            }
            if index.shape != out.shape {
                return Err(SmeltError::invalid_shape(
                    "gather index shape must match the output".to_string(),
                ));
            }
            Ok(Tac {
                kind: TacKind::Gather,
                opcode,
                out,
                in1: Some(data),
                in2: Some(index),
                sweep: None,
                instr_idx,
            })
        }
        Opcode::Scatter => {
            let out = instr.operands[0].clone();
            let value = instr.operands[1].clone();
            let index = instr.operands[2].clone();
            if value.dtype != out.dtype {
                return Err(type_error(instr, "scatter value dtype must match the output"));
            }
            if !index.dtype.is_int() {
                return Err(type_error(instr, "scatter index must be an integer type"));
            }
            if index.shape != value.shape {
                return Err(SmeltError::invalid_shape(
                    "scatter index shape must match the value".to_string(),
                ));
            }
            Ok(Tac {
                kind: TacKind::Scatter,
                opcode,
                out,
                in1: Some(value),
                in2: Some(index),
                sweep: None,
                instr_idx,
            })
        }
        Opcode::Random => {
            let out = instr.operands[0].clone();
            if out.dtype != DType::U64 {
                return Err(type_error(instr, "the generator produces uint64"));
            }
            let seed = instr.operands[1].clone();
            if seed.constant.map(|c| c.dtype()) != Some(DType::R123) {
                return Err(type_error(instr, "seed must be an r123 constant"));
            }
            Ok(Tac {
                kind: TacKind::Generate,
                opcode,
                out,
                in1: Some(seed),
                in2: None,
                sweep: None,
                instr_idx,
            })
        }
        Opcode::Range => {
            let out = instr.operands[0].clone();
            if !(out.dtype.is_int() || out.dtype.is_float()) {
                return Err(type_error(instr, "range needs a real numeric type"));
            }
            Ok(Tac { kind: TacKind::Generate, opcode, out, in1: None, in2: None, sweep: None, instr_idx })
        }
        _ => Err(SmeltError::InstrNotSupported(
            format!("{opcode:?} cannot be lowered to a tac").into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseId;
    use crate::dtype::Constant;

    #[test]
    fn reduce_output_is_rank_normalised() {
        let r = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(BaseId(0), DType::F32, &[8]),
                View::contiguous(BaseId(1), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(0)),
            ],
        );
        let tac = lower(&r, 0).unwrap();
        assert_eq!(tac.sweep, Some(0));
        assert_eq!(tac.out.shape, [8, 8]);
        assert_eq!(tac.out.stride, [0, 1]);
        assert_eq!(tac.ndim(), 2);
    }

    #[test]
    fn transpose_adjusts_sweep() {
        let r = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(BaseId(0), DType::F32, &[8]),
                View::contiguous(BaseId(1), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(0)),
            ],
        );
        let mut tac = lower(&r, 0).unwrap();
        tac.transpose(0, 1);
        assert_eq!(tac.sweep, Some(1));
        assert_eq!(tac.in1.as_ref().unwrap().stride, [1, 8]);
    }

    #[test]
    fn collapse_requires_physical_consistency() {
        let add = Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(BaseId(0), DType::F32, &[4, 4]),
                View::contiguous(BaseId(1), DType::F32, &[4, 4]),
                View::contiguous(BaseId(2), DType::F32, &[4, 4]),
            ],
        );
        let mut tac = lower(&add, 0).unwrap();
        assert!(tac.collapse_axes(0));
        assert_eq!(tac.out.shape, [16]);
        assert_eq!(tac.out.stride, [1]);

        // Padded rows: shape[1] * stride[1] != stride[0].
        let padded = View::strided(BaseId(0), DType::F32, 0, &[4, 4], &[5, 1]);
        let add = Instruction::new(
            Opcode::Add,
            vec![
                padded.clone(),
                View::strided(BaseId(1), DType::F32, 0, &[4, 4], &[5, 1]),
                View::scalar(Constant::F32(1.0)),
            ],
        );
        let mut tac = lower(&add, 0).unwrap();
        assert!(!tac.collapse_axes(0));
        assert_eq!(tac.out.shape, [4, 4]);
    }

    #[test]
    fn type_checks_reject_mismatches() {
        let bad = Instruction::new(
            Opcode::Sqrt,
            vec![
                View::contiguous(BaseId(0), DType::I32, &[4]),
                View::contiguous(BaseId(1), DType::I32, &[4]),
            ],
        );
        assert!(matches!(lower(&bad, 0), Err(SmeltError::TypeNotSupported(_))));
        let bad = Instruction::new(
            Opcode::Less,
            vec![
                View::contiguous(BaseId(0), DType::I32, &[4]),
                View::contiguous(BaseId(1), DType::I32, &[4]),
                View::contiguous(BaseId(2), DType::I32, &[4]),
            ],
        );
        assert!(matches!(lower(&bad, 0), Err(SmeltError::TypeNotSupported(_))));
    }
}
