//! Views and the view algebra: simplification, aliasing and disjointness.
//!
//! These predicates are the only mechanism the planner and the block-tree
//! transformations use to reason about safety.

use crate::base::BaseId;
use crate::dtype::{Constant, DType};
use crate::error::SmeltError;

/// Upper bound on view dimensionality.
pub const MAX_DIM: usize = 16;

/// A strided reference into a base. A view with `base == None` is a constant
/// carrying an inline scalar value. Views are values; they do not own their
/// base. `start` and `stride` are in elements; strides may be zero
/// (broadcast) or negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    pub base: Option<BaseId>,
    pub dtype: DType,
    pub start: i64,
    pub shape: Vec<i64>,
    pub stride: Vec<i64>,
    pub constant: Option<Constant>,
}

impl View {
    /// Row-major view of the whole base.
    #[must_use]
    pub fn contiguous(base: BaseId, dtype: DType, shape: &[i64]) -> View {
        debug_assert!(shape.len() <= MAX_DIM);
        let mut stride = vec![0i64; shape.len()];
        let mut st = 1;
        for (i, &d) in shape.iter().enumerate().rev() {
            stride[i] = st;
            st *= d;
        }
        View { base: Some(base), dtype, start: 0, shape: shape.to_vec(), stride, constant: None }
    }

    #[must_use]
    pub fn strided(base: BaseId, dtype: DType, start: i64, shape: &[i64], stride: &[i64]) -> View {
        debug_assert_eq!(shape.len(), stride.len());
        debug_assert!(shape.len() <= MAX_DIM);
        View {
            base: Some(base),
            dtype,
            start,
            shape: shape.to_vec(),
            stride: stride.to_vec(),
            constant: None,
        }
    }

    #[must_use]
    pub fn scalar(constant: Constant) -> View {
        View {
            base: None,
            dtype: constant.dtype(),
            start: 0,
            shape: vec![1],
            stride: vec![0],
            constant: Some(constant),
        }
    }

    /// Flat view of all `nelem` elements, used by control instructions to
    /// name a base.
    #[must_use]
    pub fn whole(base: BaseId, dtype: DType, nelem: i64) -> View {
        View {
            base: Some(base),
            dtype,
            start: 0,
            shape: vec![nelem],
            stride: vec![1],
            constant: None,
        }
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub const fn is_constant(&self) -> bool {
        self.base.is_none()
    }

    /// Total element count.
    #[must_use]
    pub fn nelements(&self) -> i64 {
        self.shape.iter().product()
    }

    /// Element count ignoring broadcasted dimensions (those with a
    /// non-positive stride do not contribute distinct addresses forward).
    #[must_use]
    pub fn nelements_nbcast(&self) -> i64 {
        self.shape
            .iter()
            .zip(self.stride.iter())
            .filter(|(_, &st)| st > 0)
            .map(|(&d, _)| d)
            .product()
    }

    /// Element offset of a linear index, row-major over `shape`.
    #[must_use]
    pub fn offset_of(&self, linear: i64) -> i64 {
        let mut idx = linear;
        let mut off = self.start;
        for (&d, &st) in self.shape.iter().zip(self.stride.iter()).rev() {
            off += (idx % d) * st;
            idx /= d;
        }
        off
    }

    /// The view of minimal rank addressing the same elements in the same
    /// order. Rank-1 axes are dropped; axis `i` merges into `i-1` iff the
    /// inner extent fills the outer stride exactly.
    #[must_use]
    pub fn simplify(&self) -> View {
        let mut shape: Vec<i64> = Vec::with_capacity(self.ndim());
        let mut stride: Vec<i64> = Vec::with_capacity(self.ndim());
        for (&d, &st) in self.shape.iter().zip(self.stride.iter()).rev() {
            if d == 1 {
                continue;
            }
            match (shape.last(), stride.last()) {
                (Some(&pd), Some(&pst)) if pd * pst == st => {
                    *shape.last_mut().unwrap() = pd * d;
                }
                _ => {
                    shape.push(d);
                    stride.push(st);
                }
            }
        }
        if shape.is_empty() {
            shape.push(1);
            stride.push(1);
        }
        shape.reverse();
        stride.reverse();
        View { shape, stride, ..self.clone() }
    }

    /// Like [`View::simplify`] but the resulting dimensions must align to
    /// `target`. Fails when the target has too few usable dimensions or a
    /// per-axis size would have to exceed the target size.
    pub fn simplify_to_shape(&self, target: &[i64]) -> Result<View, SmeltError> {
        if target.iter().product::<i64>() != self.nelements() {
            return Err(SmeltError::invalid_shape(format!(
                "cannot reduce {:?} to {target:?}: element counts differ",
                self.shape
            )));
        }
        // Source axes, innermost first, rank-1 axes dropped.
        let src: Vec<(i64, i64)> = self
            .shape
            .iter()
            .zip(self.stride.iter())
            .rev()
            .filter(|(&d, _)| d != 1)
            .map(|(&d, &st)| (d, st))
            .collect();
        let mut shape = vec![0i64; target.len()];
        let mut stride = vec![0i64; target.len()];
        let mut s = 0;
        for (t, &want) in target.iter().enumerate().rev() {
            if want == 1 {
                shape[t] = 1;
                stride[t] = if t + 1 < target.len() { shape[t + 1] * stride[t + 1] } else { 1 };
                continue;
            }
            if s >= src.len() {
                return Err(SmeltError::invalid_shape(format!(
                    "cannot reduce {:?} to {target:?}: ran out of axes",
                    self.shape
                )));
            }
            let (mut acc_d, acc_st) = src[s];
            s += 1;
            while acc_d < want {
                // The next outer axis must continue the merged run.
                let Some(&(d, st)) = src.get(s) else {
                    return Err(SmeltError::invalid_shape(format!(
                        "cannot reduce {:?} to {target:?}: ran out of axes",
                        self.shape
                    )));
                };
                if st != acc_d * acc_st {
                    return Err(SmeltError::invalid_shape(format!(
                        "cannot reduce {:?} (strides {:?}) to {target:?}",
                        self.shape, self.stride
                    )));
                }
                acc_d *= d;
                s += 1;
            }
            if acc_d != want {
                return Err(SmeltError::invalid_shape(format!(
                    "axis size {acc_d} exceeds target size {want}"
                )));
            }
            shape[t] = want;
            stride[t] = acc_st;
        }
        if s != src.len() {
            return Err(SmeltError::invalid_shape(format!(
                "cannot reduce {:?} to {target:?}: too few dimensions",
                self.shape
            )));
        }
        Ok(View { shape, stride, ..self.clone() })
    }

    /// Swap axes `a1` and `a2` (both shape and stride).
    pub fn transpose(&mut self, a1: usize, a2: usize) {
        self.shape.swap(a1, a2);
        self.stride.swap(a1, a2);
    }

    pub fn remove_axis(&mut self, axis: usize) {
        self.shape.remove(axis);
        self.stride.remove(axis);
    }

    pub fn insert_axis(&mut self, axis: usize, shape: i64, stride: i64) {
        debug_assert!(self.ndim() < MAX_DIM);
        self.shape.insert(axis, shape);
        self.stride.insert(axis, stride);
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(c) = &self.constant {
            f.write_fmt(format_args!("const({c})"))
        } else {
            f.write_fmt(format_args!(
                "{}[{}; sh{:?} st{:?}]",
                self.base.unwrap(),
                self.start,
                self.shape,
                self.stride
            ))
        }
    }
}

/// Structural equality including base identity. Constants never compare
/// equal to anything, themselves included.
#[must_use]
pub fn view_same(a: &View, b: &View) -> bool {
    if a.is_constant() || b.is_constant() {
        return false;
    }
    a == b
}

/// Two views address the same elements in the same order. Constants are
/// aligned with each other by definition.
#[must_use]
pub fn view_aligned(a: &View, b: &View) -> bool {
    if a.is_constant() && b.is_constant() {
        return true;
    }
    if a.is_constant() != b.is_constant() {
        return false;
    }
    a.base == b.base && a.simplify() == b.simplify()
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Conservative disjointness: `true` only when the two strided ranges
/// provably share no address. May return `false` for truly non-overlapping
/// views, never `true` for overlapping ones. All arithmetic is 64-bit
/// signed.
///
/// Both rejects look at the views as wholes. A single axis must never
/// decide: its projected interval ignores the address contributions of the
/// other axes, and a broadcast axis still occupies its `start` address.
#[must_use]
pub fn view_disjoint(a: &View, b: &View) -> bool {
    if a.is_constant() || b.is_constant() {
        return true;
    }
    if a.base != b.base {
        return true;
    }
    // Inclusive address bounding box over every axis of the view.
    let bounds = |v: &View| {
        let mut lo = v.start;
        let mut hi = v.start;
        for (&d, &st) in v.shape.iter().zip(v.stride.iter()) {
            let span = (d - 1) * st;
            if span < 0 {
                lo += span;
            } else {
                hi += span;
            }
        }
        (lo, hi)
    };
    let (a_lo, a_hi) = bounds(a);
    let (b_lo, b_hi) = bounds(b);
    if a_hi < b_lo || b_hi < a_lo {
        return true;
    }
    // Every address of a view is congruent to its start modulo the gcd of
    // all strides; broadcast axes contribute no step and drop out.
    let mut g = 0i64;
    for &st in a.stride.iter().chain(b.stride.iter()) {
        g = gcd(g, st);
    }
    g > 1 && a.start.rem_euclid(g) != b.start.rem_euclid(g)
}
