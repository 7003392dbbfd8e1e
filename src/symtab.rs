//! Per-kernel symbol table: dense operand numbering, layout classification,
//! array-contraction and the canonical kernel symbol.

use crate::base::{Base, BaseId};
use crate::block::{Block, BlockTree};
use crate::slab::Slab;
use crate::tac::TacKind;
use crate::view::View;
use crate::Map;
use std::fmt::Write;
use std::hash::{Hash, Hasher};

/// Operand classification driving codegen specialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Inline constant, dereferenced once at entry
    ScalarConst,
    /// Kernel-local scalar temporary
    ScalarTemp,
    /// Single-element base
    Scalar,
    /// Temp base replaced by a per-iteration scalar local
    Contractable,
    /// Fully packed row-major
    Contiguous,
    /// Unit stride on the inner axis
    Consecutive,
    /// Arbitrary strides
    Strided,
    /// Reserved; codegen refuses it loudly
    Sparse,
}

impl Layout {
    #[must_use]
    pub const fn tag(self) -> char {
        match self {
            Layout::ScalarConst => 'k',
            Layout::ScalarTemp => 't',
            Layout::Scalar => 'z',
            Layout::Contractable => 'x',
            Layout::Contiguous => 'C',
            Layout::Consecutive => 'E',
            Layout::Strided => 'S',
            Layout::Sparse => 'P',
        }
    }

    /// Layouts whose storage lives outside the kernel.
    #[must_use]
    pub const fn is_materialised(self) -> bool {
        matches!(self, Layout::Scalar | Layout::Contiguous | Layout::Consecutive | Layout::Strided)
    }
}

#[derive(Debug, Clone)]
pub struct Operand {
    pub view: View,
    pub layout: Layout,
}

/// Iteration-space tag baked into the symbol and the runtime descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterLayout {
    /// One flat `work_offset` loop covers the whole kernel
    Collapsible,
    /// Nested loops with per-operand cursors
    Strided,
    /// Single-element iteration
    Scalar,
}

#[derive(Debug, Clone)]
pub struct IterSpace {
    pub layout: IterLayout,
    pub ndim: usize,
    pub nelem: i64,
    pub shape: Vec<i64>,
}

#[derive(Debug)]
pub struct SymbolTable {
    pub operands: Vec<Operand>,
    /// Per-tac operand ids, aligned with the tree's tac list: out, in1, in2.
    pub tac_ids: Vec<[Option<usize>; 3]>,
    index: Map<View, usize>,
}

/// A view is scalar when its base holds a single element.
pub fn is_scalar(view: &View, bases: &Slab<BaseId, Base>) -> bool {
    view.base.is_some_and(|b| bases[b].nelem == 1)
}

fn classify(view: &View, bases: &Slab<BaseId, Base>) -> Layout {
    if view.is_constant() {
        return Layout::ScalarConst;
    }
    if is_scalar(view, bases) {
        return Layout::Scalar;
    }
    let packed = View::contiguous(view.base.unwrap(), view.dtype, &view.shape);
    if view.stride == packed.stride {
        return Layout::Contiguous;
    }
    if view.stride.last() == Some(&1) {
        return Layout::Consecutive;
    }
    Layout::Strided
}

impl SymbolTable {
    /// Number every distinct operand view in the tree and classify it.
    #[must_use]
    pub fn from_tree(tree: &BlockTree, bases: &Slab<BaseId, Base>) -> SymbolTable {
        let mut operands: Vec<Operand> = Vec::new();
        let mut index: Map<View, usize> = Map::default();
        let mut tac_ids = Vec::with_capacity(tree.tacs.len());
        for tac in &tree.tacs {
            let mut ids = [None, None, None];
            for (slot, view) in
                [Some(&tac.out), tac.in1.as_ref(), tac.in2.as_ref()].into_iter().enumerate()
            {
                let Some(view) = view else { continue };
                let id = *index.entry(view.clone()).or_insert_with(|| {
                    operands.push(Operand { view: view.clone(), layout: classify(view, bases) });
                    operands.len() - 1
                });
                ids[slot] = Some(id);
            }
            tac_ids.push(ids);
        }
        SymbolTable { operands, tac_ids, index }
    }

    #[must_use]
    pub fn operand_id(&self, view: &View) -> Option<usize> {
        self.index.get(view).copied()
    }

    /// Mark every operand of `base` as contraction targets: their storage
    /// becomes a per-iteration scalar local in generated code.
    pub fn turn_contractable(&mut self, base: BaseId, bases: &Slab<BaseId, Base>) {
        for op in &mut self.operands {
            if op.view.base == Some(base) {
                op.layout =
                    if bases[base].nelem == 1 { Layout::ScalarTemp } else { Layout::Contractable };
            }
        }
    }

    /// True when the base backs exactly one operand; such pointers carry
    /// `restrict` in generated code.
    #[must_use]
    pub fn base_refcount_one(&self, id: usize) -> bool {
        let Some(base) = self.operands[id].view.base else {
            return false;
        };
        self.operands.iter().filter(|op| op.view.base == Some(base)).count() == 1
    }

    /// The iteration space of the (possibly transformed, possibly
    /// contracted) tree. Recomputed after contraction.
    #[must_use]
    pub fn iterspace(&self, tree: &BlockTree) -> IterSpace {
        let mut shape: Vec<i64> = Vec::new();
        for tac in &tree.tacs {
            let s = &tac.iter_view().shape;
            if s.iter().product::<i64>() > shape.iter().product() {
                shape = s.clone();
            }
        }
        if shape.is_empty() {
            shape.push(1);
        }
        let nelem: i64 = shape.iter().product();
        let regular = tree
            .tacs
            .iter()
            .all(|t| matches!(t.kind, TacKind::Map | TacKind::Zip | TacKind::Generate));
        let layout = if nelem == 1 {
            IterLayout::Scalar
        } else if regular
            && tree.roots.iter().all(|root| {
                root.as_loop().is_some_and(|l| {
                    l.rank == 0 && l.sweeps.is_empty() && l.blocks.iter().all(Block::is_leaf)
                })
            })
        {
            IterLayout::Collapsible
        } else {
            IterLayout::Strided
        };
        IterSpace { layout, ndim: shape.len(), nelem, shape }
    }

    /// Canonical symbol: a deterministic function of the kernel's loop
    /// structure, sizes, opcodes, operand dtypes, layouts and ranks, and
    /// the iteration layout. No addresses, no per-run data. Returns `None`
    /// when the tree holds no array operations.
    #[must_use]
    pub fn symbolize(&self, tree: &BlockTree) -> Option<String> {
        if tree.tacs.is_empty() {
            return None;
        }
        let ispace = self.iterspace(tree);
        let mut sym = String::with_capacity(256);
        _ = write!(
            sym,
            "{}{}D",
            match ispace.layout {
                IterLayout::Collapsible => "COL",
                IterLayout::Strided => "STR",
                IterLayout::Scalar => "SCL",
            },
            ispace.ndim
        );
        fn block_sig(b: &Block, tree: &BlockTree, tab: &SymbolTable, sym: &mut String) {
            match b {
                Block::Leaf(t) => {
                    let tac = &tree.tacs[*t];
                    _ = write!(sym, "_{:?}.{:?}", tac.kind, tac.opcode);
                    if let Some(s) = tac.sweep {
                        _ = write!(sym, ".a{s}");
                    }
                    for (slot, ids) in tab.tac_ids[*t].iter().enumerate() {
                        let Some(id) = ids else { continue };
                        let op = &tab.operands[*id];
                        _ = write!(
                            sym,
                            ".{slot}o{id}{}{}{}",
                            op.layout.tag(),
                            op.view.dtype.tag(),
                            op.view.ndim()
                        );
                    }
                }
                Block::Loop(l) => {
                    _ = write!(
                        sym,
                        "_L{}x{}{}(",
                        l.rank,
                        l.size,
                        if l.parallel { "p" } else { "" }
                    );
                    for c in &l.blocks {
                        block_sig(c, tree, tab, sym);
                    }
                    sym.push(')');
                }
            }
        }
        for root in &tree.roots {
            block_sig(root, tree, self, &mut sym);
        }
        Some(sym)
    }
}

/// 64-bit hash of a canonical symbol, used for object filenames and entry
/// point names.
#[must_use]
pub fn symbol_hash(symbol: &str) -> u64 {
    let mut h = rustc_hash::FxHasher::default();
    symbol.hash(&mut h);
    h.finish()
}
