//! Template-driven C99 code generation.
//!
//! The skeleton of every kernel comes from a named template map filled by
//! pure string substitution; the walker builds the loop nest from the block
//! tree, stepping a cursor pointer per operand and axis. Specialisations:
//! a flat `work_offset` loop for COLLAPSIBLE iteration spaces, scalar
//! accumulators for sweeps on the inner axis, and guarded in-memory
//! accumulation for partial-axis sweeps.

use crate::block::{Block, BlockTree, LoopB};
use crate::dtype::DType;
use crate::error::SmeltError;
use crate::instr::Opcode;
use crate::symtab::{IterLayout, IterSpace, Layout, SymbolTable};
use crate::tac::TacKind;
use crate::Map;
use std::fmt::Write;

/// Named source templates with `{{PLACEHOLDER}}` slots.
pub struct Plaid {
    templates: Map<&'static str, &'static str>,
}

const TPL_KERNEL: &str = "\
{{PREAMBLE}}
void {{ENTRY}}(smelt_operand_t **opnds, smelt_iterspace_t *iterspace)
{
{{UNPACK}}
{{BODY}}}
";

const TPL_PREAMBLE: &str = "\
// {{SYMBOL}}
#include <stdint.h>
#include <stdlib.h>
#include <math.h>
#include <float.h>
#include <complex.h>

typedef struct { uint64_t start; uint64_t key; } smelt_r123_t;

typedef struct {
    void    *data;
    int64_t  start;
    int64_t  nelem;
    int64_t  ndim;
    int64_t  shape[{{MAX_DIM}}];
    int64_t  stride[{{MAX_DIM}}];
} smelt_operand_t;

typedef struct {
    int64_t layout;
    int64_t ndim;
    int64_t nelem;
    int64_t shape[{{MAX_DIM}}];
} smelt_iterspace_t;
{{PHILOX}}";

const TPL_PHILOX: &str = "
static inline uint64_t smelt_philox(uint64_t counter, uint64_t key)
{
    uint32_t c0 = (uint32_t)counter, c1 = (uint32_t)(counter >> 32);
    uint32_t k = (uint32_t)key;
    for (int r = 0; r < 10; ++r) {
        uint64_t prod = (uint64_t)0xD256D193u * c0;
        c0 = (uint32_t)(prod >> 32) ^ c1 ^ k;
        c1 = (uint32_t)prod;
        k += 0x9E3779B9u;
    }
    return ((uint64_t)c1 << 32) | c0;
}
";

impl Plaid {
    #[must_use]
    pub fn new() -> Plaid {
        let mut templates = Map::default();
        templates.insert("kernel", TPL_KERNEL);
        templates.insert("preamble", TPL_PREAMBLE);
        templates.insert("philox", TPL_PHILOX);
        Plaid { templates }
    }

    #[must_use]
    pub fn fill(&self, name: &str, subs: &[(&str, &str)]) -> String {
        let mut out = (*self.templates.get(name).unwrap()).to_string();
        for (key, value) in subs {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}

impl Default for Plaid {
    fn default() -> Self {
        Plaid::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Emit `omp parallel for` on threadable loops.
    pub openmp: bool,
}

struct Walker<'a> {
    tree: &'a BlockTree,
    tab: &'a SymbolTable,
    opts: Options,
    src: String,
    indent: String,
}

fn float_suffix(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f",
        DType::CF32 => "f",
        _ => "",
    }
}

fn math_fn(name: &str, dtype: DType) -> String {
    if dtype.is_complex() {
        format!("c{name}{}", float_suffix(dtype))
    } else {
        format!("{name}{}", float_suffix(dtype))
    }
}

fn cast_expr(from: DType, to: DType, x: &str) -> String {
    if from == to {
        return x.to_string();
    }
    if from.is_complex() && !to.is_complex() {
        let re = if from == DType::CF32 { "crealf" } else { "creal" };
        if to == DType::Bool {
            return format!("(uint8_t)({re}({x}) != 0)");
        }
        return format!("({}){re}({x})", to.c99());
    }
    if to == DType::Bool {
        return format!("(uint8_t)(({x}) != 0)");
    }
    format!("({})({x})", to.c99())
}

fn neutral(opcode: Opcode, dtype: DType) -> Result<String, SmeltError> {
    let lit = match opcode {
        Opcode::AddReduce | Opcode::AddAccumulate | Opcode::LogicalXorReduce => Some("0"),
        Opcode::MultiplyReduce | Opcode::MultiplyAccumulate | Opcode::LogicalAndReduce => Some("1"),
        Opcode::LogicalOrReduce => Some("0"),
        Opcode::MinimumReduce => dtype.max_literal(),
        Opcode::MaximumReduce => dtype.min_literal(),
        _ => None,
    };
    lit.map(String::from).ok_or_else(|| {
        SmeltError::TypeNotSupported(format!("no neutral element for {opcode:?} on {dtype}").into())
    })
}

fn combine(opcode: Opcode, a: &str, b: &str) -> String {
    match opcode {
        Opcode::AddReduce | Opcode::AddAccumulate => format!("{a} + {b}"),
        Opcode::MultiplyReduce | Opcode::MultiplyAccumulate => format!("{a} * {b}"),
        Opcode::MinimumReduce => format!("({a}) < ({b}) ? ({a}) : ({b})"),
        Opcode::MaximumReduce => format!("({a}) > ({b}) ? ({a}) : ({b})"),
        Opcode::LogicalAndReduce => format!("({a}) && ({b})"),
        Opcode::LogicalOrReduce => format!("({a}) || ({b})"),
        Opcode::LogicalXorReduce => format!("(({a}) != 0) != (({b}) != 0)"),
        _ => unreachable!("{opcode:?} is not a sweep"),
    }
}

fn map_expr(opcode: Opcode, from: DType, to: DType, x: &str) -> String {
    match opcode {
        Opcode::Identity => cast_expr(from, to, x),
        Opcode::Negative => format!("-({x})"),
        Opcode::Absolute => {
            if from.is_float() {
                format!("{}({x})", math_fn("fabs", from))
            } else if from.is_signed() {
                format!("({x}) < 0 ? -({x}) : ({x})")
            } else {
                x.to_string()
            }
        }
        Opcode::Invert => {
            if from == DType::Bool {
                format!("!({x})")
            } else {
                format!("~({x})")
            }
        }
        Opcode::LogicalNot => format!("!({x})"),
        Opcode::Sqrt => format!("{}({x})", math_fn("sqrt", from)),
        Opcode::Exp => format!("{}({x})", math_fn("exp", from)),
        Opcode::Log => format!("{}({x})", math_fn("log", from)),
        Opcode::Sin => format!("{}({x})", math_fn("sin", from)),
        Opcode::Cos => format!("{}({x})", math_fn("cos", from)),
        Opcode::Floor => format!("{}({x})", math_fn("floor", from)),
        Opcode::Ceil => format!("{}({x})", math_fn("ceil", from)),
        _ => unreachable!("{opcode:?} is not a map"),
    }
}

fn zip_expr(opcode: Opcode, dtype: DType, a: &str, b: &str) -> String {
    match opcode {
        Opcode::Add => format!("({a}) + ({b})"),
        Opcode::Subtract => format!("({a}) - ({b})"),
        Opcode::Multiply => format!("({a}) * ({b})"),
        Opcode::Divide => format!("({a}) / ({b})"),
        Opcode::Mod => {
            if dtype.is_float() {
                format!("{}({a}, {b})", math_fn("fmod", dtype))
            } else {
                format!("({a}) % ({b})")
            }
        }
        Opcode::Power => format!("{}({a}, {b})", math_fn("pow", dtype)),
        Opcode::Maximum => format!("({a}) > ({b}) ? ({a}) : ({b})"),
        Opcode::Minimum => format!("({a}) < ({b}) ? ({a}) : ({b})"),
        Opcode::BitwiseAnd => format!("({a}) & ({b})"),
        Opcode::BitwiseOr => format!("({a}) | ({b})"),
        Opcode::BitwiseXor => format!("({a}) ^ ({b})"),
        Opcode::LeftShift => format!("({a}) << ({b})"),
        Opcode::RightShift => format!("({a}) >> ({b})"),
        Opcode::LogicalAnd => format!("({a}) && ({b})"),
        Opcode::LogicalOr => format!("({a}) || ({b})"),
        Opcode::LogicalXor => format!("(({a}) != 0) != (({b}) != 0)"),
        Opcode::Equal => format!("(uint8_t)(({a}) == ({b}))"),
        Opcode::NotEqual => format!("(uint8_t)(({a}) != ({b}))"),
        Opcode::Less => format!("(uint8_t)(({a}) < ({b}))"),
        Opcode::LessEqual => format!("(uint8_t)(({a}) <= ({b}))"),
        Opcode::Greater => format!("(uint8_t)(({a}) > ({b}))"),
        Opcode::GreaterEqual => format!("(uint8_t)(({a}) >= ({b}))"),
        _ => unreachable!("{opcode:?} is not a zip"),
    }
}

/// Flat row-major index expression over `shape` from the loop indexes.
fn flat_index(shape: &[i64]) -> String {
    let mut expr = String::from("i0");
    for (r, &d) in shape.iter().enumerate().skip(1) {
        expr = format!("({expr}) * {d} + i{r}");
    }
    expr
}

impl<'a> Walker<'a> {
    /// Operands of the tac accessed through flat base indexing rather than
    /// a cursor: gather data and scatter targets.
    fn flat_operand(&self, tac_idx: usize, slot: usize) -> bool {
        let tac = &self.tree.tacs[tac_idx];
        matches!(
            (tac.kind, slot),
            (TacKind::Gather, 1) | (TacKind::Scatter, 0)
        )
    }

    /// Read access for operand `id` of tac `tac_idx` at leaf depth.
    fn access(&self, tac_idx: usize, slot: usize) -> String {
        let id = self.tab.tac_ids[tac_idx][slot].unwrap();
        let op = &self.tab.operands[id];
        match op.layout {
            Layout::ScalarConst => format!("c{id}"),
            Layout::ScalarTemp | Layout::Contractable => format!("t{id}"),
            Layout::Scalar => format!("(*p{id})"),
            Layout::Contiguous | Layout::Consecutive | Layout::Strided => {
                if self.flat_operand(tac_idx, slot) {
                    // Base pointer; the caller appends the index.
                    format!("p{id}")
                } else {
                    format!("(*w{id}_{})", op.view.ndim() - 1)
                }
            }
            Layout::Sparse => format!("p{id}"),
        }
    }

    /// Lvalue for the output operand of a tac, at an arbitrary depth
    /// (`None` means the leaf depth of the view).
    fn out_lvalue(&self, tac_idx: usize, depth: Option<usize>) -> String {
        let id = self.tab.tac_ids[tac_idx][0].unwrap();
        let op = &self.tab.operands[id];
        match op.layout {
            Layout::ScalarTemp | Layout::Contractable => format!("t{id}"),
            Layout::Scalar => format!("(*p{id})"),
            Layout::ScalarConst | Layout::Sparse => format!("(*p{id})"),
            _ => match depth {
                Some(d) => format!("(*w{id}_{d})"),
                None => format!("(*w{id}_{})", op.view.ndim() - 1),
            },
        }
    }

    fn emit_leaf(&mut self, t: usize) -> Result<(), SmeltError> {
        let tac = &self.tree.tacs[t];
        let indent = self.indent.clone();
        match tac.kind {
            TacKind::Map => {
                let x = self.access(t, 1);
                let from = tac.in1.as_ref().unwrap().dtype;
                let to = tac.out.dtype;
                let lhs = self.out_lvalue(t, None);
                let rhs = map_expr(tac.opcode, from, to, &x);
                _ = writeln!(self.src, "{indent}{lhs} = {rhs};");
            }
            TacKind::Zip => {
                let a = self.access(t, 1);
                let b = self.access(t, 2);
                let lhs = self.out_lvalue(t, None);
                let rhs = zip_expr(tac.opcode, tac.in1.as_ref().unwrap().dtype, &a, &b);
                _ = writeln!(self.src, "{indent}{lhs} = {rhs};");
            }
            TacKind::Reduce => {
                let sweep = tac.sweep.unwrap();
                let x = self.access(t, 1);
                if sweep + 1 == tac.ndim() {
                    // Inner-axis sweep: scalar accumulator.
                    let rhs = combine(tac.opcode, &format!("acc{t}"), &x);
                    _ = writeln!(self.src, "{indent}acc{t} = {rhs};");
                } else {
                    // Partial-axis sweep: guarded in-memory accumulation.
                    let lhs = self.out_lvalue(t, None);
                    let init = neutral(tac.opcode, tac.out.dtype)?;
                    let rhs = combine(tac.opcode, &lhs, &x);
                    _ = writeln!(self.src, "{indent}if (i{sweep} == 0) {lhs} = {init};");
                    _ = writeln!(self.src, "{indent}{lhs} = {rhs};");
                }
            }
            TacKind::Scan => {
                let sweep = tac.sweep.unwrap();
                let x = self.access(t, 1);
                let lhs = self.out_lvalue(t, None);
                if sweep + 1 == tac.ndim() {
                    let rhs = combine(tac.opcode, &format!("acc{t}"), &x);
                    _ = writeln!(self.src, "{indent}acc{t} = {rhs};");
                    _ = writeln!(self.src, "{indent}{lhs} = acc{t};");
                } else {
                    let out_id = self.tab.tac_ids[t][0].unwrap();
                    let prev = format!("(*(w{out_id}_{} - s{out_id}[{sweep}]))", tac.ndim() - 1);
                    let rhs = combine(tac.opcode, &prev, &x);
                    _ = writeln!(
                        self.src,
                        "{indent}{lhs} = (i{sweep} == 0) ? ({x}) : ({rhs});"
                    );
                }
            }
            TacKind::Gather => {
                let data = self.access(t, 1);
                let idx = self.access(t, 2);
                let lhs = self.out_lvalue(t, None);
                _ = writeln!(self.src, "{indent}{lhs} = {data}[(int64_t){idx}];");
            }
            TacKind::Scatter => {
                let out_id = self.tab.tac_ids[t][0].unwrap();
                let value = self.access(t, 1);
                let idx = self.access(t, 2);
                _ = writeln!(self.src, "{indent}p{out_id}[(int64_t){idx}] = {value};");
            }
            TacKind::Generate => {
                let lhs = self.out_lvalue(t, None);
                let flat = flat_index(&tac.out.shape);
                match tac.opcode {
                    Opcode::Random => {
                        let seed = self.tab.tac_ids[t][1].unwrap();
                        _ = writeln!(
                            self.src,
                            "{indent}{lhs} = smelt_philox(c{seed}.start + ({flat}), c{seed}.key);"
                        );
                    }
                    Opcode::Range => {
                        _ = writeln!(self.src, "{indent}{lhs} = ({})({flat});", tac.out.dtype.c99());
                    }
                    _ => unreachable!(),
                }
            }
        }
        Ok(())
    }

    /// Operand ids that need a cursor at a loop of rank `rank`.
    fn cursor_ids(&self, l: &LoopB, rank: usize) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut stack: Vec<&Block> = l.blocks.iter().collect();
        while let Some(b) = stack.pop() {
            match b {
                Block::Leaf(t) => {
                    for (slot, id) in self.tab.tac_ids[*t].iter().enumerate() {
                        let Some(id) = id else { continue };
                        let op = &self.tab.operands[*id];
                        if op.layout.is_materialised()
                            && op.layout != Layout::Scalar
                            && !self.flat_operand(*t, slot)
                            && op.view.ndim() > rank
                            && !ids.contains(id)
                        {
                            ids.push(*id);
                        }
                    }
                }
                Block::Loop(l) => {
                    for c in &l.blocks {
                        stack.push(c);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids
    }

    /// True when operand `id` is written by some tac in the tree.
    fn written(&self, id: usize) -> bool {
        self.tab.tac_ids.iter().any(|ids| ids[0] == Some(id))
    }

    fn emit_loop(&mut self, l: &LoopB) -> Result<(), SmeltError> {
        let r = l.rank;
        // Scalar accumulators for inner-axis sweeps of this loop.
        for &t in &l.sweeps {
            let tac = &self.tree.tacs[t];
            if tac.sweep.unwrap() + 1 == tac.ndim() {
                let dtype = tac.out.dtype;
                let init = neutral(tac.opcode, dtype)?;
                _ = writeln!(self.src, "{}{} acc{t} = {init};", self.indent, dtype.c99());
            }
        }
        if l.parallel && self.opts.openmp {
            _ = writeln!(self.src, "{}#pragma omp parallel for", self.indent);
        }
        _ = writeln!(
            self.src,
            "{}for (int64_t i{r} = 0; i{r} < {}; ++i{r}) {{",
            self.indent, l.size
        );
        self.indent.push_str("    ");
        // Cursor per operand and axis: step by the stride of this rank.
        for id in self.cursor_ids(l, r) {
            let op = &self.tab.operands[id];
            let ty = op.view.dtype.c99();
            let parent = if r == 0 { format!("p{id}") } else { format!("w{id}_{}", r - 1) };
            let konst = if self.written(id) { "" } else { "const " };
            _ = writeln!(
                self.src,
                "{}{konst}{ty} *w{id}_{r} = {parent} + i{r} * s{id}[{r}];",
                self.indent
            );
        }
        for b in &l.blocks {
            self.emit_block(b)?;
        }
        self.indent.truncate(self.indent.len() - 4);
        _ = writeln!(self.src, "{}}}", self.indent);
        // Write scalar accumulators back.
        for &t in &l.sweeps {
            let tac = &self.tree.tacs[t];
            if tac.kind == TacKind::Reduce && tac.sweep.unwrap() + 1 == tac.ndim() {
                let lhs = if r == 0 {
                    self.out_lvalue_outer(t)
                } else {
                    self.out_lvalue(t, Some(r - 1))
                };
                _ = writeln!(self.src, "{}{lhs} = acc{t};", self.indent);
            }
        }
        Ok(())
    }

    /// Output lvalue for a sweep whose loop is the outermost rank: no
    /// cursor exists yet, the base pointer itself addresses the element.
    fn out_lvalue_outer(&self, tac_idx: usize) -> String {
        let id = self.tab.tac_ids[tac_idx][0].unwrap();
        match self.tab.operands[id].layout {
            Layout::ScalarTemp | Layout::Contractable => format!("t{id}"),
            _ => format!("(*p{id})"),
        }
    }

    fn emit_block(&mut self, b: &Block) -> Result<(), SmeltError> {
        match b {
            Block::Leaf(t) => self.emit_leaf(*t),
            Block::Loop(l) => self.emit_loop(l),
        }
    }

    /// COLLAPSIBLE specialisation: the whole iteration space is one flat
    /// `work_offset` loop; each operand steps by its innermost stride.
    fn emit_collapsed(&mut self, l: &LoopB) -> Result<(), SmeltError> {
        if l.parallel && self.opts.openmp {
            _ = writeln!(self.src, "{}#pragma omp parallel for", self.indent);
        }
        _ = writeln!(
            self.src,
            "{}for (int64_t work_offset = 0; work_offset < {}; ++work_offset) {{",
            self.indent, l.size
        );
        self.indent.push_str("    ");
        let tab = self.tab;
        let tree = self.tree;
        for b in &l.blocks {
            let Block::Leaf(t) = b else { unreachable!() };
            let tac = &tree.tacs[*t];
            let access = |slot: usize| -> String {
                let id = tab.tac_ids[*t][slot].unwrap();
                let op = &tab.operands[id];
                match op.layout {
                    Layout::ScalarConst => format!("c{id}"),
                    Layout::ScalarTemp | Layout::Contractable => format!("t{id}"),
                    Layout::Scalar => format!("(*p{id})"),
                    Layout::Contiguous => format!("p{id}[work_offset]"),
                    _ => format!("p{id}[work_offset * s{id}[0]]"),
                }
            };
            let indent = self.indent.clone();
            match tac.kind {
                TacKind::Map => {
                    let rhs = map_expr(
                        tac.opcode,
                        tac.in1.as_ref().unwrap().dtype,
                        tac.out.dtype,
                        &access(1),
                    );
                    _ = writeln!(self.src, "{indent}{} = {rhs};", access(0));
                }
                TacKind::Zip => {
                    let rhs =
                        zip_expr(tac.opcode, tac.in1.as_ref().unwrap().dtype, &access(1), &access(2));
                    _ = writeln!(self.src, "{indent}{} = {rhs};", access(0));
                }
                TacKind::Generate => match tac.opcode {
                    Opcode::Random => {
                        let seed = tab.tac_ids[*t][1].unwrap();
                        _ = writeln!(
                            self.src,
                            "{indent}{} = smelt_philox(c{seed}.start + work_offset, c{seed}.key);",
                            access(0)
                        );
                    }
                    Opcode::Range => {
                        _ = writeln!(
                            self.src,
                            "{indent}{} = ({})work_offset;",
                            access(0),
                            tac.out.dtype.c99()
                        );
                    }
                    _ => unreachable!(),
                },
                _ => {
                    return Err(SmeltError::internal(
                        "sweep or index tac in a collapsed iteration space",
                    ))
                }
            }
        }
        self.indent.truncate(self.indent.len() - 4);
        _ = writeln!(self.src, "{}}}", self.indent);
        Ok(())
    }
}

/// Argument unpacking per operand layout.
fn unpack(tab: &SymbolTable) -> Result<String, SmeltError> {
    let mut src = String::new();
    for (id, op) in tab.operands.iter().enumerate() {
        let ty = op.view.dtype.c99();
        match op.layout {
            Layout::ScalarConst => {
                _ = writeln!(src, "    const {ty} c{id} = *(const {ty} *)opnds[{id}]->data;");
            }
            Layout::ScalarTemp | Layout::Contractable => {
                _ = writeln!(src, "    {ty} t{id};");
            }
            Layout::Scalar => {
                _ = writeln!(
                    src,
                    "    {ty} *p{id} = ({ty} *)opnds[{id}]->data + opnds[{id}]->start;"
                );
            }
            Layout::Contiguous | Layout::Consecutive | Layout::Strided => {
                let restrict = if tab.base_refcount_one(id) { "restrict " } else { "" };
                _ = writeln!(
                    src,
                    "    {ty} *{restrict}p{id} = ({ty} *)opnds[{id}]->data + opnds[{id}]->start;"
                );
                _ = writeln!(src, "    const int64_t *s{id} = opnds[{id}]->stride;");
            }
            Layout::Sparse => {
                // Unsupported layout: fail compilation loudly.
                _ = writeln!(src, "#error \"SPARSE operand layout is not supported\"");
            }
        }
    }
    Ok(src)
}

/// Generate the kernel source for a transformed tree. The caller guarantees
/// the tree holds at least one array operation and no extension opcodes.
pub fn generate(
    tree: &BlockTree,
    tab: &SymbolTable,
    ispace: &IterSpace,
    symbol: &str,
    entry: &str,
    opts: Options,
) -> Result<String, SmeltError> {
    if tree.tacs.is_empty() {
        return Err(SmeltError::internal("codegen on a kernel without array operations"));
    }
    let plaid = Plaid::new();
    let mut walker = Walker { tree, tab, opts, src: String::new(), indent: "    ".to_string() };
    if ispace.layout == IterLayout::Collapsible {
        for root in &tree.roots {
            let Block::Loop(l) = root else { unreachable!() };
            walker.emit_collapsed(l)?;
        }
    } else {
        for root in &tree.roots {
            walker.emit_block(root)?;
        }
    }
    let needs_philox = tree.tacs.iter().any(|t| t.opcode == Opcode::Random);
    let preamble = plaid.fill(
        "preamble",
        &[
            ("SYMBOL", symbol),
            ("MAX_DIM", &crate::view::MAX_DIM.to_string()),
            ("PHILOX", if needs_philox { TPL_PHILOX } else { "" }),
        ],
    );
    let body = walker.src;
    let unpacked = unpack(tab)?;
    Ok(plaid.fill(
        "kernel",
        &[
            ("PREAMBLE", &preamble),
            ("ENTRY", entry),
            ("UNPACK", &unpacked),
            ("BODY", &body),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Base, BaseId};
    use crate::block::{collapse_redundant_axes, push_reductions_inwards, BlockTree};
    use crate::dtype::Constant;
    use crate::instr::Instruction;
    use crate::slab::Slab;
    use crate::symtab::symbol_hash;
    use crate::tac::lower;
    use crate::view::View;

    fn arena(n: usize, nelem: i64) -> Slab<BaseId, Base> {
        let mut bases = Slab::new();
        for _ in 0..n {
            bases.push(Base::new(DType::F32, nelem));
        }
        bases
    }

    fn gen(tree: &BlockTree, bases: &Slab<BaseId, Base>) -> String {
        let tab = SymbolTable::from_tree(tree, bases);
        let ispace = tab.iterspace(tree);
        let symbol = tab.symbolize(tree).unwrap();
        let entry = format!("krn_{:016x}", symbol_hash(&symbol));
        generate(tree, &tab, &ispace, &symbol, &entry, Options::default()).unwrap()
    }

    #[test]
    fn collapsed_elementwise_uses_work_offset() {
        let add = Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(BaseId(2), DType::F32, &[4, 4]),
                View::contiguous(BaseId(0), DType::F32, &[4, 4]),
                View::contiguous(BaseId(1), DType::F32, &[4, 4]),
            ],
        );
        let tree = BlockTree::compose(vec![lower(&add, 0).unwrap()]).unwrap();
        let tree = collapse_redundant_axes(&tree).unwrap();
        let src = gen(&tree, &arena(3, 16));
        assert!(src.contains("work_offset < 16"));
        assert!(src.contains("p0[work_offset]"));
    }

    #[test]
    fn inner_sweep_uses_scalar_accumulator() {
        let red = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(BaseId(1), DType::F32, &[8]),
                View::contiguous(BaseId(0), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(0)),
            ],
        );
        let tree = BlockTree::compose(vec![lower(&red, 0).unwrap()]).unwrap();
        let tree = push_reductions_inwards(&tree).unwrap();
        let mut bases = arena(1, 64);
        bases.push(Base::new(DType::F32, 8));
        let src = gen(&tree, &bases);
        assert!(src.contains("acc0 = acc0 +"), "{src}");
        assert!(src.contains("float acc0 = 0;"), "{src}");
    }

    #[test]
    fn partial_sweep_uses_guarded_accumulation() {
        let red = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(BaseId(1), DType::F32, &[8]),
                View::contiguous(BaseId(0), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(0)),
            ],
        );
        let tree = BlockTree::compose(vec![lower(&red, 0).unwrap()]).unwrap();
        let mut bases = arena(1, 64);
        bases.push(Base::new(DType::F32, 8));
        let src = gen(&tree, &bases);
        assert!(src.contains("if (i0 == 0)"), "{src}");
    }

    #[test]
    fn sparse_layout_fails_loudly() {
        let add = Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(BaseId(2), DType::F32, &[4]),
                View::contiguous(BaseId(0), DType::F32, &[4]),
                View::contiguous(BaseId(1), DType::F32, &[4]),
            ],
        );
        let tree = BlockTree::compose(vec![lower(&add, 0).unwrap()]).unwrap();
        let bases = arena(3, 4);
        let mut tab = SymbolTable::from_tree(&tree, &bases);
        tab.operands[1].layout = crate::symtab::Layout::Sparse;
        let ispace = tab.iterspace(&tree);
        let src = generate(&tree, &tab, &ispace, "sym", "krn_x", Options::default()).unwrap();
        assert!(src.contains("#error"));
    }

    #[test]
    fn templates_fill_placeholders() {
        let plaid = Plaid::new();
        let out = plaid.fill("kernel", &[("PREAMBLE", "//p"), ("ENTRY", "krn_1"), ("UNPACK", ""), ("BODY", "")]);
        assert!(out.contains("void krn_1("));
        assert!(!out.contains("{{"));
    }
}
