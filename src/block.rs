//! The loop-nest block tree and its transformation passes.
//!
//! Leaves are tacs, internal nodes are loops. Every child at rank `r` sits
//! under a parent with rank `r - 1`; a loop's `sweeps` lists the reduction
//! and scan tacs in its subtree whose swept axis equals the loop's rank.
//! All passes take the tree by reference and return a fresh tree.

use crate::error::SmeltError;
use crate::tac::Tac;

#[derive(Debug, Clone)]
pub enum Block {
    Leaf(usize),
    Loop(LoopB),
}

impl Block {
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Block::Leaf(_))
    }

    #[must_use]
    pub fn as_loop(&self) -> Option<&LoopB> {
        match self {
            Block::Loop(l) => Some(l),
            Block::Leaf(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopB {
    pub rank: usize,
    pub size: i64,
    pub blocks: Vec<Block>,
    pub sweeps: Vec<usize>,
    /// Set by the threading split; codegen parallelises this loop.
    pub parallel: bool,
}

#[derive(Debug, Clone)]
pub struct BlockTree {
    pub tacs: Vec<Tac>,
    pub roots: Vec<Block>,
}

/// Nest `idxs` (tac indexes in submission order, all sharing the extent at
/// `rank`) into a loop. Tacs whose rank ends here become leaves; runs of
/// deeper tacs recurse.
fn create_nested_block(tacs: &[Tac], idxs: &[usize], rank: usize) -> Result<Block, SmeltError> {
    debug_assert!(!idxs.is_empty());
    let size = tacs[idxs[0]].shape_at(rank);
    for &t in idxs {
        if tacs[t].shape_at(rank) != size {
            return Err(SmeltError::internal(format!(
                "mismatched extents at rank {rank}: {} vs {size}",
                tacs[t].shape_at(rank)
            )));
        }
    }
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < idxs.len() {
        let t = idxs[i];
        if tacs[t].ndim() == rank + 1 {
            blocks.push(Block::Leaf(t));
            i += 1;
        } else {
            let inner_size = tacs[t].shape_at(rank + 1);
            let mut j = i + 1;
            while j < idxs.len()
                && tacs[idxs[j]].ndim() > rank + 1
                && tacs[idxs[j]].shape_at(rank + 1) == inner_size
            {
                j += 1;
            }
            blocks.push(create_nested_block(tacs, &idxs[i..j], rank + 1)?);
            i = j;
        }
    }
    Ok(Block::Loop(LoopB { rank, size, blocks, sweeps: Vec::new(), parallel: false }))
}

fn leaf_idxs(block: &Block, out: &mut Vec<usize>) {
    match block {
        Block::Leaf(t) => out.push(*t),
        Block::Loop(l) => {
            for b in &l.blocks {
                leaf_idxs(b, out);
            }
        }
    }
}

fn update_sweeps(block: &mut Block, tacs: &[Tac]) {
    if let Block::Loop(l) = block {
        let mut contained = Vec::new();
        for b in &l.blocks {
            leaf_idxs(b, &mut contained);
        }
        l.sweeps = contained.iter().copied().filter(|&t| tacs[t].sweep == Some(l.rank)).collect();
        for b in &mut l.blocks {
            update_sweeps(b, tacs);
        }
    }
}

impl BlockTree {
    /// Build the tree for a list of lowered tacs (submission order).
    pub fn compose(tacs: Vec<Tac>) -> Result<BlockTree, SmeltError> {
        if tacs.is_empty() {
            return Err(SmeltError::internal("composing an empty kernel"));
        }
        let idxs: Vec<usize> = (0..tacs.len()).collect();
        let mut root = create_nested_block(&tacs, &idxs, 0)?;
        update_sweeps(&mut root, &tacs);
        let tree = BlockTree { tacs, roots: vec![root] };
        tree.validation()?;
        Ok(tree)
    }

    fn metadata_update(&mut self) {
        let tacs = std::mem::take(&mut self.tacs);
        for root in &mut self.roots {
            update_sweeps(root, &tacs);
        }
        self.tacs = tacs;
    }

    /// Check the tree invariants: child ranks are consecutive, sweep axes
    /// match loop ranks, loop sizes are non-negative and agree with the tac
    /// extents, and no block list is empty.
    pub fn validation(&self) -> Result<(), SmeltError> {
        fn check(block: &Block, tacs: &[Tac], expected_rank: usize) -> Result<(), SmeltError> {
            match block {
                Block::Leaf(t) => {
                    if tacs[*t].ndim() != expected_rank {
                        return Err(SmeltError::internal(format!(
                            "leaf tac of rank {} at depth {expected_rank}",
                            tacs[*t].ndim()
                        )));
                    }
                }
                Block::Loop(l) => {
                    if l.rank + 1 != expected_rank {
                        return Err(SmeltError::internal(format!(
                            "loop of rank {} under rank {}",
                            l.rank,
                            expected_rank - 1
                        )));
                    }
                    if l.size < 0 {
                        return Err(SmeltError::internal("negative loop size"));
                    }
                    if l.blocks.is_empty() {
                        return Err(SmeltError::internal("empty block list"));
                    }
                    let mut contained = Vec::new();
                    for b in &l.blocks {
                        leaf_idxs(b, &mut contained);
                    }
                    for &t in &contained {
                        if tacs[t].shape_at(l.rank) != l.size {
                            return Err(SmeltError::internal(format!(
                                "tac extent {} does not match loop size {}",
                                tacs[t].shape_at(l.rank),
                                l.size
                            )));
                        }
                    }
                    for &t in &l.sweeps {
                        if tacs[t].sweep != Some(l.rank) {
                            return Err(SmeltError::internal("sweep axis does not match loop rank"));
                        }
                    }
                    for b in &l.blocks {
                        check(b, tacs, l.rank + 2)?;
                    }
                }
            }
            Ok(())
        }
        for root in &self.roots {
            check(root, &self.tacs, 1)?;
        }
        Ok(())
    }
}

/// For each sweep of `parent`, look for a child sub-loop holding the sweep
/// tac as a direct leaf. First match wins.
fn find_swappable_sub_block(parent: &LoopB, _tacs: &[Tac]) -> Option<usize> {
    for &sweep in &parent.sweeps {
        for (i, b) in parent.blocks.iter().enumerate() {
            if let Block::Loop(child) = b {
                if child.blocks.iter().any(|ib| matches!(ib, Block::Leaf(t) if *t == sweep)) {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// Swap `parent`'s rank with the rank of the child loop at `child_idx`.
/// Siblings of the chosen child are re-wrapped in their own copies of the
/// parent loop, so one loop may come back as several.
fn swap_blocks(
    parent: &LoopB,
    child_idx: usize,
    tacs: &mut Vec<Tac>,
) -> Result<Vec<Block>, SmeltError> {
    let mut ret = Vec::new();
    for (i, b) in parent.blocks.iter().enumerate() {
        if i == child_idx {
            let Block::Loop(child) = b else { unreachable!() };
            let mut idxs = Vec::new();
            leaf_idxs(b, &mut idxs);
            for &t in &idxs {
                tacs[t].transpose(parent.rank, child.rank);
            }
            let inner = create_nested_block(tacs, &idxs, child.rank)?;
            ret.push(Block::Loop(LoopB {
                rank: parent.rank,
                size: child.size,
                blocks: vec![inner],
                sweeps: Vec::new(),
                parallel: false,
            }));
        } else {
            ret.push(Block::Loop(LoopB {
                rank: parent.rank,
                size: parent.size,
                blocks: vec![b.clone()],
                sweeps: Vec::new(),
                parallel: false,
            }));
        }
    }
    Ok(ret)
}

fn push_reductions_rec(blocks: Vec<Block>, tacs: &mut Vec<Tac>) -> Result<Vec<Block>, SmeltError> {
    // Bottom-up: transform children first.
    let mut blocks2 = Vec::with_capacity(blocks.len());
    for b in blocks {
        match b {
            Block::Loop(mut l) => {
                l.blocks = push_reductions_rec(l.blocks, tacs)?;
                blocks2.push(Block::Loop(l));
            }
            leaf => blocks2.push(leaf),
        }
    }
    let mut ret = Vec::new();
    for b in blocks2 {
        match &b {
            Block::Loop(l) => {
                if let Some(child_idx) = find_swappable_sub_block(l, tacs) {
                    ret.extend(swap_blocks(l, child_idx, tacs)?);
                } else {
                    ret.push(b);
                }
            }
            Block::Leaf(_) => ret.push(b),
        }
    }
    Ok(ret)
}

/// Move reduction axes deeper in the nest so the hot inner dimension is
/// free of cross-iteration dependencies.
pub fn push_reductions_inwards(tree: &BlockTree) -> Result<BlockTree, SmeltError> {
    let mut tacs = tree.tacs.clone();
    let roots = push_reductions_rec(tree.roots.clone(), &mut tacs)?;
    let mut out = BlockTree { tacs, roots };
    out.metadata_update();
    out.validation()?;
    Ok(out)
}

/// Parallelism already available in a loop: the product of sizes along the
/// chain of sweep-free single-child loops starting at it.
fn threading_amount(l: &LoopB) -> u64 {
    if !l.sweeps.is_empty() {
        return 1;
    }
    let inner = if l.blocks.len() == 1 {
        match &l.blocks[0] {
            Block::Loop(c) if c.sweeps.is_empty() => threading_amount(c),
            _ => 1,
        }
    } else {
        1
    };
    l.size.max(0) as u64 * inner
}

fn max_out_nelements(l: &LoopB, tacs: &[Tac]) -> u64 {
    let mut idxs = Vec::new();
    for b in &l.blocks {
        leaf_idxs(b, &mut idxs);
    }
    idxs.iter().map(|&t| tacs[t].out.nelements().max(0) as u64).max().unwrap_or(0)
}

/// Partition each unsweeped loop that is worth threading into sibling
/// groups: consecutive unthreadable children (leaves and sweeped loops)
/// share a serial group, every threadable child gets a group of its own.
pub fn split_for_threading(
    tree: &BlockTree,
    min_threading: u64,
    cur_threading: u64,
) -> Result<BlockTree, SmeltError> {
    let mut ret = Vec::new();
    for block in &tree.roots {
        let Block::Loop(l) = block else {
            ret.push(block.clone());
            continue;
        };
        if !l.sweeps.is_empty() {
            ret.push(block.clone());
            continue;
        }
        let unthreadable =
            |b: &Block| b.is_leaf() || b.as_loop().is_some_and(|c| !c.sweeps.is_empty());
        let goal = min_threading.saturating_sub(cur_threading);
        if l.blocks.len() > 1
            && max_out_nelements(l, &tree.tacs) > min_threading
            && threading_amount(l) < goal
        {
            let mut it = l.blocks.iter().peekable();
            while it.peek().is_some() {
                // Serial group: maximal run of unthreadable children.
                let mut serial = Vec::new();
                while let Some(b) = it.peek() {
                    if unthreadable(b) {
                        serial.push((*b).clone());
                        it.next();
                    } else {
                        break;
                    }
                }
                if !serial.is_empty() {
                    ret.push(Block::Loop(LoopB {
                        rank: l.rank,
                        size: l.size,
                        blocks: serial,
                        sweeps: Vec::new(),
                        parallel: false,
                    }));
                }
                // Threadable child in a group of its own.
                if let Some(b) = it.next() {
                    ret.push(Block::Loop(LoopB {
                        rank: l.rank,
                        size: l.size,
                        blocks: vec![b.clone()],
                        sweeps: Vec::new(),
                        parallel: true,
                    }));
                }
            }
        } else {
            let mut kept = block.clone();
            if let Block::Loop(kl) = &mut kept {
                kl.parallel = kl.sweeps.is_empty() && threading_amount(kl) >= goal.max(1);
            }
            ret.push(kept);
        }
    }
    let mut out = BlockTree { tacs: tree.tacs.clone(), roots: ret };
    out.metadata_update();
    out.validation()?;
    Ok(out)
}

/// Collapse a sweep-free loop with its single sweep-free child loop: the
/// parent absorbs the child's blocks, sizes multiply, and the merged axis
/// is removed from every contained tac. The collapse is abandoned for a
/// loop when any contained operand is not physically consistent with the
/// merge.
fn collapse_loop_with_child(l: &LoopB, tacs: &mut Vec<Tac>) -> Option<LoopB> {
    if !l.sweeps.is_empty() || l.blocks.len() != 1 {
        return None;
    }
    let Block::Loop(child) = &l.blocks[0] else {
        return None;
    };
    if !child.sweeps.is_empty() {
        return None;
    }
    let mut idxs = Vec::new();
    leaf_idxs(&l.blocks[0], &mut idxs);
    // Check before mutating anything; the collapse is all-or-nothing.
    for &t in &idxs {
        let mut tmp = tacs[t].clone();
        if !tmp.collapse_axes(l.rank) {
            return None;
        }
    }
    for &t in &idxs {
        let ok = tacs[t].collapse_axes(l.rank);
        debug_assert!(ok);
    }
    fn dec_ranks(b: &mut Block) {
        if let Block::Loop(l) = b {
            l.rank -= 1;
            for c in &mut l.blocks {
                dec_ranks(c);
            }
        }
    }
    let mut blocks = child.blocks.clone();
    for b in &mut blocks {
        dec_ranks(b);
    }
    Some(LoopB {
        rank: l.rank,
        size: l.size * child.size,
        blocks,
        sweeps: Vec::new(),
        parallel: l.parallel,
    })
}

fn collapse_rec(blocks: &[Block], tacs: &mut Vec<Tac>) -> Vec<Block> {
    // Bottom-up.
    let mut blocks2 = Vec::with_capacity(blocks.len());
    for b in blocks {
        match b {
            Block::Loop(l) => {
                let mut l = l.clone();
                l.blocks = collapse_rec(&l.blocks, tacs);
                blocks2.push(Block::Loop(l));
            }
            Block::Leaf(t) => blocks2.push(Block::Leaf(*t)),
        }
    }
    let mut ret = Vec::with_capacity(blocks2.len());
    for b in blocks2 {
        match &b {
            Block::Loop(l) => {
                if let Some(collapsed) = collapse_loop_with_child(l, tacs) {
                    ret.push(Block::Loop(collapsed));
                } else {
                    ret.push(b);
                }
            }
            Block::Leaf(_) => ret.push(b),
        }
    }
    ret
}

/// Merge single-child sweep-free loop pairs bottom-up.
pub fn collapse_redundant_axes(tree: &BlockTree) -> Result<BlockTree, SmeltError> {
    let mut tacs = tree.tacs.clone();
    let roots = collapse_rec(&tree.roots, &mut tacs);
    let mut out = BlockTree { tacs, roots };
    out.metadata_update();
    out.validation()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseId;
    use crate::dtype::{Constant, DType};
    use crate::instr::{Instruction, Opcode};
    use crate::tac::lower;
    use crate::view::View;

    fn elementwise_tree(shape: &[i64]) -> BlockTree {
        let add = Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(BaseId(0), DType::F32, shape),
                View::contiguous(BaseId(1), DType::F32, shape),
                View::contiguous(BaseId(2), DType::F32, shape),
            ],
        );
        BlockTree::compose(vec![lower(&add, 0).unwrap()]).unwrap()
    }

    fn reduce_tree(axis: i64) -> BlockTree {
        let add = Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(BaseId(2), DType::F32, &[8, 8]),
                View::contiguous(BaseId(0), DType::F32, &[8, 8]),
                View::contiguous(BaseId(1), DType::F32, &[8, 8]),
            ],
        );
        let red = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(BaseId(3), DType::F32, &[8]),
                View::contiguous(BaseId(2), DType::F32, &[8, 8]),
                View::scalar(Constant::I64(axis)),
            ],
        );
        BlockTree::compose(vec![lower(&add, 0).unwrap(), lower(&red, 1).unwrap()]).unwrap()
    }

    #[test]
    fn compose_nests_by_rank() {
        let tree = elementwise_tree(&[2, 3, 4]);
        let Block::Loop(root) = &tree.roots[0] else { panic!() };
        assert_eq!(root.rank, 0);
        assert_eq!(root.size, 2);
        let Block::Loop(l1) = &root.blocks[0] else { panic!() };
        assert_eq!((l1.rank, l1.size), (1, 3));
        let Block::Loop(l2) = &l1.blocks[0] else { panic!() };
        assert_eq!((l2.rank, l2.size), (2, 4));
        assert!(matches!(l2.blocks[0], Block::Leaf(0)));
        tree.validation().unwrap();
    }

    #[test]
    fn sweeps_attach_to_their_rank() {
        let tree = reduce_tree(0);
        let Block::Loop(root) = &tree.roots[0] else { panic!() };
        assert_eq!(root.sweeps, [1]);
        let Block::Loop(inner) = &root.blocks[0] else { panic!() };
        assert!(inner.sweeps.is_empty());
    }

    #[test]
    fn push_reductions_moves_sweep_inward() {
        let tree = reduce_tree(0);
        let pushed = push_reductions_inwards(&tree).unwrap();
        pushed.validation().unwrap();
        // The sweep axis must now be the inner rank of its loop chain.
        for root in &pushed.roots {
            let Block::Loop(l) = root else { panic!() };
            assert!(l.sweeps.is_empty(), "sweep still at the outermost rank");
        }
        // The reduce tac itself got transposed.
        let red = pushed.tacs.iter().find(|t| t.opcode == Opcode::AddReduce).unwrap();
        assert_eq!(red.sweep, Some(1));
    }

    #[test]
    fn push_reductions_keeps_inner_sweeps_alone() {
        let tree = reduce_tree(1);
        let pushed = push_reductions_inwards(&tree).unwrap();
        let red = pushed.tacs.iter().find(|t| t.opcode == Opcode::AddReduce).unwrap();
        assert_eq!(red.sweep, Some(1));
    }

    #[test]
    fn collapse_merges_contiguous_axes() {
        let tree = elementwise_tree(&[2, 3, 4]);
        let collapsed = collapse_redundant_axes(&tree).unwrap();
        collapsed.validation().unwrap();
        let Block::Loop(root) = &collapsed.roots[0] else { panic!() };
        assert_eq!(root.size, 24);
        assert!(matches!(root.blocks[0], Block::Leaf(0)));
        assert_eq!(collapsed.tacs[0].out.shape, [24]);
    }

    #[test]
    fn collapse_aborts_on_inconsistent_strides() {
        // Strided view: row stride 5 over 4-wide rows.
        let add = Instruction::new(
            Opcode::Add,
            vec![
                View::strided(BaseId(0), DType::F32, 0, &[4, 4], &[5, 1]),
                View::strided(BaseId(1), DType::F32, 0, &[4, 4], &[5, 1]),
                View::scalar(Constant::F32(2.0)),
            ],
        );
        let tree = BlockTree::compose(vec![lower(&add, 0).unwrap()]).unwrap();
        let collapsed = collapse_redundant_axes(&tree).unwrap();
        let Block::Loop(root) = &collapsed.roots[0] else { panic!() };
        assert_eq!(root.size, 4);
        assert_eq!(collapsed.tacs[0].out.shape, [4, 4]);
    }

    #[test]
    fn collapse_never_crosses_sweeps() {
        let tree = reduce_tree(0);
        let collapsed = collapse_redundant_axes(&tree).unwrap();
        collapsed.validation().unwrap();
        let red = collapsed.tacs.iter().find(|t| t.opcode == Opcode::AddReduce).unwrap();
        assert_eq!(red.ndim(), 2);
    }

    #[test]
    fn threading_split_groups_children() {
        // A sweeped sub-loop next to an elementwise sub-loop under the same
        // outer rank; the extents differ so they nest separately.
        let red = Instruction::new(
            Opcode::AddReduce,
            vec![
                View::contiguous(BaseId(3), DType::F32, &[64]),
                View::contiguous(BaseId(0), DType::F32, &[64, 32]),
                View::scalar(Constant::I64(1)),
            ],
        );
        let a = Instruction::new(
            Opcode::Add,
            vec![
                View::contiguous(BaseId(1), DType::F32, &[64, 16]),
                View::contiguous(BaseId(2), DType::F32, &[64, 16]),
                View::scalar(Constant::F32(1.0)),
            ],
        );
        let tree =
            BlockTree::compose(vec![lower(&red, 0).unwrap(), lower(&a, 1).unwrap()]).unwrap();
        let split = split_for_threading(&tree, 128, 1).unwrap();
        split.validation().unwrap();
        // The sweeped sub-loop lands in a serial group, the elementwise one
        // in a parallel group of its own.
        assert!(split.roots.len() >= 2);
        assert!(split.roots.iter().any(|b| b.as_loop().is_some_and(|l| l.parallel)));
        assert!(split.roots.iter().any(|b| b.as_loop().is_some_and(|l| !l.parallel)));
    }

    #[test]
    fn transform_round_trip_passes_validation() {
        for tree in [elementwise_tree(&[4, 4]), reduce_tree(0), reduce_tree(1)] {
            let t = push_reductions_inwards(&tree).unwrap();
            let t = split_for_threading(&t, 1024, 1).unwrap();
            let t = collapse_redundant_axes(&t).unwrap();
            t.validation().unwrap();
        }
    }
}
