//! Dominator trees and the loop nesting forest.
//!
//! Dominators use the iterative intersect algorithm over reverse post
//! order; post-dominators run the same algorithm on the reversed CFG with a
//! virtual exit joining all return blocks. Natural loops are identified by
//! back edges whose target dominates their source.

use std::collections::HashMap;

use crate::ir::{BlockId, Function};

/// Immediate-dominator tree. Also answers "does A dominate B".
#[derive(Debug, Clone)]
pub struct DomTree {
    /// `idom[b]` is `None` for the root and for unreachable blocks.
    idom: HashMap<BlockId, Option<BlockId>>,
    roots: Vec<BlockId>,
}

impl DomTree {
    /// Dominator tree rooted at the entry block.
    pub fn compute(function: &Function) -> DomTree {
        let order = function.reverse_post_order();
        let preds = |b: BlockId| function.block(b).preds.clone();
        Self::compute_impl(&order, preds, vec![function.entry()])
    }

    /// Post-dominator tree: dominators of the reversed CFG. All exit blocks
    /// act as roots of a virtual exit.
    pub fn compute_post(function: &Function) -> DomTree {
        let mut order = function.reverse_post_order();
        order.reverse();
        let exits: Vec<BlockId> = order
            .iter()
            .copied()
            .filter(|&b| function.successors(b).is_empty())
            .collect();
        // Exit blocks first, as the roots of the traversal.
        order.sort_by_key(|b| !exits.contains(b));
        let succs = |b: BlockId| function.successors(b);
        Self::compute_impl(&order, succs, exits)
    }

    fn compute_impl(
        order: &[BlockId],
        preds: impl Fn(BlockId) -> Vec<BlockId>,
        roots: Vec<BlockId>,
    ) -> DomTree {
        // `Root` marks roots and blocks whose only common dominator is the
        // virtual super-root (multiple exits in the post-dominator case).
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum State {
            Unprocessed,
            Root,
            Block(BlockId),
        }
        let position: HashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let mut state: HashMap<BlockId, State> =
            order.iter().map(|&b| (b, State::Unprocessed)).collect();
        for &root in &roots {
            state.insert(root, State::Root);
        }

        // Walk both candidates up the tree until they meet; `None` means
        // they only meet at the virtual root.
        let intersect = |state: &HashMap<BlockId, State>,
                         mut a: BlockId,
                         mut b: BlockId|
         -> Option<BlockId> {
            loop {
                if a == b {
                    return Some(a);
                }
                let step = |x: BlockId| match state[&x] {
                    State::Block(parent) => Some(parent),
                    _ => None,
                };
                if position[&a] > position[&b] {
                    a = step(a)?;
                } else {
                    b = step(b)?;
                }
            }
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in order {
                if roots.contains(&block) {
                    continue;
                }
                let mut new_state = State::Unprocessed;
                for pred in preds(block) {
                    if !position.contains_key(&pred)
                        || state[&pred] == State::Unprocessed
                    {
                        continue;
                    }
                    new_state = match new_state {
                        State::Unprocessed => State::Block(pred),
                        State::Root => State::Root,
                        State::Block(current) => match intersect(&state, pred, current) {
                            Some(common) => State::Block(common),
                            None => State::Root,
                        },
                    };
                }
                if new_state != State::Unprocessed && state[&block] != new_state {
                    state.insert(block, new_state);
                    changed = true;
                }
            }
        }
        let idom = state
            .into_iter()
            .map(|(block, s)| {
                (block, match s {
                    State::Block(parent) => Some(parent),
                    _ => None,
                })
            })
            .collect();
        DomTree { idom, roots }
    }

    /// Immediate dominator of `block`, `None` for roots and unreachable
    /// blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied().flatten()
    }

    /// Does `a` dominate `b`? Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cursor = Some(b);
        while let Some(block) = cursor {
            if block == a {
                return true;
            }
            cursor = self.idom(block);
        }
        false
    }

    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }
}

/// One natural loop: its header and all member blocks.
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    pub blocks: Vec<BlockId>,
    /// Index of the enclosing loop in the forest, if nested.
    pub parent: Option<usize>,
}

/// All natural loops of a function, with their nesting.
#[derive(Debug, Clone, Default)]
pub struct LoopNestingForest {
    pub loops: Vec<Loop>,
    /// Innermost loop containing each block.
    membership: HashMap<BlockId, usize>,
}

impl LoopNestingForest {
    pub fn compute(function: &Function, dom: &DomTree) -> LoopNestingForest {
        // Back edge: an edge whose target dominates its source.
        let mut loops: Vec<Loop> = Vec::new();
        for &block in &function.reverse_post_order() {
            for succ in function.successors(block) {
                if dom.dominates(succ, block) {
                    let blocks = natural_loop(function, succ, block);
                    if let Some(existing) =
                        loops.iter_mut().find(|l| l.header == succ)
                    {
                        for b in blocks {
                            if !existing.blocks.contains(&b) {
                                existing.blocks.push(b);
                            }
                        }
                    } else {
                        loops.push(Loop { header: succ, blocks, parent: None });
                    }
                }
            }
        }
        // Nesting: a loop is the child of the smallest other loop containing
        // its header.
        let snapshot: Vec<(BlockId, usize)> =
            loops.iter().map(|l| (l.header, l.blocks.len())).collect();
        for i in 0..loops.len() {
            let header = snapshot[i].0;
            let mut best: Option<usize> = None;
            for (j, &(_, size)) in snapshot.iter().enumerate() {
                if i == j || !loops[j].blocks.contains(&header) {
                    continue;
                }
                if best.map_or(true, |b| size < snapshot[b].1) {
                    best = Some(j);
                }
            }
            loops[i].parent = best;
        }
        let mut membership: HashMap<BlockId, usize> = HashMap::new();
        for (index, l) in loops.iter().enumerate() {
            for &block in &l.blocks {
                match membership.get(&block) {
                    Some(&existing) if loops[existing].blocks.len() <= l.blocks.len() => {}
                    _ => {
                        membership.insert(block, index);
                    }
                }
            }
        }
        LoopNestingForest { loops, membership }
    }

    /// The innermost loop containing `block`.
    pub fn innermost_loop(&self, block: BlockId) -> Option<&Loop> {
        self.membership.get(&block).map(|&i| &self.loops[i])
    }

    pub fn is_header(&self, block: BlockId) -> bool {
        self.loops.iter().any(|l| l.header == block)
    }
}

/// Blocks of the natural loop of back edge `latch -> header`.
fn natural_loop(function: &Function, header: BlockId, latch: BlockId) -> Vec<BlockId> {
    let mut blocks = vec![header];
    let mut stack = vec![latch];
    while let Some(block) = stack.pop() {
        if blocks.contains(&block) {
            continue;
        }
        blocks.push(block);
        for &pred in &function.block(block).preds {
            stack.push(pred);
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Context, InstKind};

    /// entry -> (then | else) -> merge, merge -> ret
    fn diamond() -> (Function, BlockId, BlockId, BlockId, BlockId) {
        let mut ctx = Context::new();
        let void = ctx.void();
        let i1 = ctx.int(1);
        let mut f = Function::new("f", &[i1], void);
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");
        let merge = f.add_block("merge");
        let cond = f.params[0];
        f.add_inst(entry, "", void, InstKind::Branch {
            cond,
            then_block: then_b,
            else_block: else_b,
        });
        f.add_inst(then_b, "", void, InstKind::Goto { target: merge });
        f.add_inst(else_b, "", void, InstKind::Goto { target: merge });
        f.add_inst(merge, "", void, InstKind::Return { value: None });
        (f, entry, then_b, else_b, merge)
    }

    #[test]
    fn test_diamond_dominators() {
        let (f, entry, then_b, else_b, merge) = diamond();
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(entry), None);
        assert_eq!(dom.idom(then_b), Some(entry));
        assert_eq!(dom.idom(else_b), Some(entry));
        assert_eq!(dom.idom(merge), Some(entry));
        assert!(dom.dominates(entry, merge));
        assert!(!dom.dominates(then_b, merge));
        assert!(dom.dominates(merge, merge));
    }

    #[test]
    fn test_post_dominators() {
        let (f, entry, then_b, else_b, merge) = diamond();
        let post = DomTree::compute_post(&f);
        assert!(post.dominates(merge, entry));
        assert!(post.dominates(merge, then_b));
        assert!(post.dominates(merge, else_b));
        assert!(!post.dominates(then_b, entry));
    }

    #[test]
    fn test_loop_detection() {
        let mut ctx = Context::new();
        let void = ctx.void();
        let i1 = ctx.int(1);
        let mut f = Function::new("f", &[i1], void);
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let exit = f.add_block("exit");
        let cond = f.params[0];
        f.add_inst(entry, "", void, InstKind::Goto { target: header });
        f.add_inst(header, "", void, InstKind::Branch {
            cond,
            then_block: body,
            else_block: exit,
        });
        f.add_inst(body, "", void, InstKind::Goto { target: header });
        f.add_inst(exit, "", void, InstKind::Return { value: None });

        let dom = DomTree::compute(&f);
        let forest = LoopNestingForest::compute(&f, &dom);
        assert_eq!(forest.loops.len(), 1);
        assert_eq!(forest.loops[0].header, header);
        assert!(forest.loops[0].blocks.contains(&body));
        assert!(!forest.loops[0].blocks.contains(&exit));
        assert!(forest.is_header(header));
        assert!(forest.innermost_loop(body).is_some());
        assert!(forest.innermost_loop(entry).is_none());
    }

    #[test]
    fn test_nested_loops() {
        let mut ctx = Context::new();
        let void = ctx.void();
        let i1 = ctx.int(1);
        let mut f = Function::new("f", &[i1], void);
        let entry = f.add_block("entry");
        let outer = f.add_block("outer");
        let inner = f.add_block("inner");
        let inner_latch = f.add_block("inner_latch");
        let outer_latch = f.add_block("outer_latch");
        let exit = f.add_block("exit");
        let cond = f.params[0];
        f.add_inst(entry, "", void, InstKind::Goto { target: outer });
        f.add_inst(outer, "", void, InstKind::Goto { target: inner });
        f.add_inst(inner, "", void, InstKind::Branch {
            cond,
            then_block: inner_latch,
            else_block: outer_latch,
        });
        f.add_inst(inner_latch, "", void, InstKind::Goto { target: inner });
        f.add_inst(outer_latch, "", void, InstKind::Branch {
            cond,
            then_block: outer,
            else_block: exit,
        });
        f.add_inst(exit, "", void, InstKind::Return { value: None });

        let dom = DomTree::compute(&f);
        let forest = LoopNestingForest::compute(&f, &dom);
        assert_eq!(forest.loops.len(), 2);
        let inner_loop = forest.innermost_loop(inner_latch).unwrap();
        assert_eq!(inner_loop.header, inner);
        let inner_index = forest
            .loops
            .iter()
            .position(|l| l.header == inner)
            .unwrap();
        let outer_index = forest
            .loops
            .iter()
            .position(|l| l.header == outer)
            .unwrap();
        assert_eq!(forest.loops[inner_index].parent, Some(outer_index));
        assert_eq!(forest.loops[outer_index].parent, None);
    }

    #[test]
    fn test_caches_invalidate_on_cfg_edit() {
        let (mut f, entry, ..) = diamond();
        let dom_entry_children = f.dom_tree().idom(entry);
        assert!(dom_entry_children.is_none());
        // Adding a block invalidates; recomputation must still work.
        let b = f.add_block("late");
        let mut ctx = Context::new();
        let void = ctx.void();
        f.add_inst(b, "", void, InstKind::Return { value: None });
        assert!(f.dom_tree().idom(entry).is_none());
    }
}
