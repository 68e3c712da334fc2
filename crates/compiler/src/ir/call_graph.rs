//! Call graph with strongly connected components.
//!
//! One node per function, with a successor edge for every direct call.
//! Tarjan's algorithm produces the SCCs in reverse topological order; an
//! SCC-of-SCCs super-graph is wired on top by aggregating the member
//! functions' cross-SCC edges.

use std::collections::HashSet;

use crate::ir::{Callee, InstKind, Module, ValueKind};

/// A call site: the calling function and the called function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub caller: usize,
    pub callee: usize,
}

#[derive(Debug)]
pub struct FunctionNode {
    pub function: usize,
    /// Functions this one calls directly (self edges excluded).
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
    /// Index of the SCC this function belongs to.
    pub scc: usize,
    /// Every direct call instruction in this function's body.
    pub callsites: Vec<CallSite>,
}

#[derive(Debug)]
pub struct Scc {
    /// Member function indices.
    pub functions: Vec<usize>,
    /// Cross-SCC edges, deduplicated.
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

impl Scc {
    /// True for single functions that call themselves and for every
    /// multi-function component.
    pub fn is_recursive(&self, graph: &SCCCallGraph) -> bool {
        if self.functions.len() > 1 {
            return true;
        }
        let f = self.functions[0];
        graph.nodes[f]
            .callsites
            .iter()
            .any(|site| site.callee == f)
    }
}

#[derive(Debug)]
pub struct SCCCallGraph {
    nodes: Vec<FunctionNode>,
    sccs: Vec<Scc>,
}

impl SCCCallGraph {
    pub fn compute(module: &Module) -> SCCCallGraph {
        let mut nodes: Vec<FunctionNode> = (0..module.functions.len())
            .map(|function| FunctionNode {
                function,
                successors: Vec::new(),
                predecessors: Vec::new(),
                scc: 0,
                callsites: Vec::new(),
            })
            .collect();

        for (caller, function) in module.functions.iter().enumerate() {
            let mut callees: HashSet<usize> = HashSet::new();
            for value in function.value_ids() {
                let ValueKind::Inst { op: InstKind::Call { callee, .. }, .. } =
                    &function.value(value).kind
                else {
                    continue;
                };
                let Callee::Function(callee) = *callee else { continue };
                nodes[caller].callsites.push(CallSite { caller, callee });
                // Self recursion is invisible at the node level.
                if callee != caller {
                    callees.insert(callee);
                }
            }
            let mut callees: Vec<usize> = callees.into_iter().collect();
            callees.sort_unstable();
            for &callee in &callees {
                nodes[callee].predecessors.push(caller);
            }
            nodes[caller].successors = callees;
        }

        let sccs = tarjan(&nodes);
        let mut graph = SCCCallGraph { nodes, sccs };
        for (index, scc) in graph.sccs.iter().enumerate() {
            for &f in &scc.functions {
                graph.nodes[f].scc = index;
            }
        }
        graph.wire_scc_edges();
        graph
    }

    fn wire_scc_edges(&mut self) {
        for index in 0..self.sccs.len() {
            let mut successors: Vec<usize> = Vec::new();
            for &f in &self.sccs[index].functions {
                for &callee in &self.nodes[f].successors {
                    let target = self.nodes[callee].scc;
                    if target != index && !successors.contains(&target) {
                        successors.push(target);
                    }
                }
            }
            for &target in &successors {
                self.sccs[target].predecessors.push(index);
            }
            self.sccs[index].successors = successors;
        }
    }

    /// Components in reverse topological order: callees before callers.
    pub fn sccs(&self) -> &[Scc] {
        &self.sccs
    }

    pub fn node(&self, function: usize) -> &FunctionNode {
        &self.nodes[function]
    }

    pub fn callsites(&self, function: usize) -> &[CallSite] {
        &self.nodes[function].callsites
    }

    pub fn scc_of(&self, function: usize) -> &Scc {
        &self.sccs[self.nodes[function].scc]
    }
}

impl std::ops::Index<usize> for SCCCallGraph {
    type Output = FunctionNode;

    fn index(&self, function: usize) -> &FunctionNode {
        &self.nodes[function]
    }
}

/// Tarjan's algorithm, iterative, emitting SCCs in reverse topological
/// order.
fn tarjan(nodes: &[FunctionNode]) -> Vec<Scc> {
    #[derive(Clone, Copy)]
    struct NodeState {
        index: Option<u32>,
        lowlink: u32,
        on_stack: bool,
    }
    let mut state = vec![NodeState { index: None, lowlink: 0, on_stack: false }; nodes.len()];
    let mut counter = 0u32;
    let mut stack: Vec<usize> = Vec::new();
    let mut sccs: Vec<Scc> = Vec::new();

    // Explicit DFS frames: (node, next successor position).
    for root in 0..nodes.len() {
        if state[root].index.is_some() {
            continue;
        }
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        state[root].index = Some(counter);
        state[root].lowlink = counter;
        state[root].on_stack = true;
        stack.push(root);
        counter += 1;

        while let Some(&(node, next)) = frames.last() {
            if next < nodes[node].successors.len() {
                frames.last_mut().unwrap().1 += 1;
                let succ = nodes[node].successors[next];
                if state[succ].index.is_none() {
                    state[succ].index = Some(counter);
                    state[succ].lowlink = counter;
                    state[succ].on_stack = true;
                    stack.push(succ);
                    counter += 1;
                    frames.push((succ, 0));
                } else if state[succ].on_stack {
                    state[node].lowlink = state[node].lowlink.min(state[succ].index.unwrap());
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    state[parent].lowlink = state[parent].lowlink.min(state[node].lowlink);
                }
                if Some(state[node].lowlink) == state[node].index {
                    let mut functions = Vec::new();
                    loop {
                        let f = stack.pop().expect("tarjan stack underflow");
                        state[f].on_stack = false;
                        functions.push(f);
                        if f == node {
                            break;
                        }
                    }
                    sccs.push(Scc {
                        functions,
                        successors: Vec::new(),
                        predecessors: Vec::new(),
                    });
                }
            }
        }
    }
    sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Context, Function, InstKind, Module};

    /// Build a module of void functions with the given call lists.
    fn module_with_calls(calls: &[&[usize]]) -> Module {
        let mut module = Module::new();
        let void = module.ctx.void();
        for (index, callees) in calls.iter().enumerate() {
            let mut f = Function::new(&format!("f{index}"), &[], void);
            let entry = f.add_block("entry");
            for &callee in *callees {
                f.add_inst(entry, "", void, InstKind::Call {
                    callee: Callee::Function(callee),
                    args: Vec::new(),
                });
            }
            f.add_inst(entry, "", void, InstKind::Return { value: None });
            module.functions.push(f);
        }
        module
    }

    #[test]
    fn test_acyclic_graph_topological_order() {
        // f0 -> f1 -> f2
        let module = module_with_calls(&[&[1], &[2], &[]]);
        let graph = SCCCallGraph::compute(&module);
        assert_eq!(graph.sccs().len(), 3);
        // Reverse topological: callees first.
        let order: Vec<usize> = graph.sccs().iter().map(|s| s.functions[0]).collect();
        let pos = |f: usize| order.iter().position(|&x| x == f).unwrap();
        assert!(pos(2) < pos(1));
        assert!(pos(1) < pos(0));
    }

    #[test]
    fn test_mutual_recursion_single_scc() {
        // f0 <-> f1, f2 calls f0
        let module = module_with_calls(&[&[1], &[0], &[0]]);
        let graph = SCCCallGraph::compute(&module);
        assert_eq!(graph.sccs().len(), 2);
        let cycle = graph.scc_of(0);
        assert_eq!(cycle.functions.len(), 2);
        assert!(cycle.is_recursive(&graph));
        assert!(cycle.functions.contains(&0) && cycle.functions.contains(&1));
        // The lone caller's SCC points at the cycle.
        let caller = graph.scc_of(2);
        assert_eq!(caller.functions, vec![2]);
        assert_eq!(caller.successors.len(), 1);
    }

    #[test]
    fn test_self_recursion_detected_via_callsites() {
        let module = module_with_calls(&[&[0]]);
        let graph = SCCCallGraph::compute(&module);
        // The node-level graph has no self edge...
        assert!(graph[0].successors.is_empty());
        // ...but the SCC still counts as recursive via its call sites.
        assert!(graph.scc_of(0).is_recursive(&graph));
        assert_eq!(graph.callsites(0).len(), 1);
    }

    #[test]
    fn test_non_recursive_single_function() {
        let module = module_with_calls(&[&[]]);
        let graph = SCCCallGraph::compute(&module);
        assert!(!graph.scc_of(0).is_recursive(&graph));
    }

    #[test]
    fn test_scc_super_graph_edges_deduplicated() {
        // Two functions in one SCC both call f2.
        let module = module_with_calls(&[&[1, 2], &[0, 2], &[]]);
        let graph = SCCCallGraph::compute(&module);
        let cycle = graph.scc_of(0);
        assert_eq!(cycle.successors.len(), 1);
        let leaf = graph.scc_of(2);
        assert_eq!(leaf.predecessors.len(), 1);
    }
}
