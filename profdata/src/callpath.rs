// Reconstruct parent/child relations from call-path function names.
//
// A call-path function is named "P1 => P2 => ... => Pn".  Only the last two elements matter for the
// relation: Pn-1 is the parent and Pn the child.  Both are resolved to their own plain functions and
// their own profiles on the same thread; the edge refers to the path-qualified function, whose
// profile carries the numbers for that particular path.
//
// The graph is built at most once per thread (the thread holds it in a OnceLock) and is immutable
// afterwards, so any number of readers may share it.  Back edges (recursion) are found with an
// iterative depth-first search, and the Walker traverses with an epoch marker, so neither depends on
// the depth of the call chains.

use crate::diag::{Diagnostic, DiagnosticKind};
use crate::model::{DataSource, CALLPATH_DERIVED_GROUP, CALLPATH_SEPARATOR};
use crate::thread::Thread;
use crate::FunctionId;

use std::collections::{BTreeMap, BTreeSet};

/// Split a call path into (parent, child) names.  Returns None if the name is not a call path.
///
/// "main => foo => bar" yields ("foo", "bar"), and "main => foo" yields ("main", "foo").

pub fn split_callpath(name: &str) -> Option<(&str, &str)> {
    let (prefix, child) = name.rsplit_once(CALLPATH_SEPARATOR)?;
    let parent = match prefix.rsplit_once(CALLPATH_SEPARATOR) {
        Some((_, parent)) => parent,
        None => prefix,
    };
    Some((parent.trim(), child.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    /// The function at the other end of the edge.
    pub function: FunctionId,
    /// The path-qualified function whose profile holds the data for this edge.
    pub path: FunctionId,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    children: BTreeMap<FunctionId, Vec<Edge>>,
    parents: BTreeMap<FunctionId, Vec<Edge>>,
    back_edges: BTreeSet<(FunctionId, FunctionId)>,
    diagnostics: Vec<Diagnostic>,
    num_functions: usize,
}

impl CallGraph {
    pub fn children(&self, function: FunctionId) -> &[Edge] {
        self.children.get(&function).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn parents(&self, function: FunctionId) -> &[Edge] {
        self.parents.get(&function).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn num_edges(&self) -> usize {
        self.children.values().map(|v| v.len()).sum()
    }

    /// All edges as (parent, child, path) triples, in parent order.

    pub fn edges(&self) -> Vec<(FunctionId, FunctionId, FunctionId)> {
        self.children
            .iter()
            .flat_map(|(p, es)| es.iter().map(move |e| (*p, e.function, e.path)))
            .collect()
    }

    /// Functions that have children but no parents.

    pub fn roots(&self) -> Vec<FunctionId> {
        self.children
            .keys()
            .filter(|f| !self.parents.contains_key(f))
            .copied()
            .collect()
    }

    pub fn is_back_edge(&self, parent: FunctionId, child: FunctionId) -> bool {
        self.back_edges.contains(&(parent, child))
    }

    pub fn back_edges(&self) -> &BTreeSet<(FunctionId, FunctionId)> {
        &self.back_edges
    }

    /// Links that were skipped because an endpoint could not be resolved.

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn walker(&self) -> Walker<'_> {
        Walker {
            graph: self,
            marks: vec![0; self.num_functions],
            epoch: 0,
        }
    }

    fn insert(&mut self, parent: FunctionId, child: FunctionId, path: FunctionId) {
        let down = self.children.entry(parent).or_default();
        let edge = Edge { function: child, path };
        if down.contains(&edge) {
            return;
        }
        down.push(edge);
        self.parents.entry(child).or_default().push(Edge {
            function: parent,
            path,
        });
    }

    // Depth-first search from every node in id order, with an explicit stack.  An edge to a node
    // that is still on the stack closes a cycle and is a back edge.

    fn find_back_edges(&mut self) {
        const NEW: u8 = 0;
        const ACTIVE: u8 = 1;
        const DONE: u8 = 2;

        let mut state = vec![NEW; self.num_functions];
        let starts = self.children.keys().copied().collect::<Vec<_>>();
        let mut back_edges = BTreeSet::new();
        for start in starts {
            if state[start] != NEW {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            state[start] = ACTIVE;
            while let Some((node, next)) = stack.pop() {
                let children = self.children(node);
                if next < children.len() {
                    stack.push((node, next + 1));
                    let child = children[next].function;
                    match state[child] {
                        NEW => {
                            state[child] = ACTIVE;
                            stack.push((child, 0));
                        }
                        ACTIVE => {
                            back_edges.insert((node, child));
                        }
                        _ => {}
                    }
                } else {
                    state[node] = DONE;
                }
            }
        }
        self.back_edges = back_edges;
    }
}

/// Build the call graph for one thread.  Normally reached through `DataSource::call_graph`, which
/// caches the result.

pub fn build_call_graph(ds: &DataSource, thread: &Thread) -> CallGraph {
    let mut graph = CallGraph {
        num_functions: ds.functions().len(),
        ..Default::default()
    };
    let source = format!("thread {},{},{}", thread.node(), thread.context(), thread.thread());

    for profile in thread.function_profiles() {
        let path = profile.function();
        let function = match ds.function(path) {
            Some(f) => f,
            None => continue,
        };
        if !function.is_callpath() || ds.function_in_group(path, CALLPATH_DERIVED_GROUP) {
            continue;
        }
        let (parent_name, child_name) = match split_callpath(&function.name) {
            Some(x) => x,
            None => continue,
        };
        let resolve = |name: &str| {
            ds.function_id(name)
                .filter(|f| thread.function_profile(*f).is_some())
        };
        match (resolve(parent_name), resolve(child_name)) {
            (Some(parent), Some(child)) => {
                graph.insert(parent, child, path);
            }
            (parent, _) => {
                let missing = if parent.is_none() { parent_name } else { child_name };
                graph.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::MissingReference,
                    &source,
                    format!("No profile for \"{missing}\" in call path \"{}\"", function.name),
                ));
            }
        }
    }

    graph.find_back_edges();
    log::debug!("{source}: {} call-path edges", graph.num_edges());
    graph
}

/// Iterative traversal over a call graph.  Each traversal bumps the epoch instead of clearing the
/// marks, so a walker can be reused cheaply for many queries.

pub struct Walker<'a> {
    graph: &'a CallGraph,
    marks: Vec<u32>,
    epoch: u32,
}

impl<'a> Walker<'a> {
    /// Every function reachable from `root` through child edges, not including `root` itself
    /// unless it is reachable through a cycle.

    pub fn descendants(&mut self, root: FunctionId) -> Vec<FunctionId> {
        self.walk(root, |g, f| g.children(f))
    }

    pub fn ancestors(&mut self, root: FunctionId) -> Vec<FunctionId> {
        self.walk(root, |g, f| g.parents(f))
    }

    fn next_epoch(&mut self) {
        if self.epoch == u32::MAX {
            self.marks.iter_mut().for_each(|m| *m = 0);
            self.epoch = 0;
        }
        self.epoch += 1;
    }

    fn walk<F>(&mut self, root: FunctionId, next: F) -> Vec<FunctionId>
    where
        F: Fn(&'a CallGraph, FunctionId) -> &'a [Edge],
    {
        self.next_epoch();
        let mut result = vec![];
        let mut stack = vec![root];
        while let Some(f) = stack.pop() {
            for e in next(self.graph, f) {
                let g = e.function;
                if g >= self.marks.len() {
                    self.marks.resize(g + 1, 0);
                }
                if self.marks[g] != self.epoch {
                    self.marks[g] = self.epoch;
                    result.push(g);
                    stack.push(g);
                }
            }
        }
        result
    }
}

#[cfg(test)]
fn add_profile(ds: &mut DataSource, key: (i32, i32, i32), name: &str, calls: f64, incl: f64) {
    let f = ds.intern_function(name);
    let t = ds.get_or_create_thread(key.0, key.1, key.2);
    let p = t.get_or_create_function_profile(f);
    p.set_calls(0, calls);
    p.set_inclusive(0, 0, incl);
}

#[test]
fn test_split_callpath() {
    assert!(split_callpath("main => foo => bar") == Some(("foo", "bar")));
    assert!(split_callpath("main => foo") == Some(("main", "foo")));
    assert!(split_callpath("main") == None);
    assert!(split_callpath("a=>b=>c=>d") == Some(("c", "d")));
}

#[test]
fn test_build_call_graph() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    for name in ["main", "foo", "bar", "main => foo", "main => foo => bar", "main => bar"] {
        add_profile(&mut ds, (0, 0, 0), name, 1.0, 10.0);
    }
    let main = ds.function_id("main").unwrap();
    let foo = ds.function_id("foo").unwrap();
    let bar = ds.function_id("bar").unwrap();
    let main_foo = ds.function_id("main => foo").unwrap();
    let main_foo_bar = ds.function_id("main => foo => bar").unwrap();

    let t = ds.thread((0, 0, 0)).unwrap();
    let g = ds.call_graph(t);
    assert!(g.num_edges() == 3);
    assert!(g.children(main).len() == 2);
    assert!(g.children(main)[0] == Edge { function: foo, path: main_foo });
    assert!(g.children(foo) == &[Edge { function: bar, path: main_foo_bar }]);
    assert!(g.parents(bar).len() == 2);
    assert!(g.parents(foo) == &[Edge { function: main, path: main_foo }]);
    assert!(g.roots() == vec![main]);
    assert!(g.back_edges().is_empty());
    assert!(g.diagnostics().is_empty());
}

#[test]
fn test_call_graph_is_idempotent() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    for name in ["main", "foo", "main => foo"] {
        add_profile(&mut ds, (0, 0, 0), name, 1.0, 10.0);
    }
    let t = ds.thread((0, 0, 0)).unwrap();
    let first = ds.call_graph(t).edges();
    let second = ds.call_graph(t).edges();
    assert!(first.len() == 1);
    assert!(first == second);
    assert!(std::ptr::eq(ds.call_graph(t), ds.call_graph_for((0, 0, 0)).unwrap()));
}

#[test]
fn test_missing_reference_is_skipped() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    for name in ["main", "foo", "main => foo", "foo => ghost"] {
        add_profile(&mut ds, (0, 0, 0), name, 1.0, 10.0);
    }
    // "ghost" is known to the trial but has no profile on this thread
    add_profile(&mut ds, (0, 0, 1), "ghost", 1.0, 1.0);
    let g = ds.call_graph_for((0, 0, 0)).unwrap();
    assert!(g.num_edges() == 1);
    assert!(g.diagnostics().len() == 1);
    assert!(g.diagnostics()[0].kind == DiagnosticKind::MissingReference);
}

#[test]
fn test_derived_callpaths_are_excluded() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    for name in ["main", "foo", "main => foo", "foo => main"] {
        add_profile(&mut ds, (0, 0, 0), name, 1.0, 10.0);
    }
    let derived = ds.intern_group(CALLPATH_DERIVED_GROUP);
    let f = ds.function_id("foo => main").unwrap();
    ds.add_function_to_group(f, derived);
    let g = ds.call_graph_for((0, 0, 0)).unwrap();
    assert!(g.num_edges() == 1);
}

#[test]
fn test_recursion_is_a_back_edge() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    for name in ["main", "a", "b", "main => a", "main => a => b", "main => a => b => a"] {
        add_profile(&mut ds, (0, 0, 0), name, 1.0, 10.0);
    }
    let a = ds.function_id("a").unwrap();
    let b = ds.function_id("b").unwrap();
    let g = ds.call_graph_for((0, 0, 0)).unwrap();
    assert!(g.num_edges() == 3);
    assert!(g.is_back_edge(b, a));
    assert!(!g.is_back_edge(a, b));
    assert!(g.back_edges().len() == 1);
}

#[test]
fn test_deep_chains() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    let depth = 20000;
    for i in 0..depth {
        add_profile(&mut ds, (0, 0, 0), &format!("f{i}"), 1.0, 1.0);
    }
    for i in 1..depth {
        add_profile(&mut ds, (0, 0, 0), &format!("f{} => f{}", i - 1, i), 1.0, 1.0);
    }
    let g = ds.call_graph_for((0, 0, 0)).unwrap();
    assert!(g.num_edges() == depth - 1);
    let f0 = ds.function_id("f0").unwrap();
    let last = ds.function_id(&format!("f{}", depth - 1)).unwrap();
    let mut w = g.walker();
    assert!(w.descendants(f0).len() == depth - 1);
    assert!(w.ancestors(last).len() == depth - 1);
    // The walker is reusable
    assert!(w.descendants(last).is_empty());
    assert!(w.descendants(f0).len() == depth - 1);
}
