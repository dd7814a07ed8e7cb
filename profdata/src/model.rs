// The canonical performance model for one trial.
//
// A DataSource is created once per trial and filled by exactly one parser.  It owns the name
// tables for functions, metrics, user events and groups, the node/context/thread tree of real
// threads, the synthetic aggregate threads, trial metadata and the load diagnostics.

use crate::callpath::{self, CallGraph};
use crate::diag::{Diagnostic, DiagnosticKind};
use crate::interner::Interner;
use crate::thread::{AggregateKind, Thread};
use crate::{FunctionId, GroupId, MetricId, ThreadKey, Timestamp, UserEventId};

use std::collections::{BTreeMap, BTreeSet};

/// Functions in this group are call paths ("a => b => c").
pub const CALLPATH_GROUP: &str = "TAU_CALLPATH";

/// Functions in this group are pre-aggregated entries derived from call paths by the producer;
/// they are not part of the call graph.
pub const CALLPATH_DERIVED_GROUP: &str = "TAU_CALLPATH_DERIVED";

/// The separator between the elements of a call path.
pub const CALLPATH_SEPARATOR: &str = "=>";

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub groups: Vec<GroupId>,
}

impl Function {
    pub fn is_callpath(&self) -> bool {
        self.name.contains(CALLPATH_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub id: MetricId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub id: UserEventId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug)]
pub struct Context {
    pub id: i32,
    pub threads: BTreeMap<i32, Thread>,
}

#[derive(Debug)]
pub struct Node {
    pub id: i32,
    pub contexts: BTreeMap<i32, Context>,
}

#[derive(Debug, Default)]
pub struct DataSource {
    function_names: Interner,
    functions: Vec<Function>,
    metric_names: Interner,
    metrics: Vec<Metric>,
    user_event_names: Interner,
    user_events: Vec<UserEvent>,
    group_names: Interner,
    groups: Vec<Group>,

    nodes: BTreeMap<i32, Node>,
    aggregates: BTreeMap<AggregateKind, Thread>,

    // Aggregates that were read from the input rather than computed.
    materialized: BTreeSet<AggregateKind>,

    /// Trial-level key/value metadata, e.g. description.
    pub metadata: BTreeMap<String, String>,
    pub name: Option<String>,
    pub start_time: Option<Timestamp>,

    diagnostics: Vec<Diagnostic>,
    has_callpaths: bool,
    derived_generated: bool,
}

impl DataSource {
    pub fn new() -> DataSource {
        Default::default()
    }

    // Interning.

    pub fn intern_function(&mut self, name: &str) -> FunctionId {
        let (id, is_new) = self.function_names.intern(name);
        if is_new {
            self.functions.push(Function {
                id,
                name: name.to_string(),
                groups: vec![],
            });
            if name.contains(CALLPATH_SEPARATOR) {
                self.has_callpaths = true;
                let g = self.intern_group(CALLPATH_GROUP);
                self.add_function_to_group(id, g);
            }
        }
        id
    }

    pub fn intern_metric(&mut self, name: &str) -> MetricId {
        let (id, is_new) = self.metric_names.intern(name);
        if is_new {
            self.metrics.push(Metric {
                id,
                name: name.to_string(),
            });
        }
        id
    }

    pub fn intern_user_event(&mut self, name: &str) -> UserEventId {
        let (id, is_new) = self.user_event_names.intern(name);
        if is_new {
            self.user_events.push(UserEvent {
                id,
                name: name.to_string(),
            });
        }
        id
    }

    pub fn intern_group(&mut self, name: &str) -> GroupId {
        let (id, is_new) = self.group_names.intern(name);
        if is_new {
            self.groups.push(Group {
                id,
                name: name.to_string(),
            });
        }
        id
    }

    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.function_names.get(name)
    }

    pub fn metric_id(&self, name: &str) -> Option<MetricId> {
        self.metric_names.get(name)
    }

    pub fn user_event_id(&self, name: &str) -> Option<UserEventId> {
        self.user_event_names.get(name)
    }

    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        self.group_names.get(name)
    }

    pub fn add_function_to_group(&mut self, function: FunctionId, group: GroupId) {
        if let Some(f) = self.functions.get_mut(function) {
            if !f.groups.contains(&group) {
                f.groups.push(group);
            }
        }
    }

    pub fn function_in_group(&self, function: FunctionId, group: &str) -> bool {
        match (self.functions.get(function), self.group_names.get(group)) {
            (Some(f), Some(g)) => f.groups.contains(&g),
            _ => false,
        }
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id)
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn num_metrics(&self) -> usize {
        self.metrics.len()
    }

    pub fn user_events(&self) -> &[UserEvent] {
        &self.user_events
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn has_callpaths(&self) -> bool {
        self.has_callpaths
    }

    pub fn has_user_events(&self) -> bool {
        !self.user_events.is_empty()
    }

    // Metrics.

    /// Intern a metric and, if it is new, make room for it on every existing thread.

    pub fn add_metric(&mut self, name: &str) -> MetricId {
        let before = self.metrics.len();
        let id = self.intern_metric(name);
        let n = self.metrics.len();
        if n == before {
            return id;
        }
        for t in self.threads_mut() {
            t.resize_metrics(n);
        }
        for t in self.aggregates.values_mut() {
            t.resize_metrics(n);
        }
        id
    }

    /// Make room for all currently known metrics in every function profile of one thread,
    /// preserving its existing values.

    pub fn add_metric_to_thread(&mut self, key: ThreadKey) {
        let n = self.metrics.len();
        if let Some(t) = self.thread_mut(key) {
            t.resize_metrics(n);
        }
    }

    // Threads.

    pub fn get_or_create_thread(&mut self, node: i32, context: i32, thread: i32) -> &mut Thread {
        let num_metrics = self.metrics.len();
        let n = self.nodes.entry(node).or_insert_with(|| Node {
            id: node,
            contexts: BTreeMap::new(),
        });
        let c = n.contexts.entry(context).or_insert_with(|| Context {
            id: context,
            threads: BTreeMap::new(),
        });
        let t = c
            .threads
            .entry(thread)
            .or_insert_with(|| Thread::new(node, context, thread, num_metrics));
        t.resize_metrics(num_metrics);
        t
    }

    pub fn thread(&self, key: ThreadKey) -> Option<&Thread> {
        let (node, context, thread) = key;
        self.nodes
            .get(&node)
            .and_then(|n| n.contexts.get(&context))
            .and_then(|c| c.threads.get(&thread))
    }

    pub fn thread_mut(&mut self, key: ThreadKey) -> Option<&mut Thread> {
        let (node, context, thread) = key;
        self.nodes
            .get_mut(&node)
            .and_then(|n| n.contexts.get_mut(&context))
            .and_then(|c| c.threads.get_mut(&thread))
    }

    pub fn nodes(&self) -> &BTreeMap<i32, Node> {
        &self.nodes
    }

    /// The real threads in (node, context, thread) order.

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.nodes
            .values()
            .flat_map(|n| n.contexts.values())
            .flat_map(|c| c.threads.values())
    }

    pub fn threads_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.nodes
            .values_mut()
            .flat_map(|n| n.contexts.values_mut())
            .flat_map(|c| c.threads.values_mut())
    }

    pub fn num_threads(&self) -> usize {
        self.threads().count()
    }

    /// The largest snapshot count over the real threads.

    pub fn num_snapshots(&self) -> usize {
        self.threads().map(|t| t.num_snapshots()).max().unwrap_or(1)
    }

    // Aggregate threads.

    pub fn aggregate(&self, kind: AggregateKind) -> Option<&Thread> {
        self.aggregates.get(&kind)
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &Thread> {
        self.aggregates.values()
    }

    /// Real threads followed by the aggregate threads.

    pub fn all_threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads().chain(self.aggregates.values())
    }

    pub(crate) fn set_aggregate(&mut self, kind: AggregateKind, thread: Thread) {
        self.aggregates.insert(kind, thread);
    }

    pub(crate) fn update_aggregate_maxes(&mut self) {
        for t in self.aggregates.values_mut() {
            t.update_maxes();
        }
    }

    /// Get the aggregate thread of the given kind as supplied by the producer, creating it if
    /// necessary.  The derived statistics engine will not recompute it.

    pub fn materialize_aggregate(&mut self, kind: AggregateKind) -> &mut Thread {
        self.materialized.insert(kind);
        let n = self.metrics.len();
        let t = self
            .aggregates
            .entry(kind)
            .or_insert_with(|| Thread::new_aggregate(kind, n));
        t.resize_metrics(n);
        t
    }

    pub fn is_materialized(&self, kind: AggregateKind) -> bool {
        self.materialized.contains(&kind)
    }

    pub fn derived_generated(&self) -> bool {
        self.derived_generated
    }

    pub(crate) fn set_derived_generated(&mut self) {
        self.derived_generated = true;
    }

    // Call paths.

    /// The call graph of a thread, built on first request and cached on the thread.

    pub fn call_graph<'a>(&self, thread: &'a Thread) -> &'a CallGraph {
        thread
            .call_graph_cell()
            .get_or_init(|| callpath::build_call_graph(self, thread))
    }

    pub fn call_graph_for(&self, key: ThreadKey) -> Option<&CallGraph> {
        self.thread(key).map(|t| self.call_graph(t))
    }

    // Diagnostics.

    pub fn record(&mut self, kind: DiagnosticKind, source: &str, message: String) {
        self.diagnostics.push(Diagnostic::new(kind, source, message));
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Set a trial metadata value unless it is already set.

    pub fn add_metadata(&mut self, key: &str, value: &str) {
        if !self.metadata.contains_key(key) {
            self.metadata.insert(key.to_string(), value.to_string());
        }
    }
}

#[test]
fn test_interning_is_stable() {
    let mut ds = DataSource::new();
    let main = ds.intern_function("main");
    let foo = ds.intern_function("foo");
    assert!(main == 0 && foo == 1);
    assert!(ds.intern_function("main") == main);
    assert!(ds.intern_metric("Time") == 0);
    assert!(ds.intern_metric("PAPI_FP_OPS") == 1);
    assert!(ds.intern_metric("Time") == 0);
    assert!(ds.intern_user_event("mem") == 0);
    assert!(ds.function_id("foo") == Some(1));
    assert!(ds.function(1).unwrap().name == "foo");
    assert!(!ds.has_callpaths());
}

#[test]
fn test_callpath_functions_are_grouped() {
    let mut ds = DataSource::new();
    let f = ds.intern_function("main => foo");
    assert!(ds.has_callpaths());
    assert!(ds.function_in_group(f, CALLPATH_GROUP));
    assert!(!ds.function_in_group(f, CALLPATH_DERIVED_GROUP));
    assert!(ds.function(f).unwrap().is_callpath());
}

#[test]
fn test_add_metric_resizes_threads() {
    let mut ds = DataSource::new();
    let time = ds.add_metric("Time");
    let f = ds.intern_function("main");
    {
        let t = ds.get_or_create_thread(0, 0, 1);
        let p = t.get_or_create_function_profile(f);
        p.set_inclusive(0, time, 12.5);
    }
    let ops = ds.add_metric("PAPI_FP_OPS");
    let t = ds.thread((0, 0, 1)).unwrap();
    assert!(t.num_metrics() == 2);
    let p = t.function_profile(f).unwrap();
    assert!(p.num_metrics() == 2);
    assert!(p.inclusive(0, time) == 12.5);
    assert!(p.inclusive(0, ops) == 0.0);

    // Known metrics come back with their id and leave the threads alone
    assert!(ds.add_metric("Time") == time);
    assert!(ds.add_metric("PAPI_FP_OPS") == ops);
    assert!(ds.num_metrics() == 2);
    let p = ds.thread((0, 0, 1)).unwrap().function_profile(f).unwrap();
    assert!(p.num_metrics() == 2);
    assert!(p.inclusive(0, time) == 12.5);
}

#[test]
fn test_thread_tree() {
    let mut ds = DataSource::new();
    ds.get_or_create_thread(1, 0, 0);
    ds.get_or_create_thread(0, 0, 1);
    ds.get_or_create_thread(0, 0, 0);
    ds.get_or_create_thread(0, 0, 1);
    assert!(ds.num_threads() == 3);
    let keys = ds.threads().map(|t| t.key()).collect::<Vec<_>>();
    assert!(keys == vec![(0, 0, 0), (0, 0, 1), (1, 0, 0)]);
    assert!(ds.thread((2, 0, 0)).is_none());
}
