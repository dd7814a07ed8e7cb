// Per-thread profile storage: threads, function profiles, user event profiles and snapshots.
//
// All values are indexed by (snapshot, metric).  Call and subroutine counts do not depend on the
// metric and are indexed by snapshot only.  Indices beyond what has been stored read as zero, and
// setters grow the storage as needed, so a parser never has to pre-size anything.

use crate::callpath::CallGraph;
use crate::{FunctionId, ThreadKey, Timestamp, UserEventId};

use std::collections::BTreeMap;
use std::sync::OnceLock;

/// The synthetic aggregate threads.  Each has a fixed negative sentinel id that is used for the
/// node, context and thread number of the synthetic thread, so consumers can recognize them
/// without a type tag.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AggregateKind {
    /// Mean over the threads on which the entity was observed
    Mean,
    Total,
    /// Standard deviation over the threads on which the entity was observed
    StdDev,
    Min,
    Max,
    /// Mean over all threads, absent threads counting as zero
    MeanAll,
    /// Standard deviation over all threads, absent threads counting as zero
    StdDevAll,
}

pub const ALL_AGGREGATES: [AggregateKind; 7] = [
    AggregateKind::Mean,
    AggregateKind::Total,
    AggregateKind::StdDev,
    AggregateKind::Min,
    AggregateKind::Max,
    AggregateKind::MeanAll,
    AggregateKind::StdDevAll,
];

impl AggregateKind {
    pub fn sentinel(self) -> i32 {
        match self {
            AggregateKind::Mean => -1,
            AggregateKind::Total => -2,
            AggregateKind::StdDev => -3,
            AggregateKind::Min => -4,
            AggregateKind::Max => -5,
            AggregateKind::MeanAll => -6,
            AggregateKind::StdDevAll => -7,
        }
    }

    pub fn from_sentinel(id: i32) -> Option<AggregateKind> {
        ALL_AGGREGATES.iter().copied().find(|k| k.sentinel() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            AggregateKind::Mean => "mean",
            AggregateKind::Total => "total",
            AggregateKind::StdDev => "stddev",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::MeanAll => "mean_all",
            AggregateKind::StdDevAll => "stddev_all",
        }
    }

    pub fn from_name(name: &str) -> Option<AggregateKind> {
        ALL_AGGREGATES.iter().copied().find(|k| k.name() == name)
    }
}

/// One timestamped capture of a thread's profile state.

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub name: String,
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricValues {
    pub inclusive: f64,
    pub exclusive: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ProfileSlot {
    calls: f64,
    subroutines: f64,
    metrics: Vec<MetricValues>,
}

/// The data for one function on one thread.

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionProfile {
    function: FunctionId,
    snapshots: Vec<ProfileSlot>,
}

impl FunctionProfile {
    pub fn new(function: FunctionId, num_snapshots: usize, num_metrics: usize) -> FunctionProfile {
        let slot = ProfileSlot {
            calls: 0.0,
            subroutines: 0.0,
            metrics: vec![MetricValues::default(); num_metrics],
        };
        FunctionProfile {
            function,
            snapshots: vec![slot; usize::max(num_snapshots, 1)],
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn num_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    pub fn num_metrics(&self) -> usize {
        self.snapshots.first().map(|s| s.metrics.len()).unwrap_or(0)
    }

    /// Grow every snapshot to `num_metrics` metric slots.  Existing values are preserved; the
    /// profile is never shrunk.

    pub fn resize_metrics(&mut self, num_metrics: usize) {
        for slot in self.snapshots.iter_mut() {
            if slot.metrics.len() < num_metrics {
                slot.metrics.resize(num_metrics, MetricValues::default());
            }
        }
    }

    /// Append a snapshot slot seeded from the previous one.

    pub fn add_snapshot(&mut self) {
        let next = self.snapshots.last().cloned().unwrap_or_default();
        self.snapshots.push(next);
    }

    fn slot(&self, snapshot: usize) -> Option<&ProfileSlot> {
        self.snapshots.get(snapshot)
    }

    fn slot_mut(&mut self, snapshot: usize) -> &mut ProfileSlot {
        if snapshot >= self.snapshots.len() {
            let template = self.snapshots.last().cloned().unwrap_or_default();
            self.snapshots.resize(snapshot + 1, template);
        }
        &mut self.snapshots[snapshot]
    }

    fn values_mut(&mut self, snapshot: usize, metric: usize) -> &mut MetricValues {
        let slot = self.slot_mut(snapshot);
        if metric >= slot.metrics.len() {
            slot.metrics.resize(metric + 1, MetricValues::default());
        }
        &mut slot.metrics[metric]
    }

    pub fn values(&self, snapshot: usize, metric: usize) -> MetricValues {
        self.slot(snapshot)
            .and_then(|s| s.metrics.get(metric))
            .copied()
            .unwrap_or_default()
    }

    pub fn inclusive(&self, snapshot: usize, metric: usize) -> f64 {
        self.values(snapshot, metric).inclusive
    }

    pub fn exclusive(&self, snapshot: usize, metric: usize) -> f64 {
        self.values(snapshot, metric).exclusive
    }

    pub fn calls(&self, snapshot: usize) -> f64 {
        self.slot(snapshot).map(|s| s.calls).unwrap_or(0.0)
    }

    pub fn subroutines(&self, snapshot: usize) -> f64 {
        self.slot(snapshot).map(|s| s.subroutines).unwrap_or(0.0)
    }

    pub fn set_inclusive(&mut self, snapshot: usize, metric: usize, value: f64) {
        self.values_mut(snapshot, metric).inclusive = value;
    }

    pub fn set_exclusive(&mut self, snapshot: usize, metric: usize, value: f64) {
        self.values_mut(snapshot, metric).exclusive = value;
    }

    pub fn set_calls(&mut self, snapshot: usize, value: f64) {
        self.slot_mut(snapshot).calls = value;
    }

    pub fn set_subroutines(&mut self, snapshot: usize, value: f64) {
        self.slot_mut(snapshot).subroutines = value;
    }

    pub fn inclusive_per_call(&self, snapshot: usize, metric: usize) -> f64 {
        per_call(self.inclusive(snapshot, metric), self.calls(snapshot))
    }

    pub fn exclusive_per_call(&self, snapshot: usize, metric: usize) -> f64 {
        per_call(self.exclusive(snapshot, metric), self.calls(snapshot))
    }

    /// Zero the values for one metric in every snapshot.

    pub fn zero_metric(&mut self, metric: usize) {
        for slot in self.snapshots.iter_mut() {
            if let Some(v) = slot.metrics.get_mut(metric) {
                *v = MetricValues::default();
            }
        }
    }
}

fn per_call(value: f64, calls: f64) -> f64 {
    if calls == 0.0 {
        0.0
    } else {
        value / calls
    }
}

/// The summary statistics for one user event in one snapshot.  Only these survive from the
/// producer, not the raw samples.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UserEventStats {
    pub num_samples: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum_squared: f64,
}

impl UserEventStats {
    pub fn std_dev(&self) -> f64 {
        if self.num_samples <= 0.0 {
            return 0.0;
        }
        let variance = self.sum_squared / self.num_samples - self.mean * self.mean;
        f64::max(variance, 0.0).sqrt()
    }

    /// Combine two partial observations of the same event as if their samples had been recorded
    /// in one series.

    pub fn merge(&self, other: &UserEventStats) -> UserEventStats {
        if other.num_samples <= 0.0 {
            return *self;
        }
        if self.num_samples <= 0.0 {
            return *other;
        }
        let n = self.num_samples + other.num_samples;
        UserEventStats {
            num_samples: n,
            min: f64::min(self.min, other.min),
            max: f64::max(self.max, other.max),
            mean: (self.num_samples * self.mean + other.num_samples * other.mean) / n,
            sum_squared: self.sum_squared + other.sum_squared,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserEventProfile {
    user_event: UserEventId,
    snapshots: Vec<UserEventStats>,
}

impl UserEventProfile {
    pub fn new(user_event: UserEventId, num_snapshots: usize) -> UserEventProfile {
        UserEventProfile {
            user_event,
            snapshots: vec![UserEventStats::default(); usize::max(num_snapshots, 1)],
        }
    }

    pub fn user_event(&self) -> UserEventId {
        self.user_event
    }

    pub fn num_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    pub fn stats(&self, snapshot: usize) -> UserEventStats {
        self.snapshots.get(snapshot).copied().unwrap_or_default()
    }

    pub fn set_stats(&mut self, snapshot: usize, stats: UserEventStats) {
        if snapshot >= self.snapshots.len() {
            let template = self.snapshots.last().copied().unwrap_or_default();
            self.snapshots.resize(snapshot + 1, template);
        }
        self.snapshots[snapshot] = stats;
    }

    /// Merge a further partial observation into the given snapshot.

    pub fn merge_stats(&mut self, snapshot: usize, stats: &UserEventStats) {
        let merged = self.stats(snapshot).merge(stats);
        self.set_stats(snapshot, merged);
    }

    pub fn add_snapshot(&mut self) {
        let next = self.snapshots.last().copied().unwrap_or_default();
        self.snapshots.push(next);
    }
}

/// A real thread, identified by (node, context, thread), or a synthetic aggregate thread whose
/// three numbers are all the aggregate's sentinel.

#[derive(Debug)]
pub struct Thread {
    node: i32,
    context: i32,
    thread: i32,
    num_metrics: usize,
    function_profiles: Vec<Option<FunctionProfile>>,
    user_event_profiles: Vec<Option<UserEventProfile>>,
    snapshots: Vec<Snapshot>,

    // [snapshot][metric]
    max_inclusive: Vec<Vec<f64>>,
    max_exclusive: Vec<Vec<f64>>,

    pub metadata: BTreeMap<String, String>,

    call_graph: OnceLock<CallGraph>,
}

impl Thread {
    pub fn new(node: i32, context: i32, thread: i32, num_metrics: usize) -> Thread {
        Thread {
            node,
            context,
            thread,
            num_metrics,
            function_profiles: vec![],
            user_event_profiles: vec![],
            snapshots: vec![],
            max_inclusive: vec![],
            max_exclusive: vec![],
            metadata: BTreeMap::new(),
            call_graph: OnceLock::new(),
        }
    }

    pub fn new_aggregate(kind: AggregateKind, num_metrics: usize) -> Thread {
        let id = kind.sentinel();
        Thread::new(id, id, id, num_metrics)
    }

    pub fn node(&self) -> i32 {
        self.node
    }

    pub fn context(&self) -> i32 {
        self.context
    }

    pub fn thread(&self) -> i32 {
        self.thread
    }

    pub fn key(&self) -> ThreadKey {
        (self.node, self.context, self.thread)
    }

    pub fn aggregate_kind(&self) -> Option<AggregateKind> {
        if self.node < 0 {
            AggregateKind::from_sentinel(self.node)
        } else {
            None
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate_kind().is_some()
    }

    pub fn num_metrics(&self) -> usize {
        self.num_metrics
    }

    /// Make room for `num_metrics` metrics in every function profile on this thread, preserving
    /// the values already recorded.

    pub fn resize_metrics(&mut self, num_metrics: usize) {
        if num_metrics <= self.num_metrics {
            return;
        }
        self.num_metrics = num_metrics;
        for p in self.function_profiles.iter_mut().flatten() {
            p.resize_metrics(num_metrics);
        }
    }

    // Snapshots.

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// The number of snapshots, at least 1 since data on a thread without explicit snapshots is
    /// stored in an implicit snapshot 0.

    pub fn num_snapshots(&self) -> usize {
        usize::max(self.snapshots.len(), 1)
    }

    pub fn current_snapshot(&self) -> usize {
        self.num_snapshots() - 1
    }

    fn ensure_snapshot(&mut self) {
        if self.snapshots.is_empty() {
            self.snapshots.push(Snapshot {
                name: "final".to_string(),
                timestamp: None,
            });
        }
    }

    /// Start a new snapshot and return its index.  Every existing profile gets a new slot seeded
    /// with its values from the previous snapshot.  The first call names the implicit snapshot 0
    /// instead of adding one.

    pub fn add_snapshot(&mut self, name: &str, timestamp: Option<Timestamp>) -> usize {
        let has_data = self.function_profiles.iter().any(|p| p.is_some())
            || self.user_event_profiles.iter().any(|p| p.is_some());
        if self.snapshots.is_empty() && !has_data {
            self.snapshots.push(Snapshot {
                name: name.to_string(),
                timestamp,
            });
            return 0;
        }
        self.ensure_snapshot();
        self.snapshots.push(Snapshot {
            name: name.to_string(),
            timestamp,
        });
        for p in self.function_profiles.iter_mut().flatten() {
            p.add_snapshot();
        }
        for p in self.user_event_profiles.iter_mut().flatten() {
            p.add_snapshot();
        }
        self.snapshots.len() - 1
    }

    // Function profiles.

    pub fn function_profile(&self, function: FunctionId) -> Option<&FunctionProfile> {
        self.function_profiles.get(function).and_then(|p| p.as_ref())
    }

    pub fn function_profile_mut(&mut self, function: FunctionId) -> Option<&mut FunctionProfile> {
        self.function_profiles.get_mut(function).and_then(|p| p.as_mut())
    }

    pub fn get_or_create_function_profile(&mut self, function: FunctionId) -> &mut FunctionProfile {
        self.ensure_snapshot();
        if function >= self.function_profiles.len() {
            self.function_profiles.resize(function + 1, None);
        }
        let num_snapshots = self.snapshots.len();
        let num_metrics = self.num_metrics;
        self.function_profiles[function]
            .get_or_insert_with(|| FunctionProfile::new(function, num_snapshots, num_metrics))
    }

    pub fn set_function_profile(&mut self, profile: FunctionProfile) {
        let function = profile.function();
        if function >= self.function_profiles.len() {
            self.function_profiles.resize(function + 1, None);
        }
        self.function_profiles[function] = Some(profile);
    }

    /// The profiles that are present, in function id order.

    pub fn function_profiles(&self) -> impl Iterator<Item = &FunctionProfile> {
        self.function_profiles.iter().flatten()
    }

    pub fn function_profiles_mut(&mut self) -> impl Iterator<Item = &mut FunctionProfile> {
        self.function_profiles.iter_mut().flatten()
    }

    // User event profiles.

    pub fn user_event_profile(&self, user_event: UserEventId) -> Option<&UserEventProfile> {
        self.user_event_profiles.get(user_event).and_then(|p| p.as_ref())
    }

    pub fn get_or_create_user_event_profile(
        &mut self,
        user_event: UserEventId,
    ) -> &mut UserEventProfile {
        self.ensure_snapshot();
        if user_event >= self.user_event_profiles.len() {
            self.user_event_profiles.resize(user_event + 1, None);
        }
        let num_snapshots = self.snapshots.len();
        self.user_event_profiles[user_event]
            .get_or_insert_with(|| UserEventProfile::new(user_event, num_snapshots))
    }

    pub fn set_user_event_profile(&mut self, profile: UserEventProfile) {
        let user_event = profile.user_event();
        if user_event >= self.user_event_profiles.len() {
            self.user_event_profiles.resize(user_event + 1, None);
        }
        self.user_event_profiles[user_event] = Some(profile);
    }

    pub fn user_event_profiles(&self) -> impl Iterator<Item = &UserEventProfile> {
        self.user_event_profiles.iter().flatten()
    }

    // Maxima and percentages.

    /// Recompute the per-(snapshot, metric) maximum inclusive and exclusive values that the
    /// percentage accessors are relative to.

    pub fn update_maxes(&mut self) {
        let num_snapshots = self.num_snapshots();
        let mut max_inclusive = vec![vec![0.0; self.num_metrics]; num_snapshots];
        let mut max_exclusive = vec![vec![0.0; self.num_metrics]; num_snapshots];
        for p in self.function_profiles.iter().flatten() {
            for s in 0..num_snapshots {
                for m in 0..self.num_metrics {
                    let v = p.values(s, m);
                    max_inclusive[s][m] = f64::max(max_inclusive[s][m], v.inclusive);
                    max_exclusive[s][m] = f64::max(max_exclusive[s][m], v.exclusive);
                }
            }
        }
        self.max_inclusive = max_inclusive;
        self.max_exclusive = max_exclusive;
    }

    pub fn max_inclusive(&self, snapshot: usize, metric: usize) -> f64 {
        self.max_inclusive.get(snapshot).and_then(|v| v.get(metric)).copied().unwrap_or(0.0)
    }

    pub fn max_exclusive(&self, snapshot: usize, metric: usize) -> f64 {
        self.max_exclusive.get(snapshot).and_then(|v| v.get(metric)).copied().unwrap_or(0.0)
    }

    /// Inclusive value of `function` as a percentage of the largest inclusive value on the thread.

    pub fn inclusive_percent(&self, function: FunctionId, snapshot: usize, metric: usize) -> f64 {
        let max = self.max_inclusive(snapshot, metric);
        match self.function_profile(function) {
            Some(p) if max > 0.0 => p.inclusive(snapshot, metric) / max * 100.0,
            _ => 0.0,
        }
    }

    /// Exclusive value of `function` as a percentage of the largest inclusive value on the thread.

    pub fn exclusive_percent(&self, function: FunctionId, snapshot: usize, metric: usize) -> f64 {
        let max = self.max_inclusive(snapshot, metric);
        match self.function_profile(function) {
            Some(p) if max > 0.0 => p.exclusive(snapshot, metric) / max * 100.0,
            _ => 0.0,
        }
    }

    pub(crate) fn call_graph_cell(&self) -> &OnceLock<CallGraph> {
        &self.call_graph
    }
}

#[test]
fn test_resize_metrics_preserves_values() {
    let mut t = Thread::new(0, 0, 0, 1);
    let p = t.get_or_create_function_profile(3);
    p.set_calls(0, 2.0);
    p.set_exclusive(0, 0, 10.0);
    p.set_inclusive(0, 0, 15.0);
    t.resize_metrics(2);
    let p = t.function_profile(3).unwrap();
    assert!(p.num_metrics() == 2);
    assert!(p.exclusive(0, 0) == 10.0);
    assert!(p.inclusive(0, 0) == 15.0);
    assert!(p.inclusive(0, 1) == 0.0);
    assert!(p.calls(0) == 2.0);
    assert!(t.function_profile(0).is_none());
    assert!(t.function_profile(17).is_none());
}

#[test]
fn test_snapshots_are_seeded_from_previous() {
    let mut t = Thread::new(0, 0, 0, 1);
    assert!(t.add_snapshot("first", None) == 0);
    let p = t.get_or_create_function_profile(0);
    p.set_calls(0, 1.0);
    p.set_inclusive(0, 0, 5.0);
    assert!(t.add_snapshot("second", None) == 1);
    let p = t.function_profile_mut(0).unwrap();
    assert!(p.inclusive(1, 0) == 5.0);
    p.set_inclusive(1, 0, 8.0);
    assert!(p.inclusive(0, 0) == 5.0);
    assert!(p.inclusive(1, 0) == 8.0);
    assert!(t.num_snapshots() == 2);
    assert!(t.snapshots()[1].name == "second");
}

#[test]
fn test_per_call_and_percent() {
    let mut t = Thread::new(0, 0, 0, 1);
    let p = t.get_or_create_function_profile(0);
    p.set_calls(0, 4.0);
    p.set_inclusive(0, 0, 100.0);
    p.set_exclusive(0, 0, 40.0);
    let q = t.get_or_create_function_profile(1);
    q.set_inclusive(0, 0, 50.0);
    t.update_maxes();
    let p = t.function_profile(0).unwrap();
    assert!(p.inclusive_per_call(0, 0) == 25.0);
    assert!(p.exclusive_per_call(0, 0) == 10.0);
    assert!(t.function_profile(1).unwrap().inclusive_per_call(0, 0) == 0.0);
    assert!(t.inclusive_percent(1, 0, 0) == 50.0);
    assert!(t.exclusive_percent(0, 0, 0) == 40.0);
}

#[test]
fn test_user_event_merge() {
    let a = UserEventStats { num_samples: 2.0, min: 1.0, max: 3.0, mean: 2.0, sum_squared: 10.0 };
    let b = UserEventStats { num_samples: 6.0, min: 0.5, max: 2.0, mean: 1.0, sum_squared: 7.0 };
    let m = a.merge(&b);
    assert!(m.num_samples == 8.0);
    assert!(m.min == 0.5);
    assert!(m.max == 3.0);
    assert!((m.mean - 1.25).abs() < 1e-12);
    assert!(m.sum_squared == 17.0);
    assert!(a.merge(&UserEventStats::default()) == a);
    assert!(UserEventStats::default().merge(&b) == b);
}

#[test]
fn test_user_event_std_dev_never_negative() {
    // sumsq/n is a hair below mean^2 because of rounding in the producer
    let s = UserEventStats { num_samples: 3.0, min: 0.1, max: 0.1, mean: 0.1, sum_squared: 0.03 };
    assert!(s.std_dev() >= 0.0);
    let s = UserEventStats { num_samples: 2.0, min: 1.0, max: 3.0, mean: 2.0, sum_squared: 10.0 };
    assert!(s.std_dev() == 1.0);
}

#[test]
fn test_aggregate_sentinels() {
    for kind in ALL_AGGREGATES {
        assert!(AggregateKind::from_sentinel(kind.sentinel()) == Some(kind));
        assert!(AggregateKind::from_name(kind.name()) == Some(kind));
        let t = Thread::new_aggregate(kind, 1);
        assert!(t.aggregate_kind() == Some(kind));
    }
    assert!(AggregateKind::Mean.sentinel() == -1);
    assert!(AggregateKind::StdDevAll.sentinel() == -7);
    assert!(AggregateKind::from_sentinel(0).is_none());
    assert!(!Thread::new(0, 0, 0, 1).is_aggregate());
}
