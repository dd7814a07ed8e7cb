// Compute the synthetic aggregate threads (mean, total, standard deviation, min, max) across the
// real threads of a trial.
//
// This runs once, after a load has completed.  It never fails: absent profiles and empty trials
// simply produce zeroes, or no entry at all for entities that were never observed.
//
// The standard deviation is computed in one pass from the running sum and sum of squares, as
// variance = Σx²/n - mean², clamped at zero before the square root.  This loses precision for large
// values with small spread; we keep it because it is what consumers of these numbers have always
// been given.
//
// A thread that has fewer snapshots than the trial contributes its last snapshot to the later
// ones, since snapshots are cumulative.

use crate::model::DataSource;
use crate::thread::{AggregateKind, Thread, UserEventStats, ALL_AGGREGATES};

use itertools::Itertools;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: usize,
    sum: f64,
    sum_squared: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn add(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = f64::min(self.min, x);
            self.max = f64::max(self.max, x);
        }
        self.count += 1;
        self.sum += x;
        self.sum_squared += x * x;
    }

    fn value(&self, kind: AggregateKind, num_threads: usize) -> f64 {
        match kind {
            AggregateKind::Total => self.sum,
            AggregateKind::Mean => mean(self.sum, self.count),
            AggregateKind::MeanAll => mean(self.sum, num_threads),
            AggregateKind::StdDev => std_dev(self.sum, self.sum_squared, self.count),
            AggregateKind::StdDevAll => std_dev(self.sum, self.sum_squared, num_threads),
            AggregateKind::Min => self.min,
            AggregateKind::Max => self.max,
        }
    }
}

fn mean(sum: f64, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn std_dev(sum: f64, sum_squared: f64, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let m = sum / n as f64;
    let variance = sum_squared / n as f64 - m * m;
    f64::max(variance, 0.0).sqrt()
}

// Accumulators for one function in one snapshot.
struct FunctionAccumulators {
    calls: Accumulator,
    subroutines: Accumulator,
    inclusive: Vec<Accumulator>,
    exclusive: Vec<Accumulator>,
}

// Accumulators for one user event in one snapshot, plus the pooled statistics.
#[derive(Default)]
struct UserEventAccumulators {
    num_samples: Accumulator,
    min: Accumulator,
    max: Accumulator,
    mean: Accumulator,
    sum_squared: Accumulator,
    pooled: UserEventStats,
}

/// Build the aggregate threads for the trial and store them on the DataSource, then update the
/// per-thread maxima that percentages are computed from.  Aggregates that the parser read from the
/// input are left alone.

pub fn generate_derived_data(ds: &mut DataSource) {
    let num_threads = ds.num_threads();
    let num_metrics = ds.num_metrics();
    let num_snapshots = ds.num_snapshots();
    let kinds = ALL_AGGREGATES
        .iter()
        .copied()
        .filter(|k| !ds.is_materialized(*k))
        .collect::<Vec<_>>();

    let template = ds
        .threads()
        .max_by_key(|t| t.num_snapshots())
        .map(|t| t.snapshots().to_vec())
        .unwrap_or_default();
    let mut aggregates = BTreeMap::new();
    for kind in &kinds {
        let mut t = Thread::new_aggregate(*kind, num_metrics);
        for s in &template {
            t.add_snapshot(&s.name, s.timestamp);
        }
        aggregates.insert(*kind, t);
    }

    for f in 0..ds.functions().len() {
        let mut observed = false;
        let mut accs = (0..num_snapshots)
            .map(|_| FunctionAccumulators {
                calls: Accumulator::default(),
                subroutines: Accumulator::default(),
                inclusive: vec![Accumulator::default(); num_metrics],
                exclusive: vec![Accumulator::default(); num_metrics],
            })
            .collect::<Vec<_>>();
        for p in ds.threads().filter_map(|t| t.function_profile(f)) {
            observed = true;
            let last = p.num_snapshots() - 1;
            for (s, acc) in accs.iter_mut().enumerate() {
                let ts = usize::min(s, last);
                acc.calls.add(p.calls(ts));
                acc.subroutines.add(p.subroutines(ts));
                for m in 0..num_metrics {
                    let v = p.values(ts, m);
                    acc.inclusive[m].add(v.inclusive);
                    acc.exclusive[m].add(v.exclusive);
                }
            }
        }
        if !observed {
            continue;
        }
        for (kind, t) in aggregates.iter_mut() {
            let p = t.get_or_create_function_profile(f);
            for (s, acc) in accs.iter().enumerate() {
                p.set_calls(s, acc.calls.value(*kind, num_threads));
                p.set_subroutines(s, acc.subroutines.value(*kind, num_threads));
                for m in 0..num_metrics {
                    p.set_inclusive(s, m, acc.inclusive[m].value(*kind, num_threads));
                    p.set_exclusive(s, m, acc.exclusive[m].value(*kind, num_threads));
                }
            }
        }
    }

    for e in 0..ds.user_events().len() {
        let mut observed = false;
        let mut accs = (0..num_snapshots)
            .map(|_| UserEventAccumulators::default())
            .collect::<Vec<_>>();
        for p in ds.threads().filter_map(|t| t.user_event_profile(e)) {
            observed = true;
            let last = p.num_snapshots() - 1;
            for (s, acc) in accs.iter_mut().enumerate() {
                let stats = p.stats(usize::min(s, last));
                acc.num_samples.add(stats.num_samples);
                acc.min.add(stats.min);
                acc.max.add(stats.max);
                acc.mean.add(stats.mean);
                acc.sum_squared.add(stats.sum_squared);
                acc.pooled = acc.pooled.merge(&stats);
            }
        }
        if !observed {
            continue;
        }
        for (kind, t) in aggregates.iter_mut() {
            let p = t.get_or_create_user_event_profile(e);
            for (s, acc) in accs.iter().enumerate() {
                p.set_stats(s, user_event_value(acc, *kind, num_threads));
            }
        }
    }

    log::info!(
        "Derived {} over {} threads, {} metrics, {} snapshots",
        kinds.iter().map(|k| k.name()).join(","),
        num_threads,
        num_metrics,
        num_snapshots
    );

    for (kind, t) in aggregates {
        ds.set_aggregate(kind, t);
    }
    for t in ds.threads_mut() {
        t.update_maxes();
    }
    ds.update_aggregate_maxes();
    ds.set_derived_generated();
}

// The Total of a user event is the pooled event, as if all threads' samples had been recorded in
// one series.  The means use the pooled mean, since the per-thread means are weighted by their
// sample counts.  Everything else is the per-field statistic across threads.

fn user_event_value(
    acc: &UserEventAccumulators,
    kind: AggregateKind,
    num_threads: usize,
) -> UserEventStats {
    match kind {
        AggregateKind::Total => acc.pooled,
        AggregateKind::Mean | AggregateKind::MeanAll => UserEventStats {
            num_samples: acc.num_samples.value(kind, num_threads),
            min: acc.min.value(kind, num_threads),
            max: acc.max.value(kind, num_threads),
            mean: acc.pooled.mean,
            sum_squared: acc.sum_squared.value(kind, num_threads),
        },
        _ => UserEventStats {
            num_samples: acc.num_samples.value(kind, num_threads),
            min: acc.min.value(kind, num_threads),
            max: acc.max.value(kind, num_threads),
            mean: acc.mean.value(kind, num_threads),
            sum_squared: acc.sum_squared.value(kind, num_threads),
        },
    }
}

#[cfg(test)]
fn set_function(ds: &mut DataSource, key: (i32, i32, i32), name: &str, calls: f64, excl: f64, incl: f64) {
    let f = ds.intern_function(name);
    let t = ds.get_or_create_thread(key.0, key.1, key.2);
    let p = t.get_or_create_function_profile(f);
    p.set_calls(0, calls);
    p.set_exclusive(0, 0, excl);
    p.set_inclusive(0, 0, incl);
}

#[cfg(test)]
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * f64::max(1.0, f64::max(a.abs(), b.abs()))
}

#[test]
fn test_partial_presence() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    set_function(&mut ds, (0, 0, 0), "main", 1.0, 5.0, 100.0);
    set_function(&mut ds, (0, 0, 1), "main", 1.0, 5.0, 100.0);
    set_function(&mut ds, (0, 0, 2), "main", 1.0, 5.0, 100.0);
    set_function(&mut ds, (0, 0, 0), "X", 2.0, 10.0, 10.0);
    set_function(&mut ds, (0, 0, 2), "X", 4.0, 20.0, 20.0);
    generate_derived_data(&mut ds);

    let x = ds.function_id("X").unwrap();
    let get = |kind| ds.aggregate(kind).unwrap().function_profile(x).unwrap().exclusive(0, 0);
    assert!(get(AggregateKind::Mean) == 15.0);
    assert!(get(AggregateKind::MeanAll) == 10.0);
    assert!(get(AggregateKind::Total) == 30.0);
    assert!(get(AggregateKind::Min) == 10.0);
    assert!(get(AggregateKind::Max) == 20.0);
    assert!(get(AggregateKind::StdDev) == 5.0);
    // values 10, 20, 0: mean 10, variance (100+400)/3 - 100
    assert!(close(get(AggregateKind::StdDevAll), (500.0f64 / 3.0 - 100.0).sqrt()));

    let calls = |kind| ds.aggregate(kind).unwrap().function_profile(x).unwrap().calls(0);
    assert!(calls(AggregateKind::Total) == 6.0);
    assert!(calls(AggregateKind::Mean) == 3.0);
    assert!(ds.derived_generated());

    let total = ds.aggregate(AggregateKind::Total).unwrap();
    assert!(total.key() == (-2, -2, -2));
    assert!(total.max_inclusive(0, 0) == 300.0);
}

#[test]
fn test_mean_times_count_is_total() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    ds.add_metric("PAPI_L1_DCM");
    let names = ["a", "b", "c", "d", "e"];
    let mut seed: u64 = 12345;
    let mut present = BTreeMap::new();
    for t in 0..37 {
        for (i, name) in names.iter().enumerate() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if (seed >> 33) % 3 == 0 && i > 0 {
                continue;
            }
            *present.entry(*name).or_insert(0usize) += 1;
            let f = ds.intern_function(name);
            let th = ds.get_or_create_thread(t / 8, 0, t % 8);
            let p = th.get_or_create_function_profile(f);
            let x = ((seed >> 11) % 1_000_000) as f64 / 7.0;
            p.set_calls(0, (seed % 50) as f64);
            p.set_exclusive(0, 0, x);
            p.set_inclusive(0, 0, x * 2.0);
            p.set_exclusive(0, 1, x * 1e9);
            p.set_inclusive(0, 1, x * 3e9);
        }
    }
    generate_derived_data(&mut ds);
    let mean = ds.aggregate(AggregateKind::Mean).unwrap();
    let total = ds.aggregate(AggregateKind::Total).unwrap();
    let stddev = ds.aggregate(AggregateKind::StdDev).unwrap();
    let stddev_all = ds.aggregate(AggregateKind::StdDevAll).unwrap();
    for name in names {
        let f = ds.function_id(name).unwrap();
        let n = present[name] as f64;
        for m in 0..2 {
            let mp = mean.function_profile(f).unwrap();
            let tp = total.function_profile(f).unwrap();
            assert!(close(mp.inclusive(0, m) * n, tp.inclusive(0, m)));
            assert!(close(mp.exclusive(0, m) * n, tp.exclusive(0, m)));
            assert!(stddev.function_profile(f).unwrap().inclusive(0, m) >= 0.0);
            assert!(stddev_all.function_profile(f).unwrap().exclusive(0, m) >= 0.0);
        }
        assert!(close(mean.function_profile(f).unwrap().calls(0) * n, total.function_profile(f).unwrap().calls(0)));
    }
}

#[test]
fn test_std_dev_single_and_constant() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    set_function(&mut ds, (0, 0, 0), "only", 1.0, 7.0, 7.0);
    for t in 0..5 {
        set_function(&mut ds, (1, 0, t), "flat", 3.0, 1e12 + 0.1, 1e12 + 0.1);
    }
    generate_derived_data(&mut ds);
    let sd = ds.aggregate(AggregateKind::StdDev).unwrap();
    let only = ds.function_id("only").unwrap();
    let flat = ds.function_id("flat").unwrap();
    assert!(sd.function_profile(only).unwrap().exclusive(0, 0) == 0.0);
    let v = sd.function_profile(flat).unwrap().exclusive(0, 0);
    assert!(v >= 0.0 && !v.is_nan());
}

#[test]
fn test_unobserved_function_is_excluded() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    set_function(&mut ds, (0, 0, 0), "main", 1.0, 1.0, 1.0);
    let ghost = ds.intern_function("ghost");
    generate_derived_data(&mut ds);
    for kind in ALL_AGGREGATES {
        assert!(ds.aggregate(kind).unwrap().function_profile(ghost).is_none());
    }
}

#[test]
fn test_empty_trial() {
    let mut ds = DataSource::new();
    generate_derived_data(&mut ds);
    assert!(ds.aggregate(AggregateKind::Mean).unwrap().function_profiles().count() == 0);
}

#[test]
fn test_user_event_aggregates() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    let e = ds.intern_user_event("message size");
    let a = UserEventStats { num_samples: 2.0, min: 1.0, max: 3.0, mean: 2.0, sum_squared: 10.0 };
    let b = UserEventStats { num_samples: 6.0, min: 0.5, max: 2.0, mean: 1.0, sum_squared: 7.0 };
    ds.get_or_create_thread(0, 0, 0).get_or_create_user_event_profile(e).set_stats(0, a);
    ds.get_or_create_thread(0, 0, 1).get_or_create_user_event_profile(e).set_stats(0, b);
    ds.get_or_create_thread(0, 0, 2);
    generate_derived_data(&mut ds);

    let get = |kind| ds.aggregate(kind).unwrap().user_event_profile(e).unwrap().stats(0);
    let total = get(AggregateKind::Total);
    assert!(total.num_samples == 8.0);
    assert!(close(total.mean, 1.25));
    assert!(total.sum_squared == 17.0);
    assert!(total.min == 0.5 && total.max == 3.0);

    let mean = get(AggregateKind::Mean);
    assert!(mean.num_samples == 4.0);
    assert!(close(mean.mean, 1.25));
    assert!(mean.max == 2.5);

    let mean_all = get(AggregateKind::MeanAll);
    assert!(close(mean_all.num_samples, 8.0 / 3.0));

    assert!(get(AggregateKind::Min).num_samples == 2.0);
    assert!(get(AggregateKind::Max).mean == 2.0);
    assert!(get(AggregateKind::StdDev).num_samples == 2.0);
}

#[test]
fn test_materialized_aggregates_are_kept() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    set_function(&mut ds, (0, 0, 0), "main", 1.0, 4.0, 4.0);
    let f = ds.function_id("main").unwrap();
    ds.materialize_aggregate(AggregateKind::Mean)
        .get_or_create_function_profile(f)
        .set_exclusive(0, 0, 99.0);
    generate_derived_data(&mut ds);
    let mean = ds.aggregate(AggregateKind::Mean).unwrap();
    assert!(mean.function_profile(f).unwrap().exclusive(0, 0) == 99.0);
    let total = ds.aggregate(AggregateKind::Total).unwrap();
    assert!(total.function_profile(f).unwrap().exclusive(0, 0) == 4.0);
}

#[test]
fn test_short_threads_contribute_last_snapshot() {
    let mut ds = DataSource::new();
    ds.add_metric("Time");
    let f = ds.intern_function("main");
    {
        let t = ds.get_or_create_thread(0, 0, 0);
        t.add_snapshot("s0", None);
        t.get_or_create_function_profile(f).set_inclusive(0, 0, 1.0);
        t.add_snapshot("s1", None);
        t.function_profile_mut(f).unwrap().set_inclusive(1, 0, 3.0);
    }
    ds.get_or_create_thread(0, 0, 1)
        .get_or_create_function_profile(f)
        .set_inclusive(0, 0, 5.0);
    generate_derived_data(&mut ds);
    let total = ds.aggregate(AggregateKind::Total).unwrap();
    assert!(total.num_snapshots() == 2);
    assert!(total.snapshots()[1].name == "s1");
    let p = total.function_profile(f).unwrap();
    assert!(p.inclusive(0, 0) == 6.0);
    assert!(p.inclusive(1, 0) == 8.0);
}
