// Load a trial from, and store a trial into, a relational profile database.
//
// Two schema generations are supported.  They share the trial, metric and atomic (user event)
// tables and differ in how interval (function) data are stored:
//
//   trial(id, name)
//   metric(id, trial, name)
//   atomic_event(id, trial, name, group_name)
//   atomic_location_profile(atomic_event, node, context, thread, sample_count, maximum_value,
//                           minimum_value, mean_value, standard_deviation)
//   trial_metadata(trial, name, value)                                          (optional)
//
//   Legacy:
//     interval_event(id, trial, name, group_name)
//     interval_location_profile(interval_event, node, context, thread, metric, inclusive,
//                               exclusive, num_calls, num_subroutines)
//
//   Current:
//     timer(id, trial, name, group_names)
//     timer_value(timer, node, context, thread, metric, inclusive_value, exclusive_value,
//                 num_calls, num_subroutines)
//
// Group names are '|'-separated.  The database holds standard deviations for user events, not sums
// of squares; we convert with sumsqr = n * (sd^2 + mean^2).
//
// Loading uses one query per table kind rather than one per thread or function: the metrics are
// read first and their ids are then used to restrict the interval query.  The schema itself is
// not created here.

use crate::control::LoadControl;
use crate::diag::DiagnosticKind;
use crate::metadata::{parse_start_time, START_TIME_KEY};
use crate::model::DataSource;
use crate::thread::UserEventStats;
use crate::{MetricId, ThreadKey};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rusqlite::{params, Connection};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    Legacy,
    Current,
}

impl SchemaVersion {
    fn interval_query(self, metric_ids: &str) -> String {
        match self {
            SchemaVersion::Legacy => format!(
                "SELECT e.name, e.group_name, p.metric, p.node, p.context, p.thread,
                        p.inclusive, p.exclusive, p.num_calls, p.num_subroutines
                 FROM interval_location_profile p JOIN interval_event e ON p.interval_event = e.id
                 WHERE e.trial = ?1 AND p.metric IN ({metric_ids})
                 ORDER BY e.id, p.node, p.context, p.thread"
            ),
            SchemaVersion::Current => format!(
                "SELECT t.name, t.group_names, v.metric, v.node, v.context, v.thread,
                        v.inclusive_value, v.exclusive_value, v.num_calls, v.num_subroutines
                 FROM timer_value v JOIN timer t ON v.timer = t.id
                 WHERE t.trial = ?1 AND v.metric IN ({metric_ids})
                 ORDER BY t.id, v.node, v.context, v.thread"
            ),
        }
    }

    fn insert_event(self) -> &'static str {
        match self {
            SchemaVersion::Legacy => {
                "INSERT INTO interval_event (trial, name, group_name) VALUES (?1, ?2, ?3)"
            }
            SchemaVersion::Current => {
                "INSERT INTO timer (trial, name, group_names) VALUES (?1, ?2, ?3)"
            }
        }
    }

    fn insert_interval(self) -> &'static str {
        match self {
            SchemaVersion::Legacy => {
                "INSERT INTO interval_location_profile
                   (interval_event, node, context, thread, metric, inclusive, exclusive,
                    num_calls, num_subroutines)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            }
            SchemaVersion::Current => {
                "INSERT INTO timer_value
                   (timer, node, context, thread, metric, inclusive_value, exclusive_value,
                    num_calls, num_subroutines)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            }
        }
    }
}

struct IntervalRow {
    name: String,
    groups: Option<String>,
    metric: i64,
    key: ThreadKey,
    inclusive: f64,
    exclusive: f64,
    calls: f64,
    subroutines: f64,
}

struct AtomicRow {
    name: String,
    key: ThreadKey,
    stats: UserEventStats,
}

fn has_table(conn: &Connection, table: &str) -> Result<bool> {
    let n: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .context("Failed to query the schema")?;
    Ok(n > 0)
}

// Negative ids are reserved for the aggregate threads.
fn bad_thread_key(ds: &mut DataSource, source: &str, (n, c, t): ThreadKey, what: &str) -> bool {
    if n < 0 || c < 0 || t < 0 {
        ds.record(
            DiagnosticKind::RecordCorruption,
            source,
            format!("Negative thread id {n}.{c}.{t} for {what}"),
        );
        return true;
    }
    false
}

fn split_groups(groups: &str) -> impl Iterator<Item = &str> {
    groups.split('|').map(|g| g.trim()).filter(|g| !g.is_empty())
}

/// Read one trial.  Any failing query fails the load.

pub fn load_trial(
    conn: &Connection,
    trial_id: i64,
    schema: SchemaVersion,
    control: &LoadControl,
) -> Result<DataSource> {
    let source = format!("trial {trial_id}");
    let mut ds = DataSource::new();
    control.set_total(4);

    let name: Option<String> = match conn.query_row(
        "SELECT name FROM trial WHERE id = ?1",
        [trial_id],
        |row| row.get(0),
    ) {
        Ok(name) => name,
        Err(rusqlite::Error::QueryReturnedNoRows) => bail!("No trial with id {trial_id}"),
        Err(e) => return Err(e).context("Failed to query trial"),
    };
    ds.name = name;

    // Metrics, and the table from database ids to ours.
    let mut metrics = HashMap::<i64, MetricId>::new();
    {
        let mut stmt = conn
            .prepare("SELECT id, name FROM metric WHERE trial = ?1 ORDER BY id")
            .context("Failed to prepare metric query")?;
        let rows = stmt
            .query_map([trial_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query metrics")?;
        for row in rows {
            let (id, name) = row.context("Failed to read metric row")?;
            metrics.insert(id, ds.add_metric(&name));
        }
    }
    control.advance();

    if !metrics.is_empty() {
        let ids = metrics.keys().sorted().join(",");
        let mut stmt = conn
            .prepare(&schema.interval_query(&ids))
            .context("Failed to prepare interval query")?;
        let rows = stmt
            .query_map([trial_id], |row| {
                Ok(IntervalRow {
                    name: row.get(0)?,
                    groups: row.get(1)?,
                    metric: row.get(2)?,
                    key: (row.get(3)?, row.get(4)?, row.get(5)?),
                    inclusive: row.get(6)?,
                    exclusive: row.get(7)?,
                    calls: row.get(8)?,
                    subroutines: row.get(9)?,
                })
            })
            .context("Failed to query interval data")?;
        for row in rows {
            control.check()?;
            let r = row.context("Failed to read interval row")?;
            let metric = match metrics.get(&r.metric) {
                Some(m) => *m,
                None => {
                    ds.record(
                        DiagnosticKind::RecordCorruption,
                        &source,
                        format!("Unknown metric {} for {}", r.metric, r.name),
                    );
                    continue;
                }
            };
            if bad_thread_key(&mut ds, &source, r.key, &r.name) {
                continue;
            }
            let f = ds.intern_function(&r.name);
            for g in split_groups(r.groups.as_deref().unwrap_or_default()) {
                let gid = ds.intern_group(g);
                ds.add_function_to_group(f, gid);
            }
            let (n, c, t) = r.key;
            let p = ds.get_or_create_thread(n, c, t).get_or_create_function_profile(f);
            p.set_calls(0, r.calls);
            p.set_subroutines(0, r.subroutines);
            p.set_inclusive(0, metric, r.inclusive);
            p.set_exclusive(0, metric, r.exclusive);
        }
    }
    control.advance();

    {
        let mut stmt = conn
            .prepare(
                "SELECT e.name, p.node, p.context, p.thread, p.sample_count, p.maximum_value,
                        p.minimum_value, p.mean_value, p.standard_deviation
                 FROM atomic_location_profile p JOIN atomic_event e ON p.atomic_event = e.id
                 WHERE e.trial = ?1
                 ORDER BY e.id, p.node, p.context, p.thread",
            )
            .context("Failed to prepare atomic query")?;
        let rows = stmt
            .query_map([trial_id], |row| {
                let num_samples: f64 = row.get(4)?;
                let mean: f64 = row.get(7)?;
                let sd: f64 = row.get(8)?;
                Ok(AtomicRow {
                    name: row.get(0)?,
                    key: (row.get(1)?, row.get(2)?, row.get(3)?),
                    stats: UserEventStats {
                        num_samples,
                        max: row.get(5)?,
                        min: row.get(6)?,
                        mean,
                        sum_squared: num_samples * (sd * sd + mean * mean),
                    },
                })
            })
            .context("Failed to query atomic data")?;
        for row in rows {
            control.check()?;
            let r = row.context("Failed to read atomic row")?;
            if bad_thread_key(&mut ds, &source, r.key, &r.name) {
                continue;
            }
            let e = ds.intern_user_event(&r.name);
            let (n, c, t) = r.key;
            ds.get_or_create_thread(n, c, t)
                .get_or_create_user_event_profile(e)
                .set_stats(0, r.stats);
        }
    }
    control.advance();

    if has_table(conn, "trial_metadata")? {
        let mut stmt = conn
            .prepare("SELECT name, value FROM trial_metadata WHERE trial = ?1")
            .context("Failed to prepare metadata query")?;
        let rows = stmt
            .query_map([trial_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .context("Failed to query metadata")?;
        for row in rows {
            let (k, v) = row.context("Failed to read metadata row")?;
            let v = v.unwrap_or_default();
            if k == START_TIME_KEY && ds.start_time.is_none() {
                ds.start_time = parse_start_time(&v);
            }
            ds.add_metadata(&k, &v);
        }
    }
    control.advance();

    log::info!(
        "Loaded {source}: {} threads, {} functions, {} metrics",
        ds.num_threads(),
        ds.functions().len(),
        ds.num_metrics()
    );
    Ok(ds)
}

/// Store the real threads of `ds` as a new trial and return its id.  Function values are taken
/// from each thread's last snapshot.  The upload is a single transaction: if anything fails
/// nothing is stored.

pub fn upload_trial(
    conn: &mut Connection,
    ds: &DataSource,
    name: &str,
    schema: SchemaVersion,
) -> Result<i64> {
    let tx = conn
        .transaction()
        .context("Failed to begin upload transaction")?;
    tx.execute("INSERT INTO trial (name) VALUES (?1)", params![name])
        .context("Failed to insert trial")?;
    let trial_id = tx.last_insert_rowid();

    let mut metric_ids = vec![];
    {
        let mut stmt = tx
            .prepare("INSERT INTO metric (trial, name) VALUES (?1, ?2)")
            .context("Failed to prepare metric insert")?;
        for m in ds.metrics() {
            stmt.execute(params![trial_id, m.name])
                .context("Failed to insert metric")?;
            metric_ids.push(tx.last_insert_rowid());
        }
    }

    let group_names = |groups: &[usize]| {
        groups
            .iter()
            .filter_map(|g| ds.groups().get(*g))
            .map(|g| g.name.as_str())
            .join("|")
    };

    // Only functions that some thread has data for.
    let mut event_ids = HashMap::new();
    {
        let mut stmt = tx
            .prepare(schema.insert_event())
            .context("Failed to prepare event insert")?;
        for f in ds.functions() {
            if ds.threads().any(|t| t.function_profile(f.id).is_some()) {
                stmt.execute(params![trial_id, f.name, group_names(&f.groups)])
                    .context("Failed to insert event")?;
                event_ids.insert(f.id, tx.last_insert_rowid());
            }
        }
    }
    {
        let mut stmt = tx
            .prepare(schema.insert_interval())
            .context("Failed to prepare interval insert")?;
        for t in ds.threads() {
            let s = t.current_snapshot();
            for p in t.function_profiles() {
                let event = match event_ids.get(&p.function()) {
                    Some(e) => *e,
                    None => continue,
                };
                for (m, db_metric) in metric_ids.iter().copied().enumerate() {
                    stmt.execute(params![
                        event,
                        t.node(),
                        t.context(),
                        t.thread(),
                        db_metric,
                        p.inclusive(s, m),
                        p.exclusive(s, m),
                        p.calls(s),
                        p.subroutines(s)
                    ])
                    .context("Failed to insert interval data")?;
                }
            }
        }
    }

    let mut atomic_ids = HashMap::new();
    {
        let mut stmt = tx
            .prepare("INSERT INTO atomic_event (trial, name, group_name) VALUES (?1, ?2, NULL)")
            .context("Failed to prepare atomic event insert")?;
        for e in ds.user_events() {
            stmt.execute(params![trial_id, e.name])
                .context("Failed to insert atomic event")?;
            atomic_ids.insert(e.id, tx.last_insert_rowid());
        }
    }
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO atomic_location_profile
                   (atomic_event, node, context, thread, sample_count, maximum_value,
                    minimum_value, mean_value, standard_deviation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .context("Failed to prepare atomic data insert")?;
        for t in ds.threads() {
            let s = t.current_snapshot();
            for p in t.user_event_profiles() {
                let event = match atomic_ids.get(&p.user_event()) {
                    Some(e) => *e,
                    None => continue,
                };
                let stats = p.stats(s);
                stmt.execute(params![
                    event,
                    t.node(),
                    t.context(),
                    t.thread(),
                    stats.num_samples,
                    stats.max,
                    stats.min,
                    stats.mean,
                    stats.std_dev()
                ])
                .context("Failed to insert atomic data")?;
            }
        }
    }

    if !ds.metadata.is_empty() && has_table(&tx, "trial_metadata")? {
        let mut stmt = tx
            .prepare("INSERT INTO trial_metadata (trial, name, value) VALUES (?1, ?2, ?3)")
            .context("Failed to prepare metadata insert")?;
        for (k, v) in &ds.metadata {
            stmt.execute(params![trial_id, k, v])
                .context("Failed to insert metadata")?;
        }
    }

    tx.commit().context("Failed to commit upload")?;
    log::info!("Uploaded trial {trial_id} \"{name}\"");
    Ok(trial_id)
}

#[cfg(test)]
fn create_tables(conn: &Connection, schema: SchemaVersion) {
    conn.execute_batch(
        "CREATE TABLE trial (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE metric (id INTEGER PRIMARY KEY, trial INTEGER NOT NULL, name TEXT NOT NULL);
         CREATE TABLE atomic_event (id INTEGER PRIMARY KEY, trial INTEGER NOT NULL,
                                    name TEXT NOT NULL, group_name TEXT);
         CREATE TABLE atomic_location_profile (atomic_event INTEGER NOT NULL, node INTEGER,
                                               context INTEGER, thread INTEGER,
                                               sample_count INTEGER, maximum_value REAL,
                                               minimum_value REAL, mean_value REAL,
                                               standard_deviation REAL);
         CREATE TABLE trial_metadata (trial INTEGER NOT NULL, name TEXT NOT NULL, value TEXT);",
    )
    .unwrap();
    match schema {
        SchemaVersion::Legacy => conn
            .execute_batch(
                "CREATE TABLE interval_event (id INTEGER PRIMARY KEY, trial INTEGER NOT NULL,
                                              name TEXT NOT NULL, group_name TEXT);
                 CREATE TABLE interval_location_profile (interval_event INTEGER NOT NULL,
                                                         node INTEGER, context INTEGER,
                                                         thread INTEGER, metric INTEGER,
                                                         inclusive REAL, exclusive REAL,
                                                         num_calls REAL, num_subroutines REAL);",
            )
            .unwrap(),
        SchemaVersion::Current => conn
            .execute_batch(
                "CREATE TABLE timer (id INTEGER PRIMARY KEY, trial INTEGER NOT NULL,
                                     name TEXT NOT NULL, group_names TEXT);
                 CREATE TABLE timer_value (timer INTEGER NOT NULL, node INTEGER, context INTEGER,
                                           thread INTEGER, metric INTEGER,
                                           inclusive_value REAL, exclusive_value REAL,
                                           num_calls REAL, num_subroutines REAL);",
            )
            .unwrap(),
    }
}

#[cfg(test)]
fn single_tree() -> DataSource {
    crate::profilefile::load_profile_tree(
        std::path::Path::new("../profile_test_data/flat/single"),
        &crate::configs::LoadConfig::default(),
        &LoadControl::new(),
    )
    .unwrap()
}

#[cfg(test)]
fn assert_same_data(a: &DataSource, b: &DataSource) {
    assert!(a.num_threads() == b.num_threads());
    assert!(a.num_metrics() == b.num_metrics());
    for ta in a.threads() {
        let tb = b.thread(ta.key()).unwrap();
        for pa in ta.function_profiles() {
            let name = &a.function(pa.function()).unwrap().name;
            let pb = tb.function_profile(b.function_id(name).unwrap()).unwrap();
            assert!(pa.calls(0) == pb.calls(0));
            assert!(pa.subroutines(0) == pb.subroutines(0));
            for m in a.metrics() {
                let mb = b.metric_id(&m.name).unwrap();
                assert!(pa.inclusive(0, m.id) == pb.inclusive(0, mb));
                assert!(pa.exclusive(0, m.id) == pb.exclusive(0, mb));
            }
        }
        for ea in ta.user_event_profiles() {
            let name = &a.user_events()[ea.user_event()].name;
            let sb = tb.user_event_profile(b.user_event_id(name).unwrap()).unwrap().stats(0);
            let sa = ea.stats(0);
            assert!(sa.num_samples == sb.num_samples);
            assert!(sa.mean == sb.mean && sa.min == sb.min && sa.max == sb.max);
            assert!((sa.sum_squared - sb.sum_squared).abs() < 1e-6);
        }
    }
}

#[test]
fn test_round_trip_current_schema() {
    let ds = single_tree();
    let mut conn = Connection::open_in_memory().unwrap();
    create_tables(&conn, SchemaVersion::Current);
    let id = upload_trial(&mut conn, &ds, "single", SchemaVersion::Current).unwrap();

    let loaded = load_trial(&conn, id, SchemaVersion::Current, &LoadControl::new()).unwrap();
    assert!(loaded.name.as_deref() == Some("single"));
    assert!(loaded.diagnostics().is_empty());
    assert_same_data(&ds, &loaded);
    assert!(loaded.metadata.get("Node Name").map(|s| s.as_str()) == Some("n001"));
    assert!(loaded.start_time == ds.start_time);

    let foo = loaded.function_id("foo").unwrap();
    assert!(loaded.function_in_group(foo, "TAU_USER"));
    assert!(loaded.has_callpaths());
}

#[test]
fn test_round_trip_legacy_schema() {
    let ds = single_tree();
    let mut conn = Connection::open_in_memory().unwrap();
    create_tables(&conn, SchemaVersion::Legacy);
    let first = upload_trial(&mut conn, &ds, "first", SchemaVersion::Legacy).unwrap();
    let second = upload_trial(&mut conn, &ds, "second", SchemaVersion::Legacy).unwrap();
    assert!(first != second);

    // The trials don't bleed into each other
    let loaded = load_trial(&conn, second, SchemaVersion::Legacy, &LoadControl::new()).unwrap();
    assert_same_data(&ds, &loaded);
    assert!(load_trial(&conn, 99, SchemaVersion::Legacy, &LoadControl::new()).is_err());
}

#[test]
fn test_upload_is_atomic() {
    let ds = single_tree();
    let mut conn = Connection::open_in_memory().unwrap();
    create_tables(&conn, SchemaVersion::Current);
    // Fails after the interval data, on the user events
    conn.execute_batch("DROP TABLE atomic_location_profile").unwrap();
    assert!(upload_trial(&mut conn, &ds, "doomed", SchemaVersion::Current).is_err());
    let trials: i64 = conn.query_row("SELECT count(*) FROM trial", [], |r| r.get(0)).unwrap();
    let values: i64 = conn.query_row("SELECT count(*) FROM timer_value", [], |r| r.get(0)).unwrap();
    assert!(trials == 0 && values == 0);
}

#[test]
fn test_load_with_wrong_schema() {
    let ds = single_tree();
    let mut conn = Connection::open_in_memory().unwrap();
    create_tables(&conn, SchemaVersion::Current);
    let id = upload_trial(&mut conn, &ds, "single", SchemaVersion::Current).unwrap();
    assert!(load_trial(&conn, id, SchemaVersion::Legacy, &LoadControl::new()).is_err());
}

#[test]
fn test_load_hand_written_rows() {
    let conn = Connection::open_in_memory().unwrap();
    create_tables(&conn, SchemaVersion::Legacy);
    conn.execute_batch(
        "INSERT INTO trial (id, name) VALUES (7, 'hand');
         INSERT INTO metric (id, trial, name) VALUES (3, 7, 'Time'), (4, 8, 'Other');
         INSERT INTO interval_event (id, trial, name, group_name)
           VALUES (10, 7, 'main', 'TAU_DEFAULT'), (11, 7, 'io', 'TAU_USER|IO');
         INSERT INTO interval_location_profile VALUES (10, 0, 0, 0, 3, 100, 60, 1, 1);
         INSERT INTO interval_location_profile VALUES (11, 0, 0, 0, 3, 40, 40, 8, 0);
         INSERT INTO interval_location_profile VALUES (11, 0, 0, 0, 4, 1, 1, 1, 0);
         INSERT INTO interval_location_profile VALUES (10, 1, 0, 0, 3, 90, 90, 1, 0);
         INSERT INTO atomic_event (id, trial, name, group_name) VALUES (20, 7, 'bytes', NULL);
         INSERT INTO atomic_location_profile VALUES (20, 1, 0, 0, 4, 8, 2, 5, 2);",
    )
    .unwrap();
    let control = LoadControl::new();
    let ds = load_trial(&conn, 7, SchemaVersion::Legacy, &control).unwrap();
    assert!(control.progress() == 1.0);
    assert!(ds.num_metrics() == 1);
    assert!(ds.num_threads() == 2);
    let io = ds.function_id("io").unwrap();
    assert!(ds.function_in_group(io, "IO"));
    let p = ds.thread((0, 0, 0)).unwrap().function_profile(io).unwrap();
    assert!(p.calls(0) == 8.0 && p.inclusive(0, 0) == 40.0);
    let e = ds.user_event_id("bytes").unwrap();
    let s = ds.thread((1, 0, 0)).unwrap().user_event_profile(e).unwrap().stats(0);
    assert!(s.sum_squared == 4.0 * (4.0 + 25.0));
    assert!(s.std_dev() == 2.0);
}

#[test]
fn test_negative_thread_ids_are_skipped() {
    let conn = Connection::open_in_memory().unwrap();
    create_tables(&conn, SchemaVersion::Legacy);
    conn.execute_batch(
        "INSERT INTO trial (id, name) VALUES (1, 'neg');
         INSERT INTO metric (id, trial, name) VALUES (1, 1, 'Time');
         INSERT INTO interval_event (id, trial, name, group_name) VALUES (1, 1, 'main', NULL);
         INSERT INTO interval_location_profile VALUES (1, 0, 0, 0, 1, 10, 10, 1, 0);
         INSERT INTO interval_location_profile VALUES (1, -1, 0, 0, 1, 20, 20, 1, 0);
         INSERT INTO atomic_event (id, trial, name, group_name) VALUES (2, 1, 'bytes', NULL);
         INSERT INTO atomic_location_profile VALUES (2, 0, -3, 0, 1, 1, 1, 1, 0);",
    )
    .unwrap();
    let ds = load_trial(&conn, 1, SchemaVersion::Legacy, &LoadControl::new()).unwrap();
    assert!(ds.num_threads() == 1);
    assert!(ds.thread((-1, 0, 0)).is_none());
    assert!(ds.threads().all(|t| t.aggregate_kind().is_none()));
    assert!(ds.diagnostics().len() == 2);
    assert!(ds.diagnostics().iter().all(|d| d.kind == DiagnosticKind::RecordCorruption));
}
