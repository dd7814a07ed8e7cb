// Load one trial from one source and compute its derived data.
//
// The source kind is chosen once by the caller.  Exactly one parser fills a fresh DataSource, and
// the derived statistics are then computed once, before the DataSource is handed back.  Call paths
// are not resolved here; that happens per thread on first request.

use crate::configs::LoadConfig;
use crate::control::LoadControl;
use crate::database::{self, SchemaVersion};
use crate::derived::generate_derived_data;
use crate::model::DataSource;
use crate::profilefile::load_profile_tree;
use crate::sampler::load_sampler_files;
use crate::snapshotxml::load_snapshot_xml;
use crate::tracesummary::load_trace_summary;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A directory of profile.N.C.T files, or of MULTI__<metric> directories holding them.
    FlatProfiles(PathBuf),
    TraceSummary(PathBuf),
    SnapshotXml(PathBuf),
    /// Sampler dumps, one node per file in the given order.
    Sampler(Vec<PathBuf>),
    /// A trial in an SQLite profile database, opened read-only.
    Database {
        path: PathBuf,
        trial_id: i64,
        schema: SchemaVersion,
    },
}

impl Source {
    pub fn describe(&self) -> String {
        match self {
            Source::FlatProfiles(p) => format!("profiles in {}", p.display()),
            Source::TraceSummary(p) => format!("trace summary {}", p.display()),
            Source::SnapshotXml(p) => format!("snapshots {}", p.display()),
            Source::Sampler(ps) => format!("{} sampler dumps", ps.len()),
            Source::Database { path, trial_id, .. } => {
                format!("trial {trial_id} in {}", path.display())
            }
        }
    }
}

/// Load a trial.  Errors are the fatal ones of the parser in question, including cancellation
/// through `control`; everything else is in the DataSource's diagnostics.

pub fn load_trial(source: &Source, config: &LoadConfig, control: &LoadControl) -> Result<DataSource> {
    log::debug!("Loading {}", source.describe());
    let mut ds = match source {
        Source::FlatProfiles(root) => load_profile_tree(root, config, control)?,
        Source::TraceSummary(path) => load_trace_summary(path, control)?,
        Source::SnapshotXml(path) => load_snapshot_xml(path, control)?,
        Source::Sampler(files) => load_sampler_files(files, control)?,
        Source::Database {
            path,
            trial_id,
            schema,
        } => {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            database::load_trial(&conn, *trial_id, *schema, control)?
        }
    };
    generate_derived_data(&mut ds);
    log::info!(
        "Loaded {}: {} threads, {} diagnostics",
        source.describe(),
        ds.num_threads(),
        ds.diagnostics().len()
    );
    Ok(ds)
}

#[cfg(test)]
use crate::thread::AggregateKind;
#[cfg(test)]
use std::sync::Arc;

#[test]
fn test_load_every_source() {
    let config = LoadConfig::default();
    let sources = [
        Source::FlatProfiles(PathBuf::from("../profile_test_data/flat/multi")),
        Source::TraceSummary(PathBuf::from("../profile_test_data/trace/summary.txt")),
        Source::SnapshotXml(PathBuf::from("../profile_test_data/xml/snapshots.xml")),
        Source::Sampler(vec![
            PathBuf::from("../profile_test_data/sampler/rank0.txt"),
            PathBuf::from("../profile_test_data/sampler/rank1.txt"),
        ]),
    ];
    for source in &sources {
        let ds = load_trial(source, &config, &LoadControl::new()).unwrap();
        assert!(ds.derived_generated());
        assert!(ds.aggregate(AggregateKind::Total).is_some());
        assert!(ds.num_threads() > 0);
    }
}

#[test]
fn test_load_database_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiles.db");
    {
        let mut conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE trial (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE metric (id INTEGER PRIMARY KEY, trial INTEGER, name TEXT);
             CREATE TABLE timer (id INTEGER PRIMARY KEY, trial INTEGER, name TEXT, group_names TEXT);
             CREATE TABLE timer_value (timer INTEGER, node INTEGER, context INTEGER, thread INTEGER,
                                       metric INTEGER, inclusive_value REAL, exclusive_value REAL,
                                       num_calls REAL, num_subroutines REAL);
             CREATE TABLE atomic_event (id INTEGER PRIMARY KEY, trial INTEGER, name TEXT,
                                        group_name TEXT);
             CREATE TABLE atomic_location_profile (atomic_event INTEGER, node INTEGER,
                                                   context INTEGER, thread INTEGER,
                                                   sample_count INTEGER, maximum_value REAL,
                                                   minimum_value REAL, mean_value REAL,
                                                   standard_deviation REAL);",
        )
        .unwrap();
        let ds = load_trial(
            &Source::FlatProfiles(PathBuf::from("../profile_test_data/flat/single")),
            &LoadConfig::default(),
            &LoadControl::new(),
        )
        .unwrap();
        database::upload_trial(&mut conn, &ds, "single", SchemaVersion::Current).unwrap();
    }
    let source = Source::Database {
        path,
        trial_id: 1,
        schema: SchemaVersion::Current,
    };
    let ds = load_trial(&source, &LoadConfig::default(), &LoadControl::new()).unwrap();
    assert!(ds.name.as_deref() == Some("single"));
    assert!(ds.num_threads() == 3);
    let main = ds.function_id("main").unwrap();
    let total = ds.aggregate(AggregateKind::Total).unwrap();
    assert!(total.function_profile(main).unwrap().inclusive(0, 0) == 1500.0);

    let missing = Source::Database {
        path: dir.path().join("nonexistent.db"),
        trial_id: 1,
        schema: SchemaVersion::Current,
    };
    assert!(load_trial(&missing, &LoadConfig::default(), &LoadControl::new()).is_err());
}

#[test]
fn test_cancel_from_another_thread() {
    let control = Arc::new(LoadControl::new());
    let c = Arc::clone(&control);
    std::thread::spawn(move || c.cancel()).join().unwrap();
    let r = load_trial(
        &Source::FlatProfiles(PathBuf::from("../profile_test_data/flat/single")),
        &LoadConfig::default(),
        &control,
    );
    assert!(r.is_err());
}

#[test]
fn test_shared_after_load() {
    fn is_send_sync<T: Send + Sync>(_: &T) {}
    let ds = load_trial(
        &Source::FlatProfiles(PathBuf::from("../profile_test_data/flat/single")),
        &LoadConfig::default(),
        &LoadControl::new(),
    )
    .unwrap();
    is_send_sync(&ds);

    // Concurrent first requests for the same call graph all see one graph
    let key = (0, 0, 0);
    let graphs = std::thread::scope(|s| {
        let handles = (0..4)
            .map(|_| s.spawn(|| ds.call_graph_for(key).unwrap() as *const _ as usize))
            .collect::<Vec<_>>();
        handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
    });
    assert!(graphs.iter().all(|g| *g == graphs[0]));
    assert!(ds.call_graph_for(key).unwrap().num_edges() == 1);
}
