// Parser for flat-text profile files, and the loader for a tree of them.
//
// FILE FORMAT
//
// One file per thread and metric:
//
//   <N> templated_functions[_MULTI_<metric>]
//   # Name Calls Subrs Excl Incl ProfileCalls # [<metadata>...</metadata>]
//   "<name>" <calls> <subrs> <excl> <incl> [<profilecalls>] [GROUP="<g1>|<g2>"]    (N times)
//   <M> aggregates
//   <aggregate line>                                                            (M times)
//   <K> userevents
//   # eventname numevents max min mean sumsqr
//   "<name>" <count> <max> <min> <mean> <sumsqr>                                (K times)
//
// The group annotation may also come right after the name, as "GROUP=<g1>|<g2>".  Everything after
// the function lines is optional.
//
// The metric name comes from the `_MULTI_<metric>` suffix on the first line, or the `hw_counters`
// marker, or the name of the metric directory, or it is "Time".
//
//
// NOTES
//
// - Function names may contain quote characters.  We find the end of the name by counting quotes:
//   if the last two quotes on the line enclose a group annotation then the name ends at the quote
//   before those, otherwise it ends at the last quote.
//
// - The same name may appear more than once in a file; the values are added up.
//
// - Negative exclusive or inclusive values are produced by some instrumentation bugs.  They are
//   clamped to zero.
//
// - A file that is shorter than its counts say is probably still being written.  It is read again a
//   few times, and if it never becomes complete then the thread's values for the metric are zeroed.
//   The same goes for files that can't be read at all.
//
// - User events don't depend on the metric, so they are only read from the first metric directory.

use crate::configs::LoadConfig;
use crate::control::LoadControl;
use crate::diag::DiagnosticKind;
use crate::metadata::{parse_metadata_block, parse_start_time, START_TIME_KEY};
use crate::model::DataSource;
use crate::profiletree::{find_profiles, ThreadFile};
use crate::thread::UserEventStats;
use crate::MetricId;

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const DEFAULT_METRIC: &str = "Time";
pub const HW_COUNTER_METRIC: &str = "Hardware Counter";

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFunction {
    pub name: String,
    pub groups: Vec<String>,
    pub calls: f64,
    pub subroutines: f64,
    pub exclusive: f64,
    pub inclusive: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUserEvent {
    pub name: String,
    pub stats: UserEventStats,
}

/// The contents of one profile file, not yet merged into a DataSource.

#[derive(Debug, Default)]
pub struct ParsedProfile {
    pub metric: Option<String>,
    pub metadata: Vec<(String, String)>,
    /// In first-seen order, duplicates already accumulated.
    pub functions: Vec<ParsedFunction>,
    pub user_events: Vec<ParsedUserEvent>,
    /// Non-fatal problems found in the file.
    pub anomalies: Vec<(DiagnosticKind, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileError {
    /// The file can't be used at all.
    Structural(String),
    /// The file could not be read completely; reading it again may help.
    Transient(String),
}

/// Parse the text of one profile file.  User events are only parsed if `user_events` is true.

pub fn parse_profile_text(text: &str, user_events: bool) -> Result<ParsedProfile, FileError> {
    let mut lines = text.lines();
    let mut profile = ParsedProfile::default();

    let first = lines
        .next()
        .ok_or_else(|| FileError::Transient("Empty file".to_string()))?;
    let (num_functions, metric) = parse_first_line(first)?;
    profile.metric = metric;

    let header = lines
        .next()
        .ok_or_else(|| FileError::Transient("No header line".to_string()))?;
    if !header.starts_with('#') {
        return Err(FileError::Structural(format!("Bad header line: {header}")));
    }
    match (header.find("<metadata>"), header.rfind("</metadata>")) {
        (Some(start), Some(end)) if start < end => {
            match parse_metadata_block(&header[start..end + "</metadata>".len()]) {
                Ok(pairs) => profile.metadata = pairs,
                Err(e) => profile
                    .anomalies
                    .push((DiagnosticKind::RecordCorruption, format!("Bad metadata block: {e}"))),
            }
        }
        (None, None) => {}
        _ => profile
            .anomalies
            .push((DiagnosticKind::RecordCorruption, "Bad metadata block".to_string())),
    }

    let mut index = HashMap::<String, usize>::new();
    for lineno in 0..num_functions {
        let line = lines.next().ok_or_else(|| {
            FileError::Transient(format!("Found {lineno} of {num_functions} functions"))
        })?;
        match parse_function_line(line) {
            Err(msg) => profile.anomalies.push((DiagnosticKind::RecordCorruption, msg)),
            Ok(mut f) => {
                if f.exclusive < 0.0 || f.inclusive < 0.0 {
                    profile.anomalies.push((
                        DiagnosticKind::NegativeValue,
                        format!(
                            "Negative value for \"{}\" (exclusive {}, inclusive {}) set to zero",
                            f.name, f.exclusive, f.inclusive
                        ),
                    ));
                    f.exclusive = f64::max(f.exclusive, 0.0);
                    f.inclusive = f64::max(f.inclusive, 0.0);
                }
                if let Some(i) = index.get(&f.name) {
                    let g = &mut profile.functions[*i];
                    g.calls += f.calls;
                    g.subroutines += f.subroutines;
                    g.exclusive += f.exclusive;
                    g.inclusive += f.inclusive;
                    for group in f.groups {
                        if !g.groups.contains(&group) {
                            g.groups.push(group);
                        }
                    }
                } else {
                    index.insert(f.name.clone(), profile.functions.len());
                    profile.functions.push(f);
                }
            }
        }
    }

    // Aggregates, which we skip.
    let line = match lines.next() {
        Some(l) => l,
        None => return Ok(profile),
    };
    let num_aggregates = match parse_count(line, "aggregates") {
        Some(n) => n,
        None => {
            profile
                .anomalies
                .push((DiagnosticKind::RecordCorruption, format!("Bad aggregates line: {line}")));
            return Ok(profile);
        }
    };
    for i in 0..num_aggregates {
        if lines.next().is_none() {
            return Err(FileError::Transient(format!(
                "Found {i} of {num_aggregates} aggregates"
            )));
        }
    }

    if !user_events {
        return Ok(profile);
    }
    let line = match lines.next() {
        Some(l) if !l.trim().is_empty() => l,
        _ => return Ok(profile),
    };
    let num_user_events = match parse_count(line, "userevents") {
        Some(n) => n,
        None => {
            profile
                .anomalies
                .push((DiagnosticKind::RecordCorruption, format!("Bad userevents line: {line}")));
            return Ok(profile);
        }
    };
    if num_user_events == 0 {
        return Ok(profile);
    }
    match lines.next() {
        Some(l) if l.starts_with('#') => {}
        Some(l) => {
            profile
                .anomalies
                .push((DiagnosticKind::RecordCorruption, format!("Bad userevents header: {l}")));
            return Ok(profile);
        }
        None => return Err(FileError::Transient("No userevents header".to_string())),
    }
    let mut event_index = HashMap::<String, usize>::new();
    for i in 0..num_user_events {
        let line = lines.next().ok_or_else(|| {
            FileError::Transient(format!("Found {i} of {num_user_events} user events"))
        })?;
        match parse_user_event_line(line) {
            Err(msg) => profile.anomalies.push((DiagnosticKind::RecordCorruption, msg)),
            Ok(e) => {
                if let Some(i) = event_index.get(&e.name) {
                    let merged = profile.user_events[*i].stats.merge(&e.stats);
                    profile.user_events[*i].stats = merged;
                } else {
                    event_index.insert(e.name.clone(), profile.user_events.len());
                    profile.user_events.push(e);
                }
            }
        }
    }

    Ok(profile)
}

fn parse_first_line(line: &str) -> Result<(usize, Option<String>), FileError> {
    let mut fields = line.split_whitespace();
    let count = fields
        .next()
        .and_then(|f| f.parse::<usize>().ok())
        .ok_or_else(|| FileError::Structural(format!("Bad function count line: {line}")))?;
    let rest = fields.collect::<Vec<&str>>().join(" ");
    let metric = if let Some(i) = rest.find("_MULTI_") {
        let name = rest[i + "_MULTI_".len()..].trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    } else if rest.contains("hw_counters") {
        Some(HW_COUNTER_METRIC.to_string())
    } else {
        None
    };
    Ok((count, metric))
}

// "<n> <word>"
fn parse_count(line: &str, word: &str) -> Option<usize> {
    let mut fields = line.split_whitespace();
    let n = fields.next()?.parse::<usize>().ok()?;
    if fields.next()? != word {
        return None;
    }
    Some(n)
}

/// Parse one function line; the error is a message for the diagnostic.

pub fn parse_function_line(line: &str) -> Result<ParsedFunction, String> {
    let line = line.trim();
    let quotes = line.match_indices('"').map(|(i, _)| i).collect::<Vec<usize>>();
    let n = quotes.len();
    if n < 2 || quotes[0] != 0 {
        return Err(format!("No quoted name: {line}"));
    }

    let mut group: Option<&str> = None;
    let mut name_end = quotes[n - 1];
    let mut numbers = line[name_end + 1..].to_string();
    if n >= 4 {
        let (g0, g1) = (quotes[n - 2], quotes[n - 1]);
        let inner = &line[g0 + 1..g1];
        let before = line[..g0].trim_end();
        if let Some(g) = inner.strip_prefix("GROUP=") {
            // "name" "GROUP=g1|g2" calls ...
            group = Some(g);
            name_end = quotes[n - 3];
            numbers = format!("{} {}", &line[name_end + 1..g0], &line[g1 + 1..]);
        } else if before.ends_with("GROUP=") && quotes[n - 3] < before.len() - "GROUP=".len() {
            // "name" calls ... GROUP="g1|g2"
            group = Some(inner);
            name_end = quotes[n - 3];
            numbers = format!(
                "{} {}",
                &line[name_end + 1..before.len() - "GROUP=".len()],
                &line[g1 + 1..]
            );
        }
    }
    let name = line[1..name_end].to_string();

    let values = numbers
        .split_whitespace()
        .map(|x| x.parse::<f64>())
        .collect::<std::result::Result<Vec<f64>, _>>()
        .map_err(|_| format!("Bad numbers for \"{name}\": {numbers}"))?;
    if values.len() < 4 {
        return Err(format!("Too few numbers for \"{name}\": {numbers}"));
    }

    let groups = group
        .map(|g| {
            g.split('|')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_string())
                .collect::<Vec<String>>()
        })
        .unwrap_or_default();

    Ok(ParsedFunction {
        name,
        groups,
        calls: values[0],
        subroutines: values[1],
        exclusive: values[2],
        inclusive: values[3],
    })
}

/// Parse one user event line, `"name" count max min mean sumsqr`.

pub fn parse_user_event_line(line: &str) -> Result<ParsedUserEvent, String> {
    #[derive(Debug, Deserialize)]
    struct UserEventRecord {
        name: String,
        num_samples: f64,
        max: f64,
        min: f64,
        mean: f64,
        sum_squared: f64,
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .from_reader(line.trim().as_bytes());
    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => {}
        _ => return Err(format!("Bad user event line: {line}")),
    }
    // Runs of blanks produce empty fields.
    let fields = record
        .iter()
        .enumerate()
        .filter(|(i, f)| *i == 0 || !f.is_empty())
        .map(|(_, f)| f)
        .collect::<csv::StringRecord>();
    let r: UserEventRecord = fields
        .deserialize(None)
        .map_err(|e| format!("Bad user event line ({e}): {line}"))?;
    Ok(ParsedUserEvent {
        name: r.name,
        stats: UserEventStats {
            num_samples: r.num_samples,
            min: r.min,
            max: r.max,
            mean: r.mean,
            sum_squared: r.sum_squared,
        },
    })
}

fn read_text(path: &Path, live_monitoring: bool) -> io::Result<String> {
    let file = File::open(path)?;
    let mut bytes = vec![];
    if live_monitoring {
        read_locked(file, &mut bytes)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes)?;
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// Best effort: if the lock can't be had we read without it and rely on the retries.
#[cfg(unix)]
fn read_locked(file: File, bytes: &mut Vec<u8>) -> io::Result<usize> {
    use nix::fcntl::{Flock, FlockArg};
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(mut locked) => locked.read_to_end(bytes),
        Err((mut file, errno)) => {
            log::debug!("Could not lock profile file: {errno}");
            file.read_to_end(bytes)
        }
    }
}

#[cfg(not(unix))]
fn read_locked(mut file: File, bytes: &mut Vec<u8>) -> io::Result<usize> {
    file.read_to_end(bytes)
}

/// Read and parse one file, reading it again after a delay when it appears incomplete.

pub fn read_profile_file(
    path: &Path,
    user_events: bool,
    config: &LoadConfig,
) -> Result<ParsedProfile, FileError> {
    let mut attempt = 0;
    loop {
        let result = match read_text(path, config.live_monitoring) {
            Ok(text) => parse_profile_text(&text, user_events),
            Err(e) => Err(FileError::Transient(format!("{e}"))),
        };
        match result {
            Err(FileError::Transient(msg)) if attempt < config.retry_count => {
                attempt += 1;
                log::debug!(
                    "{}: {msg}, retry {attempt} of {}",
                    path.display(),
                    config.retry_count
                );
                std::thread::sleep(config.retry_delay);
            }
            r => return r,
        }
    }
}

/// Load a flat-text profile tree into a new DataSource.
///
/// This returns an error if the tree can't be enumerated or the load is cancelled.  Problems with
/// individual files are recorded as diagnostics on the DataSource.

pub fn load_profile_tree(
    root: &Path,
    config: &LoadConfig,
    control: &LoadControl,
) -> Result<DataSource> {
    let dirs = find_profiles(root)?;
    control.set_total(dirs.iter().map(|d| d.files.len()).sum());

    let mut ds = DataSource::new();
    for (i, dir) in dirs.iter().enumerate() {
        let fallback_metric = dir.metric_hint.as_deref().unwrap_or(DEFAULT_METRIC);
        let user_events = i == 0 && config.read_user_events;
        log::info!("Reading {} profiles from {}", dir.files.len(), dir.path.display());
        for file in &dir.files {
            control.check()?;
            let source = file.path.display().to_string();
            match read_profile_file(&file.path, user_events, config) {
                Ok(profile) => {
                    let metric_name = profile.metric.clone();
                    let metric = ds.add_metric(metric_name.as_deref().unwrap_or(fallback_metric));
                    apply_profile(&mut ds, file, metric, profile, &source);
                }
                Err(FileError::Structural(msg)) => {
                    ds.record(DiagnosticKind::StructuralCorruption, &source, msg);
                }
                Err(FileError::Transient(msg)) => {
                    let metric = ds.add_metric(fallback_metric);
                    let t = ds.get_or_create_thread(file.node, file.context, file.thread);
                    for p in t.function_profiles_mut() {
                        p.zero_metric(metric);
                    }
                    ds.record(
                        DiagnosticKind::TransientIo,
                        &source,
                        format!("{msg}; giving up after {} retries, values zeroed", config.retry_count),
                    );
                }
            }
            control.advance();
        }
    }
    Ok(ds)
}

/// Merge one parsed file into the DataSource as the values of `metric` on the file's thread.

pub fn apply_profile(
    ds: &mut DataSource,
    file: &ThreadFile,
    metric: MetricId,
    profile: ParsedProfile,
    source: &str,
) {
    for (kind, msg) in profile.anomalies {
        ds.record(kind, source, msg);
    }

    for (key, value) in &profile.metadata {
        ds.add_metadata(key, value);
        if key == START_TIME_KEY && ds.start_time.is_none() {
            ds.start_time = parse_start_time(value);
        }
    }

    let mut ids = vec![];
    for f in &profile.functions {
        let id = ds.intern_function(&f.name);
        for g in &f.groups {
            let gid = ds.intern_group(g);
            ds.add_function_to_group(id, gid);
        }
        ids.push(id);
    }
    let events = profile
        .user_events
        .iter()
        .map(|e| ds.intern_user_event(&e.name))
        .collect::<Vec<_>>();

    ds.add_metric_to_thread((file.node, file.context, file.thread));
    let t = ds.get_or_create_thread(file.node, file.context, file.thread);
    for (key, value) in profile.metadata {
        t.metadata.insert(key, value);
    }
    for (f, id) in profile.functions.iter().zip(ids) {
        let p = t.get_or_create_function_profile(id);
        p.set_calls(0, f.calls);
        p.set_subroutines(0, f.subroutines);
        p.set_exclusive(0, metric, f.exclusive);
        p.set_inclusive(0, metric, f.inclusive);
    }
    for (e, id) in profile.user_events.iter().zip(events) {
        t.get_or_create_user_event_profile(id).merge_stats(0, &e.stats);
    }
}

#[cfg(test)]
use crate::thread::AggregateKind;

#[cfg(test)]
fn quick_config() -> LoadConfig {
    LoadConfig {
        retry_count: 2,
        retry_delay: std::time::Duration::from_millis(1),
        ..Default::default()
    }
}

#[test]
fn test_parse_function_line() {
    let f = parse_function_line("\"main\" 1 2 100 400 0 GROUP=\"TAU_DEFAULT\"").unwrap();
    assert!(f.name == "main");
    assert!(f.groups == vec!["TAU_DEFAULT".to_string()]);
    assert!(f.calls == 1.0 && f.subroutines == 2.0);
    assert!(f.exclusive == 100.0 && f.inclusive == 400.0);

    let f = parse_function_line("\"bar\" \"GROUP=TAU_USER|IO\" 3 0 1.5 2.5").unwrap();
    assert!(f.name == "bar");
    assert!(f.groups == vec!["TAU_USER".to_string(), "IO".to_string()]);
    assert!(f.calls == 3.0 && f.exclusive == 1.5 && f.inclusive == 2.5);

    let f = parse_function_line("\"operator \"\" (int)\" 2 0 10 20 0 GROUP=\"TAU_USER\"").unwrap();
    assert!(f.name == "operator \"\" (int)");
    assert!(f.groups == vec!["TAU_USER".to_string()]);
    assert!(f.inclusive == 20.0);

    let f = parse_function_line("\"say \"hi\"\" 1 0 1 1").unwrap();
    assert!(f.name == "say \"hi\"");
    assert!(f.groups.is_empty());

    let f = parse_function_line("\"main => foo\" 2 0 3e2 3.0E2 0 GROUP=\"TAU_CALLPATH\"").unwrap();
    assert!(f.name == "main => foo");
    assert!(f.exclusive == 300.0);

    assert!(parse_function_line("main 1 2 3 4").is_err());
    assert!(parse_function_line("\"main\" 1 2 3").is_err());
    assert!(parse_function_line("\"main\" 1 x 3 4").is_err());
}

#[test]
fn test_parse_user_event_line() {
    let e = parse_user_event_line("\"Message size\" 4 40 10 25 3000").unwrap();
    assert!(e.name == "Message size");
    assert!(e.stats.num_samples == 4.0);
    assert!(e.stats.max == 40.0 && e.stats.min == 10.0);
    assert!(e.stats.mean == 25.0 && e.stats.sum_squared == 3000.0);

    let e = parse_user_event_line("\"Heap\"  1  8 8 8 64").unwrap();
    assert!(e.name == "Heap" && e.stats.sum_squared == 64.0);

    assert!(parse_user_event_line("\"Heap\" 1 8 8").is_err());
    assert!(parse_user_event_line("\"Heap\" 1 8 8 x 64").is_err());
}

#[test]
fn test_parse_first_line() {
    assert!(parse_first_line("3 templated_functions") == Ok((3, None)));
    assert!(
        parse_first_line("2 templated_functions_MULTI_PAPI_FP_OPS")
            == Ok((2, Some("PAPI_FP_OPS".to_string())))
    );
    assert!(
        parse_first_line("2 templated_functions_hw_counters")
            == Ok((2, Some(HW_COUNTER_METRIC.to_string())))
    );
    assert!(parse_first_line("templated_functions").is_err());
}

#[test]
fn test_truncated_text_is_transient() {
    let text = "3 templated_functions\n# Name Calls Subrs Excl Incl ProfileCalls #\n\"main\" 1 0 1 1 0\n";
    assert!(matches!(parse_profile_text(text, true), Err(FileError::Transient(_))));
    assert!(matches!(parse_profile_text("", true), Err(FileError::Transient(_))));
    assert!(matches!(parse_profile_text("x\n#\n", true), Err(FileError::Structural(_))));
    assert!(matches!(parse_profile_text("0 f\nno header\n", true), Err(FileError::Structural(_))));
}

#[test]
fn test_load_single_metric_tree() {
    let ds = load_profile_tree(
        Path::new("../profile_test_data/flat/single"),
        &LoadConfig::default(),
        &LoadControl::new(),
    )
    .unwrap();
    assert!(ds.num_threads() == 3);
    assert!(ds.metrics().len() == 1);
    assert!(ds.metrics()[0].name == "Time");
    assert!(ds.diagnostics().is_empty());

    let main = ds.function_id("main").unwrap();
    let foo = ds.function_id("foo").unwrap();
    assert!(main == 0 && foo == 1);

    // Duplicate lines for foo are added up
    let t = ds.thread((0, 0, 0)).unwrap();
    let p = t.function_profile(foo).unwrap();
    assert!(p.calls(0) == 3.0);
    assert!(p.exclusive(0, 0) == 350.0);
    assert!(p.inclusive(0, 0) == 350.0);
    assert!(ds.thread((1, 0, 0)).unwrap().function_profile(foo).is_none());

    assert!(ds.has_callpaths());
    assert!(ds.function_in_group(foo, "TAU_USER"));

    assert!(t.metadata.get("Node Name").map(|s| s.as_str()) == Some("n001"));
    assert!(ds.metadata.get("Node Name").map(|s| s.as_str()) == Some("n001"));
    assert!(ds.start_time.is_some());

    let e = ds.user_event_id("Message size").unwrap();
    let s = t.user_event_profile(e).unwrap().stats(0);
    assert!(s.num_samples == 4.0 && s.mean == 25.0);
    assert!(ds.thread((1, 0, 0)).unwrap().user_event_profile(e).is_none());
}

#[test]
fn test_load_multi_metric_tree() {
    let mut ds = load_profile_tree(
        Path::new("../profile_test_data/flat/multi"),
        &LoadConfig::default(),
        &LoadControl::new(),
    )
    .unwrap();
    assert!(ds.num_threads() == 2);
    let names = ds.metrics().iter().map(|m| m.name.clone()).collect::<Vec<_>>();
    assert!(names == vec!["PAPI_FP_OPS".to_string(), "TIME".to_string()]);
    let ops = ds.metric_id("PAPI_FP_OPS").unwrap();
    let time = ds.metric_id("TIME").unwrap();

    // One profile per function with both metrics filled in
    let compute = ds.function_id("compute").unwrap();
    let t = ds.thread((0, 0, 0)).unwrap();
    assert!(t.function_profiles().count() == 2);
    let p = t.function_profile(compute).unwrap();
    assert!(p.num_metrics() == 2);
    assert!(p.exclusive(0, ops) == 8000.0);
    assert!(p.exclusive(0, time) == 20.0);
    assert!(p.calls(0) == 5.0);

    // User events are read from the first metric directory only
    let heap = ds.user_event_id("Heap").unwrap();
    assert!(t.user_event_profile(heap).unwrap().stats(0).num_samples == 1.0);

    crate::derived::generate_derived_data(&mut ds);
    let total = ds.aggregate(AggregateKind::Total).unwrap();
    let main = ds.function_id("main").unwrap();
    assert!(total.function_profile(main).unwrap().inclusive(0, time) == 62.0);
    assert!(total.function_profile(main).unwrap().inclusive(0, ops) == 18100.0);
}

#[test]
fn test_load_broken_tree() {
    let ds = load_profile_tree(
        Path::new("../profile_test_data/flat/broken"),
        &quick_config(),
        &LoadControl::new(),
    )
    .unwrap();
    // profile.0.0.1 has a bad header and is skipped
    assert!(ds.num_threads() == 1);
    let count = |kind| ds.diagnostics().iter().filter(|d| d.kind == kind).count();
    assert!(count(DiagnosticKind::StructuralCorruption) == 1);
    assert!(count(DiagnosticKind::NegativeValue) == 2);
    assert!(count(DiagnosticKind::RecordCorruption) == 1);

    let t = ds.thread((0, 0, 0)).unwrap();
    let main = ds.function_id("main").unwrap();
    assert!(t.function_profile(main).unwrap().exclusive(0, 0) == 0.0);
    assert!(t.function_profile(main).unwrap().inclusive(0, 0) == 100.0);
    let op = ds.function_id("operator \"\" (int)").unwrap();
    assert!(t.function_profile(op).unwrap().inclusive(0, 0) == 0.0);
    let bar = ds.function_id("bar").unwrap();
    assert!(ds.function_in_group(bar, "IO"));
    assert!(ds.function_id("broken").is_none());
}

#[test]
fn test_negative_exclusive_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("profile.0.0.0"),
        "1 templated_functions\n# Name Calls Subrs Excl Incl ProfileCalls #\n\"f\" 1 0 -5 10 0\n0 aggregates\n",
    )
    .unwrap();
    let ds = load_profile_tree(dir.path(), &quick_config(), &LoadControl::new()).unwrap();
    let f = ds.function_id("f").unwrap();
    assert!(ds.thread((0, 0, 0)).unwrap().function_profile(f).unwrap().exclusive(0, 0) == 0.0);
    assert!(ds.diagnostics().len() == 1);
    assert!(ds.diagnostics()[0].kind == DiagnosticKind::NegativeValue);
}

#[test]
fn test_exact_values_survive() {
    let dir = tempfile::tempdir().unwrap();
    let mut text = "3 templated_functions\n# Name Calls Subrs Excl Incl ProfileCalls #\n".to_string();
    let rows = [("a", 7u64, 2u64, 1234.5, 98765.25), ("b", 1000000, 0, 0.125, 0.375), ("c", 3, 1, 1e15, 2e15)];
    for (name, calls, subrs, excl, incl) in rows {
        text += &format!("\"{name}\" {calls} {subrs} {excl} {incl} 0 GROUP=\"TAU_USER\"\n");
    }
    text += "0 aggregates\n";
    for t in 0..4 {
        std::fs::write(dir.path().join(format!("profile.0.0.{t}")), &text).unwrap();
    }
    let ds = load_profile_tree(dir.path(), &quick_config(), &LoadControl::new()).unwrap();
    for t in ds.threads() {
        for (name, calls, subrs, excl, incl) in rows {
            let p = t.function_profile(ds.function_id(name).unwrap()).unwrap();
            assert!(p.calls(0) == calls as f64);
            assert!(p.subroutines(0) == subrs as f64);
            assert!(p.exclusive(0, 0) == excl);
            assert!(p.inclusive(0, 0) == incl);
        }
    }
}

#[test]
fn test_incomplete_file_is_zeroed() {
    let dir = tempfile::tempdir().unwrap();
    let good = "2 templated_functions_MULTI_TIME\n# Name Calls Subrs Excl Incl ProfileCalls #\n\"main\" 1 1 5 10 0\n\"f\" 1 0 5 5 0\n0 aggregates\n";
    // Claims three functions but has two: still being written
    let short = "3 templated_functions_MULTI_CYCLES\n# Name Calls Subrs Excl Incl ProfileCalls #\n\"main\" 1 1 50 100 0\n\"f\" 1 0 50 50 0\n";
    std::fs::create_dir(dir.path().join("MULTI__CYCLES")).unwrap();
    std::fs::create_dir(dir.path().join("MULTI__TIME")).unwrap();
    std::fs::write(dir.path().join("MULTI__CYCLES/profile.0.0.0"), good.replace("TIME", "CYCLES")).unwrap();
    std::fs::write(dir.path().join("MULTI__CYCLES/profile.0.0.1"), short).unwrap();
    std::fs::write(dir.path().join("MULTI__TIME/profile.0.0.0"), good).unwrap();
    std::fs::write(dir.path().join("MULTI__TIME/profile.0.0.1"), good).unwrap();

    let control = LoadControl::new();
    let ds = load_profile_tree(dir.path(), &quick_config(), &control).unwrap();
    assert!(control.progress() == 1.0);
    assert!(ds.num_threads() == 2);
    let diags = ds.diagnostics();
    assert!(diags.len() == 1);
    assert!(diags[0].kind == DiagnosticKind::TransientIo);

    let cycles = ds.metric_id("CYCLES").unwrap();
    let time = ds.metric_id("TIME").unwrap();
    let main = ds.function_id("main").unwrap();
    let t1 = ds.thread((0, 0, 1)).unwrap();
    let p = t1.function_profile(main).unwrap();
    assert!(p.inclusive(0, cycles) == 0.0);
    assert!(p.inclusive(0, time) == 10.0);
}

#[test]
fn test_file_completed_during_retry() {
    let dir = tempfile::tempdir().unwrap();
    let full = "2 templated_functions\n# Name Calls Subrs Excl Incl ProfileCalls #\n\"main\" 1 1 5 10 0\n\"f\" 1 0 5 5 0\n0 aggregates\n";
    let short = "2 templated_functions\n# Name Calls Subrs Excl Incl ProfileCalls #\n\"main\" 1 1 5 10 0\n";
    let path = dir.path().join("profile.0.0.0");
    std::fs::write(&path, short).unwrap();
    let config = LoadConfig {
        retry_count: 100,
        retry_delay: std::time::Duration::from_millis(20),
        ..Default::default()
    };
    let ds = std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            let staging = dir.path().join("staging");
            std::fs::write(&staging, full).unwrap();
            std::fs::rename(&staging, &path).unwrap();
        });
        load_profile_tree(dir.path(), &config, &LoadControl::new()).unwrap()
    });
    assert!(ds.diagnostics().is_empty());
    let t = ds.thread((0, 0, 0)).unwrap();
    let main = ds.function_id("main").unwrap();
    let f = ds.function_id("f").unwrap();
    assert!(t.function_profile(main).unwrap().inclusive(0, 0) == 10.0);
    assert!(t.function_profile(f).unwrap().exclusive(0, 0) == 5.0);
}

#[test]
fn test_misordered_metadata_tags() {
    let dir = tempfile::tempdir().unwrap();
    let body = "1 templated_functions\n{header}\n\"main\" 1 0 5 5 0\n0 aggregates\n";
    std::fs::write(
        dir.path().join("profile.0.0.0"),
        body.replace("{header}", "# Name Calls Subrs Excl Incl ProfileCalls # </metadata> <metadata>"),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("profile.0.0.1"),
        body.replace("{header}", "# Name Calls Subrs Excl Incl ProfileCalls # <metadata>"),
    )
    .unwrap();
    let ds = load_profile_tree(dir.path(), &quick_config(), &LoadControl::new()).unwrap();
    assert!(ds.num_threads() == 2);
    assert!(ds.diagnostics().len() == 2);
    assert!(ds.diagnostics().iter().all(|d| d.kind == DiagnosticKind::RecordCorruption));
    let main = ds.function_id("main").unwrap();
    for t in ds.threads() {
        assert!(t.function_profile(main).unwrap().inclusive(0, 0) == 5.0);
        assert!(t.metadata.is_empty());
    }
}

#[test]
fn test_unreadable_file_is_zeroed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("profile.0.0.0"), b"1 templated_functions\n\xff\xfe\n").unwrap();
    let ds = load_profile_tree(dir.path(), &quick_config(), &LoadControl::new()).unwrap();
    assert!(ds.num_threads() == 1);
    assert!(ds.diagnostics().len() == 1);
    assert!(ds.diagnostics()[0].kind == DiagnosticKind::TransientIo);
}

#[test]
fn test_cancelled_load() {
    let control = LoadControl::new();
    control.cancel();
    let r = load_profile_tree(
        Path::new("../profile_test_data/flat/single"),
        &LoadConfig::default(),
        &control,
    );
    assert!(r.is_err());
}

#[test]
fn test_live_monitoring_reads() {
    let config = LoadConfig {
        live_monitoring: true,
        ..quick_config()
    };
    let ds = load_profile_tree(
        Path::new("../profile_test_data/flat/single"),
        &config,
        &LoadControl::new(),
    )
    .unwrap();
    assert!(ds.num_threads() == 3);
}
