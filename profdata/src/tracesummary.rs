// Parser for trace-summary reports.
//
// A report is a header of "Key: value" lines ended by a blank line, a line naming the summarized
// quantities, and one line per thread:
//
//   Application: ring
//   Metric: Time
//   Total duration: 2.5 s
//   Units: ms
//
//   Objects/Intervals MPI_Send MPI_Recv compute
//   THREAD 0.0 100 200 1.2 s
//   THREAD 0.1 10 percent 200 300
//
// Every header pair becomes trial metadata.  "Total duration" is required, the other keys have
// defaults.  A value may be followed by a unit; without one the "Units" unit applies.  Values are
// stored in microseconds, and a percentage is relative to the total duration.
//
// Each thread gets one function per quantity, with one call and exclusive = inclusive = value,
// plus a root function for the whole run whose exclusive value is whatever the quantities don't
// account for.

use crate::control::LoadControl;
use crate::diag::DiagnosticKind;
use crate::model::DataSource;

use anyhow::{bail, Context, Result};
use std::path::Path;

pub const DEFAULT_APPLICATION: &str = ".TAU application";
pub const DEFAULT_UNIT: &str = "us";

const OBJECTS_KEYWORD: &str = "Objects/Intervals";
const THREAD_KEYWORD: &str = "THREAD";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Unit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Hours,
    Percent,
}

impl Unit {
    fn parse(s: &str) -> Option<Unit> {
        match s {
            "ns" => Some(Unit::Nanoseconds),
            "us" => Some(Unit::Microseconds),
            "ms" => Some(Unit::Milliseconds),
            "s" => Some(Unit::Seconds),
            "h" => Some(Unit::Hours),
            "percent" | "%" => Some(Unit::Percent),
            _ => None,
        }
    }

    // `total` is the total duration in microseconds, for percentages.
    fn to_micros(self, value: f64, total: f64) -> f64 {
        match self {
            Unit::Nanoseconds => value / 1000.0,
            Unit::Microseconds => value,
            Unit::Milliseconds => value * 1000.0,
            Unit::Seconds => value * 1_000_000.0,
            Unit::Hours => value * 3_600_000_000.0,
            Unit::Percent => value * total / 100.0,
        }
    }
}

pub fn load_trace_summary(path: &Path, control: &LoadControl) -> Result<DataSource> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Reading trace summary {}", path.display()))?;
    parse_trace_summary(&text, &path.display().to_string(), control)
}

/// Parse a whole report.  `source` names the input in diagnostics.

pub fn parse_trace_summary(text: &str, source: &str, control: &LoadControl) -> Result<DataSource> {
    let mut ds = DataSource::new();
    let mut lines = text.lines();

    let mut header = vec![];
    for line in lines.by_ref() {
        let line = line.trim();
        if line.is_empty() {
            if header.is_empty() {
                continue;
            }
            break;
        }
        match line.split_once(':') {
            Some((k, v)) => header.push((k.trim().to_string(), v.trim().to_string())),
            None => bail!("{source}: Bad header line: {line}"),
        }
    }
    let lookup = |key: &str| {
        header
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let default_unit = match Unit::parse(lookup("Units").unwrap_or(DEFAULT_UNIT)) {
        Some(Unit::Percent) | None => bail!("{source}: Bad default unit"),
        Some(u) => u,
    };
    let total = match lookup("Total duration") {
        Some(v) => parse_duration(v, default_unit)
            .with_context(|| format!("{source}: Bad total duration: {v}"))?,
        None => bail!("{source}: No total duration"),
    };
    let metric_name = lookup("Metric").unwrap_or("Time").to_string();
    let application = lookup("Application").unwrap_or(DEFAULT_APPLICATION).to_string();
    for (k, v) in &header {
        ds.add_metadata(k, v);
    }

    let metric = ds.add_metric(&metric_name);
    let root = ds.intern_function(&application);

    let mut quantities = None;
    for line in lines.by_ref() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.strip_prefix(OBJECTS_KEYWORD) {
            Some(rest) => {
                quantities = Some(
                    rest.split_whitespace()
                        .map(|name| ds.intern_function(name))
                        .collect::<Vec<_>>(),
                );
                break;
            }
            None => bail!("{source}: Expected {OBJECTS_KEYWORD}, found: {line}"),
        }
    }
    let quantities = match quantities {
        Some(q) => q,
        None => bail!("{source}: No {OBJECTS_KEYWORD} line"),
    };

    let records = lines
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>();
    control.set_total(records.len());
    for line in records {
        control.check()?;
        control.advance();
        let (key, values) = match parse_thread_line(line, default_unit, total) {
            Ok(x) => x,
            Err(msg) => {
                ds.record(DiagnosticKind::RecordCorruption, source, msg);
                continue;
            }
        };
        if values.len() != quantities.len() {
            ds.record(
                DiagnosticKind::RecordCorruption,
                source,
                format!("Expected {} values, found {}: {line}", quantities.len(), values.len()),
            );
            continue;
        }

        let accounted = values.iter().sum::<f64>();
        let remainder = total - accounted;
        if remainder < 0.0 {
            ds.record(
                DiagnosticKind::NegativeValue,
                source,
                format!("Quantities exceed the total duration on thread {}.{}", key.0, key.2),
            );
        }

        let t = ds.get_or_create_thread(key.0, key.1, key.2);
        let p = t.get_or_create_function_profile(root);
        p.set_calls(0, 1.0);
        p.set_subroutines(0, quantities.len() as f64);
        p.set_inclusive(0, metric, total);
        p.set_exclusive(0, metric, f64::max(remainder, 0.0));
        for (f, v) in quantities.iter().zip(values) {
            let p = t.get_or_create_function_profile(*f);
            p.set_calls(0, 1.0);
            p.set_inclusive(0, metric, v);
            p.set_exclusive(0, metric, v);
        }
    }

    Ok(ds)
}

// "2.5 s", or "2500000" in the default unit.
fn parse_duration(s: &str, default_unit: Unit) -> Result<f64> {
    let mut fields = s.split_whitespace();
    let value = match fields.next() {
        Some(v) => v.parse::<f64>()?,
        None => bail!("Empty value"),
    };
    let unit = match fields.next() {
        Some(u) => match Unit::parse(u) {
            Some(Unit::Percent) | None => bail!("Bad unit {u}"),
            Some(u) => u,
        },
        None => default_unit,
    };
    Ok(unit.to_micros(value, 0.0))
}

// "THREAD p.t v [unit] v [unit] ..." -> ((p, 0, t), values in microseconds)
fn parse_thread_line(
    line: &str,
    default_unit: Unit,
    total: f64,
) -> std::result::Result<((i32, i32, i32), Vec<f64>), String> {
    let mut fields = line.split_whitespace().peekable();
    if fields.next() != Some(THREAD_KEYWORD) {
        return Err(format!("Not a thread line: {line}"));
    }
    let id = fields.next().ok_or_else(|| format!("No thread id: {line}"))?;
    let (p, t) = id
        .split_once('.')
        .and_then(|(p, t)| Some((p.parse::<i32>().ok()?, t.parse::<i32>().ok()?)))
        .ok_or_else(|| format!("Bad thread id {id}: {line}"))?;
    if p < 0 || t < 0 {
        return Err(format!("Negative thread id {id}: {line}"));
    }

    let mut values = vec![];
    while let Some(f) = fields.next() {
        let v = f
            .parse::<f64>()
            .map_err(|_| format!("Bad value {f}: {line}"))?;
        let unit = match fields.peek().and_then(|u| Unit::parse(u)) {
            Some(u) => {
                fields.next();
                u
            }
            None => default_unit,
        };
        values.push(unit.to_micros(v, total));
    }
    Ok(((p, 0, t), values))
}

#[cfg(test)]
const REPORT: &str = "Application: ring
Metric: Time
Total duration: 2 s
Units: ms

Objects/Intervals MPI_Send MPI_Recv compute
THREAD 0.0 100 200 1.2 s
THREAD 0.1 10 percent 200 300
THREAD 1.0 100 200
THREAD x.0 1 2 3
THREAD 1.1 3 2 2 s
";

#[test]
fn test_parse_report() {
    let ds = parse_trace_summary(REPORT, "report", &LoadControl::new()).unwrap();
    assert!(ds.num_threads() == 3);
    assert!(ds.metrics()[0].name == "Time");
    assert!(ds.metadata.get("Application").map(|s| s.as_str()) == Some("ring"));

    let root = ds.function_id("ring").unwrap();
    let send = ds.function_id("MPI_Send").unwrap();
    let compute = ds.function_id("compute").unwrap();

    let t = ds.thread((0, 0, 0)).unwrap();
    let p = t.function_profile(compute).unwrap();
    assert!(p.inclusive(0, 0) == 1_200_000.0);
    assert!(p.exclusive(0, 0) == 1_200_000.0);
    assert!(p.calls(0) == 1.0);
    let r = t.function_profile(root).unwrap();
    assert!(r.inclusive(0, 0) == 2_000_000.0);
    assert!(r.subroutines(0) == 3.0);
    assert!(r.exclusive(0, 0) == 2_000_000.0 - 1_500_000.0);

    // 10 percent of 2 s
    let t = ds.thread((0, 0, 1)).unwrap();
    assert!(t.function_profile(send).unwrap().inclusive(0, 0) == 200_000.0);

    // Wrong value count and bad thread id are skipped, an overfull thread is clamped
    assert!(ds.thread((1, 0, 0)).is_none());
    let count = |kind| ds.diagnostics().iter().filter(|d| d.kind == kind).count();
    assert!(count(DiagnosticKind::RecordCorruption) == 2);
    assert!(count(DiagnosticKind::NegativeValue) == 1);
    let t = ds.thread((1, 0, 1)).unwrap();
    assert!(t.function_profile(root).unwrap().exclusive(0, 0) == 0.0);
}

#[test]
fn test_report_defaults() {
    let ds = parse_trace_summary(
        "Total duration: 1000\n\nObjects/Intervals a\nTHREAD 0.0 250\n",
        "report",
        &LoadControl::new(),
    )
    .unwrap();
    let root = ds.function_id(DEFAULT_APPLICATION).unwrap();
    let a = ds.function_id("a").unwrap();
    let t = ds.thread((0, 0, 0)).unwrap();
    assert!(t.function_profile(root).unwrap().exclusive(0, 0) == 750.0);
    assert!(t.function_profile(a).unwrap().inclusive(0, 0) == 250.0);
}

#[test]
fn test_negative_thread_ids() {
    let ds = parse_trace_summary(
        "Total duration: 1000\n\nObjects/Intervals a\nTHREAD -1.0 10\nTHREAD 0.-7 10\nTHREAD 0.0 10\n",
        "report",
        &LoadControl::new(),
    )
    .unwrap();
    assert!(ds.num_threads() == 1);
    assert!(ds.thread((-1, 0, 0)).is_none());
    assert!(ds.threads().all(|t| t.aggregate_kind().is_none()));
    assert!(ds.diagnostics().len() == 2);
    assert!(ds.diagnostics().iter().all(|d| d.kind == DiagnosticKind::RecordCorruption));
}

#[test]
fn test_bad_reports() {
    let c = LoadControl::new();
    assert!(parse_trace_summary("Metric: Time\n\nObjects/Intervals a\n", "r", &c).is_err());
    assert!(parse_trace_summary("Total duration: soon\n\nObjects/Intervals a\n", "r", &c).is_err());
    assert!(parse_trace_summary("Total duration: 1\n\nTHREAD 0.0 1\n", "r", &c).is_err());
    assert!(parse_trace_summary("Total duration: 1\n", "r", &c).is_err());
    assert!(parse_trace_summary("no colon here\n", "r", &c).is_err());
}

#[test]
fn test_load_report_file() {
    let ds = load_trace_summary(
        Path::new("../profile_test_data/trace/summary.txt"),
        &LoadControl::new(),
    )
    .unwrap();
    assert!(ds.num_threads() == 4);
    assert!(ds.diagnostics().is_empty());

    let control = LoadControl::new();
    load_trace_summary(Path::new("../profile_test_data/trace/summary.txt"), &control).unwrap();
    assert!(control.progress() == 1.0);
    assert!(load_trace_summary(Path::new("../profile_test_data/trace/nonexistent.txt"), &LoadControl::new()).is_err());
}
