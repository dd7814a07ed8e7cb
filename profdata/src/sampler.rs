// Parser for single-metric sampler dumps.
//
// Every input file is one node (node = index of the file in the input list, context 0, thread 0)
// and holds one table of sample counts for the metric "Time":
//
//   Total: 1000 samples
//        400  40.0%  40.0%      400  40.0% compute_kernel
//        250  25.0%  65.0%      900  90.0% main
//
// The columns are self samples, self percentage, cumulative percentage, inclusive samples,
// inclusive percentage and the function name, which is the rest of the line.  Lines before the
// "Total:" line are ignored, and a file without one is not a sampler dump.

use crate::control::LoadControl;
use crate::diag::DiagnosticKind;
use crate::model::DataSource;

use anyhow::{Context, Result};
use std::path::PathBuf;

pub const SAMPLER_METRIC: &str = "Time";

const TOTAL_MARKER: &str = "Total:";

#[derive(Debug, Clone, PartialEq)]
pub struct SampleLine {
    pub name: String,
    pub self_samples: f64,
    pub inclusive_samples: f64,
}

/// Split off the first whitespace-delimited field, returning it and the rest of the line.

fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(i) => Some((&s[..i], &s[i..])),
        None => Some((s, "")),
    }
}

fn parse_percent(s: &str) -> Option<f64> {
    s.strip_suffix('%').unwrap_or(s).parse::<f64>().ok()
}

pub fn parse_sample_line(line: &str) -> std::result::Result<SampleLine, String> {
    let bad = || format!("Bad sample line: {line}");
    let (self_samples, rest) = next_field(line).ok_or_else(bad)?;
    let (self_percent, rest) = next_field(rest).ok_or_else(bad)?;
    let (cumulative, rest) = next_field(rest).ok_or_else(bad)?;
    let (inclusive_samples, rest) = next_field(rest).ok_or_else(bad)?;
    let (inclusive_percent, rest) = next_field(rest).ok_or_else(bad)?;
    let name = rest.trim();
    if name.is_empty()
        || parse_percent(self_percent).is_none()
        || parse_percent(cumulative).is_none()
        || parse_percent(inclusive_percent).is_none()
    {
        return Err(bad());
    }
    Ok(SampleLine {
        name: name.to_string(),
        self_samples: self_samples.parse::<f64>().map_err(|_| bad())?,
        inclusive_samples: inclusive_samples.parse::<f64>().map_err(|_| bad())?,
    })
}

/// Load the dumps, one node per file.  A file that can't be read or has no "Total:" line is
/// recorded as a diagnostic and skipped.  Repeated names within a file are added up.

pub fn load_sampler_files(files: &[PathBuf], control: &LoadControl) -> Result<DataSource> {
    let mut ds = DataSource::new();
    let metric = ds.add_metric(SAMPLER_METRIC);
    control.set_total(files.len());
    for (node, path) in files.iter().enumerate() {
        control.check()?;
        let node = i32::try_from(node).context("Too many sampler files")?;
        let source = path.display().to_string();
        match std::fs::read_to_string(path) {
            Ok(text) => parse_sampler_text(&mut ds, &text, node, metric, &source),
            Err(e) => ds.record(DiagnosticKind::StructuralCorruption, &source, format!("{e}")),
        }
        control.advance();
    }
    Ok(ds)
}

fn parse_sampler_text(ds: &mut DataSource, text: &str, node: i32, metric: usize, source: &str) {
    let mut lines = text.lines();
    if !lines.by_ref().any(|l| l.trim_start().starts_with(TOTAL_MARKER)) {
        ds.record(
            DiagnosticKind::StructuralCorruption,
            source,
            format!("No {TOTAL_MARKER} line"),
        );
        return;
    }

    let mut samples = vec![];
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match parse_sample_line(line) {
            Ok(s) => samples.push(s),
            Err(msg) => ds.record(DiagnosticKind::RecordCorruption, source, msg),
        }
    }

    let ids = samples
        .iter()
        .map(|s| ds.intern_function(&s.name))
        .collect::<Vec<_>>();
    let t = ds.get_or_create_thread(node, 0, 0);
    for (s, id) in samples.iter().zip(ids) {
        let p = t.get_or_create_function_profile(id);
        p.set_calls(0, 1.0);
        let (excl, incl) = (p.exclusive(0, metric), p.inclusive(0, metric));
        p.set_exclusive(0, metric, excl + s.self_samples);
        p.set_inclusive(0, metric, incl + s.inclusive_samples);
    }
}

#[test]
fn test_parse_sample_line() {
    let s = parse_sample_line("     400  40.0%  40.0%      400  40.0% compute_kernel").unwrap();
    assert!(s.name == "compute_kernel");
    assert!(s.self_samples == 400.0 && s.inclusive_samples == 400.0);

    let s = parse_sample_line("  3 0.3% 99.1% 12 1.2% std::vector<int>::push_back (inline)").unwrap();
    assert!(s.name == "std::vector<int>::push_back (inline)");
    assert!(s.inclusive_samples == 12.0);

    assert!(parse_sample_line("400 40.0% 40.0% 400 40.0%").is_err());
    assert!(parse_sample_line("x 40.0% 40.0% 400 40.0% f").is_err());
    assert!(parse_sample_line("400 forty 40.0% 400 40.0% f").is_err());
}

#[test]
fn test_load_sampler_files() {
    let files = vec![
        PathBuf::from("../profile_test_data/sampler/rank0.txt"),
        PathBuf::from("../profile_test_data/sampler/rank1.txt"),
    ];
    let control = LoadControl::new();
    let ds = load_sampler_files(&files, &control).unwrap();
    assert!(control.progress() == 1.0);
    assert!(ds.num_threads() == 2);
    assert!(ds.metrics().len() == 1 && ds.metrics()[0].name == "Time");
    assert!(ds.diagnostics().is_empty());

    let main = ds.function_id("main").unwrap();
    let t = ds.thread((1, 0, 0)).unwrap();
    let p = t.function_profile(main).unwrap();
    assert!(p.exclusive(0, 0) == 120.0);
    assert!(p.inclusive(0, 0) == 950.0);
    assert!(p.calls(0) == 1.0);
}

#[test]
fn test_bad_sampler_files() {
    let dir = tempfile::tempdir().unwrap();
    let no_total = dir.path().join("a.txt");
    std::fs::write(&no_total, "400 40.0% 40.0% 400 40.0% f\n").unwrap();
    let bad_line = dir.path().join("b.txt");
    std::fs::write(&bad_line, "Total: 10 samples\n4 40% 40% 4 40% f\nnonsense\n").unwrap();
    let files = vec![no_total, bad_line, dir.path().join("missing.txt")];
    let ds = load_sampler_files(&files, &LoadControl::new()).unwrap();
    assert!(ds.num_threads() == 1);
    assert!(ds.thread((1, 0, 0)).is_some());
    let count = |kind| ds.diagnostics().iter().filter(|d| d.kind == kind).count();
    assert!(count(DiagnosticKind::StructuralCorruption) == 2);
    assert!(count(DiagnosticKind::RecordCorruption) == 1);
}

#[test]
fn test_repeated_names_add_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rank0.txt");
    std::fs::write(
        &path,
        "Total: 100 samples\n 30 30% 30% 40 40% f\n 60 60% 90% 100 100% main\n 10 10% 100% 15 15% f\n",
    )
    .unwrap();
    let ds = load_sampler_files(&[path], &LoadControl::new()).unwrap();
    assert!(ds.diagnostics().is_empty());
    let f = ds.function_id("f").unwrap();
    let p = ds.thread((0, 0, 0)).unwrap().function_profile(f).unwrap();
    assert!(p.exclusive(0, 0) == 40.0);
    assert!(p.inclusive(0, 0) == 55.0);
    assert!(p.calls(0) == 1.0);
}
