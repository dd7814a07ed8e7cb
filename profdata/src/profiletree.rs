// Enumerate the profile files in a flat-text profile tree.
//
// A profile tree is either a single directory of per-thread files, which then holds one metric, or
// a directory of metric directories, one per metric:
//
//    <root>/profile.<node>.<context>.<thread>
//
//    <root>/MULTI__<metric>/profile.<node>.<context>.<thread>
//
// The metric directories are visited in name order, which fixes the metric ids.  Within a directory
// the files are visited in (node, context, thread) order.  Anything that does not match the naming
// scheme is ignored.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

pub const MULTI_PREFIX: &str = "MULTI__";

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadFile {
    pub path: PathBuf,
    pub node: i32,
    pub context: i32,
    pub thread: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDirectory {
    pub path: PathBuf,
    /// The metric name encoded in the directory name, if any.
    pub metric_hint: Option<String>,
    pub files: Vec<ThreadFile>,
}

/// Parse "profile.N.C.T" into (N, C, T).

pub fn parse_profile_filename(name: &str) -> Option<(i32, i32, i32)> {
    let rest = name.strip_prefix("profile.")?;
    let mut parts = rest.split('.');
    let node = parts.next()?.parse::<i32>().ok()?;
    let context = parts.next()?.parse::<i32>().ok()?;
    let thread = parts.next()?.parse::<i32>().ok()?;
    if parts.next().is_some() || node < 0 || context < 0 || thread < 0 {
        return None;
    }
    Some((node, context, thread))
}

/// Find the metric directories and their thread files below `root`.
///
/// This returns an error if `root` is not a directory, if a directory that should be scanned
/// cannot be read, or if no profile files are found at all.  It does not open the profile files.

pub fn find_profiles(root: &Path) -> Result<Vec<MetricDirectory>> {
    if !root.is_dir() {
        bail!("No profile directory at {}", root.display());
    }

    let mut metric_dirs = vec![];
    for entry in root.read_dir()? {
        let entry = match entry {
            Ok(e) => e,
            // Bad directory entries are ignored
            Err(_) => continue,
        };
        let p = entry.path();
        if !p.is_dir() {
            continue;
        }
        if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
            if let Some(metric) = name.strip_prefix(MULTI_PREFIX) {
                metric_dirs.push((p.clone(), Some(metric.to_string())));
            }
        }
    }
    if metric_dirs.is_empty() {
        metric_dirs.push((root.to_path_buf(), None));
    }
    metric_dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut result = vec![];
    let mut num_files = 0;
    for (path, metric_hint) in metric_dirs {
        let files = find_thread_files(&path)?;
        num_files += files.len();
        result.push(MetricDirectory {
            path,
            metric_hint,
            files,
        });
    }
    if num_files == 0 {
        bail!("No profile files found in {}", root.display());
    }
    Ok(result)
}

fn find_thread_files(dir: &Path) -> Result<Vec<ThreadFile>> {
    let mut files = vec![];
    for entry in dir.read_dir()? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        // Non-UTF8 names can't match the naming scheme.
        let name = match p.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some((node, context, thread)) = parse_profile_filename(name) {
            files.push(ThreadFile {
                path: p.clone(),
                node,
                context,
                thread,
            });
        }
    }
    files.sort_by_key(|f| (f.node, f.context, f.thread));
    Ok(files)
}

#[test]
fn test_parse_profile_filename() {
    assert!(parse_profile_filename("profile.0.0.0") == Some((0, 0, 0)));
    assert!(parse_profile_filename("profile.12.3.45") == Some((12, 3, 45)));
    assert!(parse_profile_filename("profile.0.0") == None);
    assert!(parse_profile_filename("profile.0.0.0.1") == None);
    assert!(parse_profile_filename("profile.a.0.0") == None);
    assert!(parse_profile_filename("profile.-1.0.0") == None);
    assert!(parse_profile_filename("dump.0.0.0") == None);
}

#[test]
fn test_find_profiles_single() {
    let dirs = find_profiles(Path::new("../profile_test_data/flat/single")).unwrap();
    assert!(dirs.len() == 1);
    assert!(dirs[0].metric_hint.is_none());
    let keys = dirs[0].files.iter().map(|f| (f.node, f.context, f.thread)).collect::<Vec<_>>();
    assert!(keys == vec![(0, 0, 0), (0, 0, 1), (1, 0, 0)]);
}

#[test]
fn test_find_profiles_multi() {
    let dirs = find_profiles(Path::new("../profile_test_data/flat/multi")).unwrap();
    assert!(dirs.len() == 2);
    assert!(dirs[0].metric_hint.as_deref() == Some("PAPI_FP_OPS"));
    assert!(dirs[1].metric_hint.as_deref() == Some("TIME"));
    assert!(dirs[1].files.len() == 2);
}

#[test]
fn test_find_profiles_errors() {
    // No such directory
    assert!(find_profiles(Path::new("../profile_test_data/flat/nonexistent")).is_err());

    // A directory without profiles
    assert!(find_profiles(Path::new("../profile_test_data/config")).is_err());
}
