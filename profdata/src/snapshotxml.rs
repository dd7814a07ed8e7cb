// Parser for event-driven XML snapshot profiles.
//
// A document declares threads, then definitions that give names to small integer ids, then any
// number of profiles.  Each profile is one snapshot of one thread:
//
//   <thread id="0" node="0" context="0" thread="0"> [<metadata>...</metadata>] </thread>
//   <definitions thread="*">
//     <metric id="0"><name>Time</name></metric>
//     <event id="0"><name>main</name><group>TAU_DEFAULT</group></event>
//     <userevent id="0"><name>Message size</name></userevent>
//   </definitions>
//   <profile thread="0">
//     <name>iteration 1</name>
//     <timestamp>1690000001000000</timestamp>
//     <interval_data metrics="0 1">
//       eventid calls subroutines exclusive inclusive ...      (one pair per listed metric)
//     </interval_data>
//     <atomic_data>
//       usereventid count max min mean sumsqr
//     </atomic_data>
//   </profile>
//   <derivedprofile derivedentity="mean"> ... </derivedprofile>
//
// Definitions are either shared by all threads (thread="*") or local to one thread (thread="<id>"),
// and a document uses one style throughout.  A derivedprofile carries an aggregate computed by the
// producer; it may name the thread whose definitions it uses.
//
// Values within a profile are applied when the profile element closes, to a new snapshot that
// starts out as a copy of the previous one.

use crate::control::LoadControl;
use crate::diag::DiagnosticKind;
use crate::metadata::{parse_start_time, START_TIME_KEY};
use crate::model::DataSource;
use crate::thread::{AggregateKind, UserEventStats};
use crate::{FunctionId, MetricId, ThreadKey, Timestamp, UserEventId};

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, XmlEvent};

#[derive(Debug, Default)]
struct Definitions {
    metrics: HashMap<usize, MetricId>,
    events: HashMap<usize, FunctionId>,
    user_events: HashMap<usize, UserEventId>,
}

#[derive(Debug)]
enum DefinitionMode {
    Unified(Definitions),
    PerThread(HashMap<String, Definitions>),
}

#[derive(Debug, Clone, Copy)]
enum DefinitionKind {
    Metric,
    Event,
    UserEvent,
}

#[derive(Debug)]
struct PendingDefinition {
    kind: DefinitionKind,
    id: Option<usize>,
    name: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Thread(ThreadKey),
    Aggregate(AggregateKind),
}

#[derive(Debug)]
struct PendingProfile {
    target: Target,
    // The thread id whose definitions apply, for per-thread definitions.
    scope: Option<String>,
    name: Option<String>,
    timestamp: Option<Timestamp>,
    // (metrics attribute, records)
    intervals: Vec<(String, String)>,
    atomics: Vec<String>,
}

struct IntervalRecord {
    function: FunctionId,
    calls: f64,
    subroutines: f64,
    // (metric, exclusive, inclusive)
    values: Vec<(MetricId, f64, f64)>,
}

struct SnapshotParser<'a> {
    ds: DataSource,
    source: &'a str,
    control: &'a LoadControl,
    threads: HashMap<String, ThreadKey>,
    mode: Option<DefinitionMode>,
    scope: Option<String>,
    current_thread: Option<ThreadKey>,
    definition: Option<PendingDefinition>,
    profile: Option<PendingProfile>,
    interval_metrics: Option<String>,
    attribute: (Option<String>, Option<String>),
    stack: Vec<String>,
    text: String,
}

pub fn load_snapshot_xml(path: &Path, control: &LoadControl) -> Result<DataSource> {
    let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    parse_snapshot_xml(BufReader::new(file), &path.display().to_string(), control)
}

/// Parse a whole document.  Malformed XML and inconsistent definitions are errors; bad records are
/// recorded as diagnostics and skipped.

pub fn parse_snapshot_xml<R: Read>(
    reader: R,
    source: &str,
    control: &LoadControl,
) -> Result<DataSource> {
    let mut p = SnapshotParser {
        ds: DataSource::new(),
        source,
        control,
        threads: HashMap::new(),
        mode: None,
        scope: None,
        current_thread: None,
        definition: None,
        profile: None,
        interval_metrics: None,
        attribute: (None, None),
        stack: vec![],
        text: String::new(),
    };
    for event in EventReader::new(reader) {
        match event.with_context(|| format!("{source}: Malformed XML"))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                p.text.clear();
                p.start_element(&name.local_name, &attributes)?;
                p.stack.push(name.local_name);
            }
            XmlEvent::EndElement { name } => {
                p.stack.pop();
                let text = std::mem::take(&mut p.text);
                p.end_element(&name.local_name, text.trim())?;
            }
            XmlEvent::Characters(s) | XmlEvent::CData(s) => p.text.push_str(&s),
            _ => {}
        }
    }
    Ok(p.ds)
}

fn attr<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

impl<'a> SnapshotParser<'a> {
    fn corrupt(&mut self, msg: String) {
        self.ds.record(DiagnosticKind::RecordCorruption, self.source, msg);
    }

    fn start_element(&mut self, name: &str, attributes: &[OwnedAttribute]) -> Result<()> {
        let parent = self.stack.last().cloned().unwrap_or_default();
        match (name, parent.as_str()) {
            ("thread", _) => {
                let id = attr(attributes, "id");
                let num = |n| attr(attributes, n).and_then(|v| v.trim().parse::<i32>().ok());
                match (id, num("node"), num("context"), num("thread")) {
                    (Some(id), Some(n), Some(c), Some(t)) if n < 0 || c < 0 || t < 0 => {
                        self.corrupt(format!("Negative id {n}.{c}.{t} for thread \"{id}\""))
                    }
                    (Some(id), Some(n), Some(c), Some(t)) => {
                        self.ds.get_or_create_thread(n, c, t);
                        self.threads.insert(id.to_string(), (n, c, t));
                        self.current_thread = Some((n, c, t));
                    }
                    _ => self.corrupt("Incomplete thread element".to_string()),
                }
            }
            ("attribute", _) => self.attribute = (None, None),
            ("definitions", _) => self.start_definitions(attr(attributes, "thread"))?,
            ("metric" | "event" | "userevent", "definitions") => {
                let kind = match name {
                    "metric" => DefinitionKind::Metric,
                    "event" => DefinitionKind::Event,
                    _ => DefinitionKind::UserEvent,
                };
                self.definition = Some(PendingDefinition {
                    kind,
                    id: attr(attributes, "id").and_then(|v| v.trim().parse::<usize>().ok()),
                    name: None,
                    group: None,
                });
            }
            ("profile", _) => {
                self.control.add_to_total(1);
                let id = attr(attributes, "thread").unwrap_or_default();
                match self.threads.get(id) {
                    Some(key) => {
                        self.profile = Some(PendingProfile {
                            target: Target::Thread(*key),
                            scope: Some(id.to_string()),
                            name: None,
                            timestamp: None,
                            intervals: vec![],
                            atomics: vec![],
                        })
                    }
                    None => self.corrupt(format!("Profile for undeclared thread \"{id}\"")),
                }
            }
            ("derivedprofile", _) => {
                self.control.add_to_total(1);
                let entity = attr(attributes, "derivedentity").unwrap_or_default();
                match AggregateKind::from_name(entity) {
                    Some(kind) => {
                        self.profile = Some(PendingProfile {
                            target: Target::Aggregate(kind),
                            scope: attr(attributes, "thread").map(|s| s.to_string()),
                            name: None,
                            timestamp: None,
                            intervals: vec![],
                            atomics: vec![],
                        })
                    }
                    None => self.corrupt(format!("Unknown derived entity \"{entity}\"")),
                }
            }
            ("interval_data", _) => {
                self.interval_metrics = Some(attr(attributes, "metrics").unwrap_or_default().to_string())
            }
            _ => {}
        }
        Ok(())
    }

    fn end_element(&mut self, name: &str, text: &str) -> Result<()> {
        let parent = self.stack.last().cloned().unwrap_or_default();
        match (name, parent.as_str()) {
            ("name", "attribute") => self.attribute.0 = Some(text.to_string()),
            ("value", "attribute") => self.attribute.1 = Some(text.to_string()),
            ("attribute", _) => self.end_attribute(),
            ("thread", _) => self.current_thread = None,
            ("name", "metric" | "event" | "userevent") => {
                if let Some(d) = &mut self.definition {
                    d.name = Some(text.to_string());
                }
            }
            ("group", "event") => {
                if let Some(d) = &mut self.definition {
                    d.group = Some(text.to_string());
                }
            }
            ("metric" | "event" | "userevent", "definitions") => self.end_definition(),
            ("definitions", _) => self.scope = None,
            ("name", "profile" | "derivedprofile") => {
                if let Some(p) = &mut self.profile {
                    p.name = Some(text.to_string());
                }
            }
            ("timestamp", "profile" | "derivedprofile") => {
                if let Some(p) = &mut self.profile {
                    p.timestamp = parse_start_time(text);
                }
            }
            ("interval_data", _) => {
                let metrics = self.interval_metrics.take().unwrap_or_default();
                if let Some(p) = &mut self.profile {
                    p.intervals.push((metrics, text.to_string()));
                }
            }
            ("atomic_data", _) => {
                if let Some(p) = &mut self.profile {
                    p.atomics.push(text.to_string());
                }
            }
            ("profile" | "derivedprofile", _) => self.end_profile()?,
            _ => {}
        }
        Ok(())
    }

    fn start_definitions(&mut self, thread: Option<&str>) -> Result<()> {
        let scope = match thread {
            Some("*") | None => None,
            Some(id) => Some(id.to_string()),
        };
        match (&self.mode, &scope) {
            (None, None) => self.mode = Some(DefinitionMode::Unified(Definitions::default())),
            (None, Some(_)) => self.mode = Some(DefinitionMode::PerThread(HashMap::new())),
            (Some(DefinitionMode::Unified(_)), None) => {}
            (Some(DefinitionMode::PerThread(_)), Some(_)) => {}
            _ => bail!("{}: Mixed shared and per-thread definitions", self.source),
        }
        self.scope = scope;
        Ok(())
    }

    fn definitions(&self, scope: Option<&str>) -> Option<&Definitions> {
        match self.mode.as_ref()? {
            DefinitionMode::Unified(d) => Some(d),
            DefinitionMode::PerThread(m) => m.get(scope?),
        }
    }

    fn definitions_mut(&mut self) -> Option<&mut Definitions> {
        match self.mode.as_mut()? {
            DefinitionMode::Unified(d) => Some(d),
            DefinitionMode::PerThread(m) => Some(m.entry(self.scope.clone()?).or_default()),
        }
    }

    fn end_definition(&mut self) {
        let def = match self.definition.take() {
            Some(d) => d,
            None => return,
        };
        let (id, name) = match (def.id, def.name) {
            (Some(id), Some(name)) => (id, name),
            _ => {
                self.corrupt(format!("Incomplete {:?} definition", def.kind));
                return;
            }
        };
        match def.kind {
            DefinitionKind::Metric => {
                let m = self.ds.add_metric(&name);
                if let Some(d) = self.definitions_mut() {
                    d.metrics.insert(id, m);
                }
            }
            DefinitionKind::Event => {
                let f = self.ds.intern_function(&name);
                for g in def.group.as_deref().unwrap_or_default().split('|') {
                    let g = g.trim();
                    if !g.is_empty() {
                        let gid = self.ds.intern_group(g);
                        self.ds.add_function_to_group(f, gid);
                    }
                }
                if let Some(d) = self.definitions_mut() {
                    d.events.insert(id, f);
                }
            }
            DefinitionKind::UserEvent => {
                let e = self.ds.intern_user_event(&name);
                if let Some(d) = self.definitions_mut() {
                    d.user_events.insert(id, e);
                }
            }
        }
    }

    // Metadata inside a thread element belongs to the thread and, first come first served, to
    // the trial.
    fn end_attribute(&mut self) {
        let (name, value) = std::mem::take(&mut self.attribute);
        let name = match name {
            Some(n) => n,
            None => return,
        };
        let value = value.unwrap_or_default();
        if let Some(t) = self.current_thread.and_then(|key| self.ds.thread_mut(key)) {
            t.metadata.insert(name.clone(), value.clone());
        }
        if name == START_TIME_KEY && self.ds.start_time.is_none() {
            self.ds.start_time = parse_start_time(&value);
        }
        self.ds.add_metadata(&name, &value);
    }

    fn end_profile(&mut self) -> Result<()> {
        self.control.check()?;
        self.control.advance();
        let p = match self.profile.take() {
            Some(p) => p,
            None => return Ok(()),
        };

        let defs = match self.definitions(p.scope.as_deref()) {
            Some(d) => d,
            None => {
                self.corrupt("Profile without definitions".to_string());
                return Ok(());
            }
        };
        let mut anomalies = vec![];
        let mut intervals = vec![];
        for (metrics, records) in &p.intervals {
            let ids = metrics
                .split_whitespace()
                .map(|m| m.parse::<usize>().ok().and_then(|m| defs.metrics.get(&m).copied()))
                .collect::<Option<Vec<MetricId>>>();
            let ids = match ids {
                Some(ids) => ids,
                None => {
                    anomalies.push(format!("Undefined metric in \"{metrics}\""));
                    continue;
                }
            };
            for line in records.lines().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                match parse_interval_record(line, defs, &ids) {
                    Ok(r) => intervals.push(r),
                    Err(msg) => anomalies.push(msg),
                }
            }
        }
        let mut atomics = vec![];
        for records in &p.atomics {
            for line in records.lines().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                match parse_atomic_record(line, defs) {
                    Ok(r) => atomics.push(r),
                    Err(msg) => anomalies.push(msg),
                }
            }
        }
        for msg in anomalies {
            self.corrupt(msg);
        }

        let thread = match p.target {
            Target::Thread(key) => match self.ds.thread_mut(key) {
                Some(t) => t,
                None => return Ok(()),
            },
            Target::Aggregate(kind) => self.ds.materialize_aggregate(kind),
        };
        let name = p
            .name
            .unwrap_or_else(|| format!("snapshot {}", thread.snapshots().len()));
        let s = thread.add_snapshot(&name, p.timestamp);
        for r in intervals {
            let fp = thread.get_or_create_function_profile(r.function);
            fp.set_calls(s, r.calls);
            fp.set_subroutines(s, r.subroutines);
            for (m, excl, incl) in r.values {
                fp.set_exclusive(s, m, excl);
                fp.set_inclusive(s, m, incl);
            }
        }
        for (e, stats) in atomics {
            thread.get_or_create_user_event_profile(e).set_stats(s, stats);
        }
        Ok(())
    }
}

fn parse_numbers(line: &str) -> std::result::Result<(usize, Vec<f64>), String> {
    let mut fields = line.split_whitespace();
    let id = fields
        .next()
        .and_then(|f| f.parse::<usize>().ok())
        .ok_or_else(|| format!("Bad record id: {line}"))?;
    let values = fields
        .map(|f| f.parse::<f64>())
        .collect::<std::result::Result<Vec<f64>, _>>()
        .map_err(|_| format!("Bad number in record: {line}"))?;
    Ok((id, values))
}

fn parse_interval_record(
    line: &str,
    defs: &Definitions,
    metrics: &[MetricId],
) -> std::result::Result<IntervalRecord, String> {
    let (id, values) = parse_numbers(line)?;
    let function = *defs
        .events
        .get(&id)
        .ok_or_else(|| format!("Undefined event {id}: {line}"))?;
    if values.len() != 2 + 2 * metrics.len() {
        return Err(format!(
            "Expected {} values, found {}: {line}",
            2 + 2 * metrics.len(),
            values.len()
        ));
    }
    Ok(IntervalRecord {
        function,
        calls: values[0],
        subroutines: values[1],
        values: metrics
            .iter()
            .enumerate()
            .map(|(i, m)| (*m, values[2 + 2 * i], values[3 + 2 * i]))
            .collect(),
    })
}

fn parse_atomic_record(
    line: &str,
    defs: &Definitions,
) -> std::result::Result<(UserEventId, UserEventStats), String> {
    let (id, values) = parse_numbers(line)?;
    let event = *defs
        .user_events
        .get(&id)
        .ok_or_else(|| format!("Undefined user event {id}: {line}"))?;
    if values.len() != 5 {
        return Err(format!("Expected 5 values, found {}: {line}", values.len()));
    }
    Ok((
        event,
        UserEventStats {
            num_samples: values[0],
            max: values[1],
            min: values[2],
            mean: values[3],
            sum_squared: values[4],
        },
    ))
}

#[test]
fn test_load_snapshots() {
    let mut ds = load_snapshot_xml(
        Path::new("../profile_test_data/xml/snapshots.xml"),
        &LoadControl::new(),
    )
    .unwrap();
    assert!(ds.diagnostics().is_empty());
    assert!(ds.num_threads() == 2);
    assert!(ds.num_metrics() == 2);
    assert!(ds.start_time.is_some());
    let time = ds.metric_id("Time").unwrap();
    let ops = ds.metric_id("PAPI_FP_OPS").unwrap();
    let main = ds.function_id("main").unwrap();
    let solve = ds.function_id("solve").unwrap();
    assert!(ds.function_in_group(solve, "TAU_USER"));

    let t = ds.thread((0, 0, 0)).unwrap();
    assert!(t.metadata.get("Node Name").map(|s| s.as_str()) == Some("n001"));
    assert!(t.num_snapshots() == 2);
    assert!(t.snapshots()[1].name == "iteration 2");
    assert!(t.snapshots()[1].timestamp.is_some());
    let p = t.function_profile(main).unwrap();
    assert!(p.inclusive(0, time) == 50.0);
    assert!(p.inclusive(1, time) == 95.0);
    // Not in the second snapshot, so carried over from the first
    assert!(p.inclusive(1, ops) == 900.0);
    assert!(t.function_profile(solve).unwrap().calls(1) == 4.0);

    let e = ds.user_event_id("Message size").unwrap();
    let stats = t.user_event_profile(e).unwrap().stats(1);
    assert!(stats.num_samples == 2.0);
    assert!(stats.std_dev() == 24.0);

    assert!(ds.thread((0, 0, 1)).unwrap().num_snapshots() == 1);
    assert!(ds.call_graph_for((0, 0, 0)).unwrap().num_edges() == 1);

    // The producer's mean is kept, the rest is computed
    assert!(ds.is_materialized(AggregateKind::Mean));
    crate::derived::generate_derived_data(&mut ds);
    let mean = ds.aggregate(AggregateKind::Mean).unwrap();
    assert!(mean.function_profile(main).unwrap().inclusive(0, time) == 55.0);
    let total = ds.aggregate(AggregateKind::Total).unwrap();
    assert!(total.function_profile(main).unwrap().inclusive(0, time) == 110.0);
    assert!(total.function_profile(main).unwrap().inclusive(1, time) == 155.0);
}

#[test]
fn test_per_thread_definitions() {
    let doc = r#"<profile_xml>
<thread id="a" node="0" context="0" thread="0"/>
<thread id="b" node="1" context="0" thread="0"/>
<definitions thread="a">
<metric id="0"><name>Time</name></metric>
<event id="0"><name>main</name></event>
<event id="1"><name>work</name></event>
</definitions>
<definitions thread="b">
<metric id="0"><name>Time</name></metric>
<event id="0"><name>work</name></event>
<event id="1"><name>main</name></event>
</definitions>
<profile thread="a"><interval_data metrics="0">
0 1 1 5 10
1 1 0 5 5
</interval_data></profile>
<profile thread="b"><interval_data metrics="0">
0 1 0 7 7
1 1 1 3 10
9 1 0 1 1
1 1 0
</interval_data></profile>
</profile_xml>"#;
    let ds = parse_snapshot_xml(doc.as_bytes(), "doc", &LoadControl::new()).unwrap();
    assert!(ds.num_metrics() == 1);
    assert!(ds.functions().len() == 2);
    let main = ds.function_id("main").unwrap();
    let work = ds.function_id("work").unwrap();
    let b = ds.thread((1, 0, 0)).unwrap();
    assert!(b.function_profile(work).unwrap().inclusive(0, 0) == 7.0);
    assert!(b.function_profile(main).unwrap().exclusive(0, 0) == 3.0);
    assert!(b.snapshots()[0].name == "snapshot 0");
    let a = ds.thread((0, 0, 0)).unwrap();
    assert!(a.function_profile(main).unwrap().inclusive(0, 0) == 10.0);
    assert!(ds.diagnostics().len() == 2);
    assert!(ds.diagnostics().iter().all(|d| d.kind == DiagnosticKind::RecordCorruption));
}

#[test]
fn test_bad_documents() {
    let c = LoadControl::new();
    let mixed = r#"<p><definitions thread="*"/><definitions thread="a"/></p>"#;
    assert!(parse_snapshot_xml(mixed.as_bytes(), "doc", &c).is_err());
    let truncated = r#"<p><thread id="0" node="0""#;
    assert!(parse_snapshot_xml(truncated.as_bytes(), "doc", &c).is_err());
    assert!(load_snapshot_xml(Path::new("../profile_test_data/xml/nonexistent.xml"), &c).is_err());

    let undeclared = r#"<p><definitions thread="*"/><profile thread="7"/><derivedprofile derivedentity="median"/></p>"#;
    let ds = parse_snapshot_xml(undeclared.as_bytes(), "doc", &c).unwrap();
    assert!(ds.diagnostics().len() == 2);
    assert!(ds.num_threads() == 0);

    // Negative ids would alias the aggregate threads
    let negative = r#"<p><thread id="0" node="-1" context="0" thread="0"/><definitions thread="*"/><profile thread="0"/></p>"#;
    let ds = parse_snapshot_xml(negative.as_bytes(), "doc", &c).unwrap();
    assert!(ds.num_threads() == 0);
    assert!(ds.thread((-1, 0, 0)).is_none());
    assert!(ds.diagnostics().len() == 2);
    assert!(ds.diagnostics().iter().all(|d| d.kind == DiagnosticKind::RecordCorruption));
}

#[test]
fn test_snapshot_progress() {
    let control = LoadControl::new();
    load_snapshot_xml(Path::new("../profile_test_data/xml/snapshots.xml"), &control).unwrap();
    assert!(control.progress() == 1.0);
}
