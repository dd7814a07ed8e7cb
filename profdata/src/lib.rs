// This library reads parallel performance profiles in several formats into one model of a trial:
// functions, metrics, user events and groups, and per-thread profiles with snapshots.  After a load
// it computes the cross-thread aggregates (mean, total, standard deviation, min, max) and, on
// request, the call graph implied by call-path function names.
//
// Formats:
//
//  - flat-text profile trees, one file per thread and metric (profiletree, profilefile)
//  - trace-summary reports (tracesummary)
//  - XML snapshot streams (snapshotxml)
//  - sampler dumps (sampler)
//  - relational profile databases, which can also be written (database)
//
// Use `load_trial` with a `Source` to load and post-process a trial in one step.

mod callpath;
mod configs;
mod control;
mod database;
mod derived;
mod diag;
mod interner;
mod load;
mod metadata;
mod model;
mod profilefile;
mod profiletree;
mod sampler;
mod snapshotxml;
mod thread;
mod tracesummary;

use chrono::prelude::DateTime;
use chrono::Utc;

pub type FunctionId = usize;
pub type MetricId = usize;
pub type UserEventId = usize;
pub type GroupId = usize;

/// (node, context, thread).  Aggregate threads have the aggregate's sentinel in all three.
pub type ThreadKey = (i32, i32, i32);

pub type Timestamp = DateTime<Utc>;

// The model.

pub use model::{
    Context, DataSource, Function, Group, Metric, Node, UserEvent, CALLPATH_DERIVED_GROUP,
    CALLPATH_GROUP, CALLPATH_SEPARATOR,
};
pub use thread::{
    AggregateKind, FunctionProfile, MetricValues, Snapshot, Thread, UserEventProfile,
    UserEventStats, ALL_AGGREGATES,
};
pub use diag::{Diagnostic, DiagnosticKind};
pub use interner::Interner;
pub use metadata::{parse_metadata_block, parse_start_time, START_TIME_KEY};

// Loading.

pub use configs::{read_from_json, LoadConfig, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY};
pub use control::LoadControl;
pub use load::{load_trial, Source};

// The individual parsers, for callers that want to run them directly.  These do not compute the
// derived data.

pub use database::{load_trial as load_database_trial, upload_trial, SchemaVersion};
pub use profilefile::{
    load_profile_tree, parse_function_line, parse_profile_text, parse_user_event_line, FileError,
    ParsedFunction, ParsedProfile, ParsedUserEvent,
};
pub use profiletree::{find_profiles, MetricDirectory, ThreadFile};
pub use sampler::{load_sampler_files, parse_sample_line, SampleLine};
pub use snapshotxml::{load_snapshot_xml, parse_snapshot_xml};
pub use tracesummary::{load_trace_summary, parse_trace_summary};

// Post-processing.

pub use callpath::{split_callpath, CallGraph, Edge, Walker};
pub use derived::generate_derived_data;
