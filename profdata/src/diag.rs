// Non-fatal anomalies found while loading.  These never abort a trial; they are recorded on the
// DataSource (or on a call graph) so that callers can inspect them, and they are logged.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Unparsable header or first record; the file was skipped.
    StructuralCorruption,
    /// One malformed data record; the record was skipped.
    RecordCorruption,
    /// The source could not be read even after retrying; the thread's values were zeroed.
    TransientIo,
    /// A negative value was clamped to zero.
    NegativeValue,
    /// A call-path endpoint could not be resolved; the link was skipped.
    MissingReference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// File name, table name or thread, whatever identifies where the problem is.
    pub source: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, source: &str, message: String) -> Diagnostic {
        log::warn!("{source}: {message}");
        Diagnostic {
            kind,
            source: source.to_string(),
            message,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {}: {}", self.kind, self.source, self.message)
    }
}
