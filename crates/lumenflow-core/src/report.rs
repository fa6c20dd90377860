//! The capability-trait logging idiom the teacher uses throughout its
//! orchestration layer instead of pulling in `tracing`/`log` (spec.md §9,
//! SPEC_FULL.md Ambient stack). Every orchestration function threads a
//! `&mut dyn Reporter` by value; there is no global logger.

/// Narrow reporting surface: info/warn/error, nothing else. The CLI
/// implements this as prefixed `eprintln!`; tests implement it as a
/// `Vec<String>` sink so assertions can inspect what was reported.
pub trait Reporter {
    fn info(&mut self, message: &str);
    fn warn(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

/// A reporter that discards everything; useful for library callers (and
/// tests) that don't care about progress narration.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _message: &str) {}
    fn warn(&mut self, _message: &str) {}
    fn error(&mut self, _message: &str) {}
}

/// Collects every reported line in order, tagged by level; used by this
/// crate's own tests to assert on guard/pipeline narration.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    pub lines: Vec<(Level, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Reporter for RecordingReporter {
    fn info(&mut self, message: &str) {
        self.lines.push((Level::Info, message.to_string()));
    }
    fn warn(&mut self, message: &str) {
        self.lines.push((Level::Warn, message.to_string()));
    }
    fn error(&mut self, message: &str) {
        self.lines.push((Level::Error, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_preserves_order_and_level() {
        let mut r = RecordingReporter::default();
        r.info("starting");
        r.warn("hmm");
        r.error("failed");
        assert_eq!(
            r.lines,
            vec![
                (Level::Info, "starting".to_string()),
                (Level::Warn, "hmm".to_string()),
                (Level::Error, "failed".to_string()),
            ]
        );
    }
}
