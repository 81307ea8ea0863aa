//! User-facing progress and summary output.
//!
//! All progress goes through an injected writer so the CLI can be tested
//! without capturing the real stderr, and so `--quiet` is a caller
//! decision rather than ambient state.

use crate::ledger::RunReport;
use std::io::Write;

/// Write a line to the given writer, swallowing write failures.
///
/// Progress output must never turn a succeeding run into a failing one.
pub fn write_stderr_line(writer: &mut dyn Write, line: impl AsRef<str>) {
    let _ = writeln!(writer, "{}", line.as_ref());
}

/// Format the closing summary line for a report. Per-entry lines are
/// emitted live as entries finish; this is the final tally.
#[must_use]
pub fn run_summary(report: &RunReport) -> String {
    format!(
        "{} succeeded, {} failed, {} cancelled of {} entries",
        report.summary.succeeded,
        report.summary.failed,
        report.summary.cancelled,
        report.summary.total
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RunLedger;
    use chrono::Utc;

    #[test]
    fn write_stderr_line_appends_newline() {
        let mut buf = Vec::new();
        write_stderr_line(&mut buf, "hello");
        assert_eq!(buf, b"hello\n");
    }

    #[test]
    fn summary_counts_states() {
        let ledger = RunLedger::new();
        ledger.record(crate::ledger::RunOutcome::started("B", Utc::now()).success());
        ledger.record(
            crate::ledger::RunOutcome::started("A", Utc::now())
                .failed(crate::ledger::RunState::TransportError, "connect timeout"),
        );
        let report = ledger.finalize(Utc::now());

        assert_eq!(
            run_summary(&report),
            "1 succeeded, 1 failed, 0 cancelled of 2 entries"
        );
    }
}
