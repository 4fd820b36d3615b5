use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunSummary};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Phase messages are dropped so stdout carries only the JSON document;
/// row-level progress still reaches stderr through tracing.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(
            stdout,
            "wrote {} rows to {} ({})",
            summary.rows_written, summary.output, summary.pipeline
        )?;
        if let Some(tally) = &summary.tally {
            writeln!(
                stdout,
                "  rows: {} processed, {} matched, {} malformed, {} unresolved ({:.2}% dropped)",
                tally.rows,
                tally.matched,
                tally.parse_errors,
                tally.unresolved,
                tally.dropped_fraction() * 100.0
            )?;
        }
        if let Some(remote) = &summary.remote {
            writeln!(
                stdout,
                "  remote: {} entities, {} ok, {} exhausted, {} not run, \
                 {} calls, peak {} in flight, {} pool rebuilds",
                remote.entities,
                remote.succeeded,
                remote.exhausted,
                remote.not_run,
                remote.calls_issued,
                remote.peak_in_flight,
                remote.pool_rebuilds
            )?;
        }
        if summary.cancelled {
            writeln!(stdout, "  run timed out; output holds partial results")?;
        }
        Ok(())
    }
}
