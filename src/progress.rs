//! Collect progress and device display.
//!
//! Reports what the ingestion loop is doing so operators can follow it:
//! received device attributes (in `--show` / `--show-all` modes) and the
//! running count of stored rows. Progress is emitted on **stderr** so stdout
//! stays free for command output.

use std::io::Write;

use serde_json::Value;

use crate::models::Attributes;

/// A single progress event from the ingestion loop.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// A decoded device message, reported only when display is enabled.
    Received {
        topic: String,
        location: String,
        unit_name: String,
        attributes: Attributes,
    },
    /// A row was stored; `total` is the loop's insertion count.
    Inserted { table: String, total: u64 },
}

/// Reports ingest progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly output: an attribute block per device message and
/// "meter1 TABLE: Added count: 1,234" per stored row.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let text = match &event {
            IngestProgressEvent::Received {
                location,
                unit_name,
                attributes,
                ..
            } => {
                let mut block = format!(
                    "\n********** {}/{} DEVICE ATTRIBUTES **********\n",
                    location, unit_name
                );
                for (key, value) in attributes {
                    block.push_str(&format!("{:<24} = {}\n", key, display_value(value)));
                }
                block
            }
            IngestProgressEvent::Inserted { table, total } => {
                format!("{} TABLE: Added count: {}\n", table, format_number(*total))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(text.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Received {
                topic,
                location,
                unit_name,
                attributes,
            } => serde_json::json!({
                "event": "received",
                "topic": topic,
                "location": location,
                "unit_name": unit_name,
                "attributes": attributes,
            }),
            IngestProgressEvent::Inserted { table, total } => serde_json::json!({
                "event": "inserted",
                "table": table,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
