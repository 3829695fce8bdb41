//! Per-stack lifecycle events and their sinks.
//!
//! The scheduler reports every state change to an [`EventSink`] from its
//! orchestrating thread. Two sinks ship: the console reporter that prints the
//! user-facing progress lines and flushes captured output, and a JSONL file
//! sink keyed by stack ID.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::core::path::ProjectPath;
use crate::core::state::{RunReport, StackState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Started,
    Succeeded,
    Failed,
    Canceled,
}

/// One lifecycle transition. Output buffers are empty unless captured.
#[derive(Debug, Clone, Copy)]
pub struct StackEvent<'a> {
    pub stack: &'a ProjectPath,
    pub id: Option<&'a str>,
    pub kind: EventKind,
    pub exit_code: Option<i32>,
    pub error: Option<&'a str>,
    pub stdout: &'a [u8],
    pub stderr: &'a [u8],
}

impl<'a> StackEvent<'a> {
    pub fn new(stack: &'a ProjectPath, id: Option<&'a str>, kind: EventKind) -> Self {
        Self {
            stack,
            id,
            kind,
            exit_code: None,
            error: None,
            stdout: &[],
            stderr: &[],
        }
    }
}

pub trait EventSink: Send {
    fn emit(&mut self, event: &StackEvent<'_>);
}

/// Fan-out to several sinks in order.
#[derive(Default)]
pub struct Sinks(pub Vec<Box<dyn EventSink>>);

impl EventSink for Sinks {
    fn emit(&mut self, event: &StackEvent<'_>) {
        for sink in &mut self.0 {
            sink.emit(event);
        }
    }
}

/// Console reporter: progress lines on stderr, captured output flushed whole.
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
    prefix: String,
    command_line: String,
}

impl ConsoleSink {
    pub fn new(
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
        command: &[String],
        dry_run: bool,
    ) -> Self {
        let prefix = if dry_run {
            "stackrun: (dry-run)".to_string()
        } else {
            "stackrun:".to_string()
        };
        Self {
            out,
            err,
            prefix,
            command_line: command.join(" "),
        }
    }

    pub fn stdio(command: &[String], dry_run: bool) -> Self {
        Self::new(
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
            command,
            dry_run,
        )
    }

    fn write(&mut self, event: &StackEvent<'_>) -> std::io::Result<()> {
        match event.kind {
            EventKind::Started => {
                writeln!(self.err, "{} Entering stack in {}", self.prefix, event.stack)?;
                writeln!(
                    self.err,
                    "{} Executing command {:?}",
                    self.prefix, self.command_line
                )?;
            }
            EventKind::Succeeded | EventKind::Failed => {
                if !event.stdout.is_empty() {
                    self.out.write_all(event.stdout)?;
                    self.out.flush()?;
                }
                if !event.stderr.is_empty() {
                    self.err.write_all(event.stderr)?;
                }
                if let Some(error) = event.error {
                    writeln!(self.err, "{} stack {} failed: {error}", self.prefix, event.stack)?;
                }
            }
            EventKind::Canceled => {}
        }
        self.err.flush()
    }
}

impl EventSink for ConsoleSink {
    fn emit(&mut self, event: &StackEvent<'_>) {
        if let Err(err) = self.write(event) {
            warn!(err = %err, "failed to write console output");
        }
    }
}

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    timestamp: String,
    stack: &'a ProjectPath,
    id: &'a str,
    state: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// JSONL sink, one object per line. Events of stacks without an ID are dropped.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn append(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, event: &StackEvent<'_>) -> Result<()> {
        let Some(id) = event.id else {
            return Ok(());
        };
        let record = EventRecord {
            timestamp: Utc::now().to_rfc3339(),
            stack: event.stack,
            id,
            state: event.kind,
            exit_code: event.exit_code,
            error: event.error,
        };
        serde_json::to_writer(&mut self.writer, &record).context("serialize event")?;
        self.writer.write_all(b"\n").context("write event")?;
        self.writer.flush().context("flush events")?;
        Ok(())
    }
}

impl EventSink for JsonlSink {
    fn emit(&mut self, event: &StackEvent<'_>) {
        if let Err(err) = self.write(event) {
            warn!("failed to write event: {err:#}");
        }
    }
}

/// Render the end-of-run state table.
pub fn write_summary(w: &mut dyn Write, report: &RunReport) -> std::io::Result<()> {
    if report.order.is_empty() {
        return writeln!(w, "stackrun: no stacks selected");
    }
    writeln!(w, "stackrun: run summary")?;
    for (stack, outcome) in report.rows() {
        let detail = match (&outcome.error, outcome.exit_code) {
            (Some(error), _) => format!("  ({error})"),
            (None, Some(code)) if outcome.state == StackState::Failed => {
                format!("  (exit code {code})")
            }
            _ => String::new(),
        };
        writeln!(w, "  {:<9} {stack}{detail}", outcome.state.as_str())?;
    }
    writeln!(
        w,
        "stackrun: {} ok, {} failed, {} canceled",
        report.count(StackState::Ok),
        report.count(StackState::Failed),
        report.count(StackState::Canceled)
    )
}
