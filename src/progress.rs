//! Pipeline state and progress reporting.
//!
//! Every source run walks the state machine below; each transition is
//! emitted as a [`ProgressEvent`] to a [`ProgressReporter`]. Progress goes
//! to **stderr** so stdout remains parseable for scripts.
//!
//! ```text
//! Idle → Loading → Normalizing → Batching → Indexing(1..n) → Cleanup → Done
//!           │           │            │            │              │
//!           └───────────┴────────────┴────────────┴──────────────┴──▶ Failed
//! ```

use serde::Serialize;
use std::io::{IsTerminal, Write};
use std::sync::Mutex;

/// State of one source run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    /// Listing identities and fetching payloads.
    Loading,
    Normalizing { records: usize },
    Batching { documents: usize },
    /// Writing batch `batch` (1-based) of `total`.
    Indexing { batch: usize, total: usize },
    /// Purge (full) or sweep (incremental).
    Cleanup,
    Done,
    Failed { reason: String },
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Loading => "loading",
            PipelineState::Normalizing { .. } => "normalizing",
            PipelineState::Batching { .. } => "batching",
            PipelineState::Indexing { .. } => "indexing",
            PipelineState::Cleanup => "cleanup",
            PipelineState::Done => "done",
            PipelineState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed { .. })
    }
}

/// A state transition of the run writing into `namespace`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub namespace: String,
    #[serde(flatten)]
    pub state: PipelineState,
}

/// Receives state transitions. Called from the pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: `sync cix:s3:docs  indexing  2 / 10 batches`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let detail = match &event.state {
            PipelineState::Normalizing { records } => {
                format!("  {} records", format_number(*records))
            }
            PipelineState::Batching { documents } => {
                format!("  {} documents", format_number(*documents))
            }
            PipelineState::Indexing { batch, total } => {
                format!("  {} / {} batches", batch, total)
            }
            PipelineState::Failed { reason } => format!("  {}", reason),
            _ => String::new(),
        };
        let line = format!("sync {}  {}{}\n", event.namespace, event.state.name(), detail);
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Keeps every event; used to assert on transitions.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// State names seen for `namespace`, in order.
    pub fn states(&self, namespace: &str) -> Vec<&'static str> {
        self.events()
            .iter()
            .filter(|e| e.namespace == namespace)
            .map(|e| e.state.name())
            .collect()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}

pub fn format_number(n: usize) -> String {
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
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
