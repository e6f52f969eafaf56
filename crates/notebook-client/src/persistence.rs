//! Persistence coordinator: serializes the cell store and submits it to the
//! kernel service as a single `save_notebook` request.
//!
//! Durability is the service's job. This side keeps no versions and does no
//! diffing; the last save received by the service wins. Only one save is
//! tracked as pending: the acknowledgement (`save_result`) arrives later as
//! an event and resolves it.

use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cell_store::CellStore;
use crate::connection::{ConnectionError, MessageSink};
use crate::protocol::{ClientMessage, SaveResult};

/// Persisted representation of a notebook document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookContent {
    pub cells: Vec<PersistedCell>,
}

/// One cell as persisted by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCell {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_cell_type")]
    pub cell_type: String,
    #[serde(default)]
    pub source: String,
    /// Last output text; empty when the cell has no output.
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_cell_type() -> String {
    "code".to_string()
}

impl NotebookContent {
    /// Snapshot the store in display order. Identical stores always produce
    /// identical content.
    pub fn from_store(store: &CellStore) -> Self {
        let cells = store
            .cells()
            .iter()
            .map(|cell| PersistedCell {
                id: cell.id.clone(),
                cell_type: default_cell_type(),
                source: cell.source.clone(),
                outputs: if cell.output.is_empty() {
                    Vec::new()
                } else {
                    vec![cell.output.clone()]
                },
            })
            .collect();
        Self { cells }
    }

    /// Split a percent-format script into cells on `# %%` marker lines.
    /// Text before the first marker becomes a cell of its own when it is not
    /// blank. Cells get no ids; [`CellStore::from_content`] assigns them.
    pub fn from_script(text: &str) -> Self {
        let mut sources: Vec<Vec<&str>> = vec![Vec::new()];
        for line in text.lines() {
            if line.trim_start().starts_with(CELL_MARKER) {
                sources.push(Vec::new());
            } else if let Some(current) = sources.last_mut() {
                current.push(line);
            }
        }

        let cells = sources
            .into_iter()
            .enumerate()
            .map(|(i, lines)| (i, lines.join("\n").trim().to_string()))
            .filter(|(i, source)| *i > 0 || !source.is_empty())
            .map(|(_, source)| PersistedCell {
                id: String::new(),
                cell_type: default_cell_type(),
                source,
                outputs: Vec::new(),
            })
            .collect();
        Self { cells }
    }
}

const CELL_MARKER: &str = "# %%";

/// How a save ended, as reported to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { message: Option<String> },
    Failed { error: String },
}

/// Tracks the single pending save.
#[derive(Debug, Default)]
pub struct PersistenceCoordinator {
    pending_since: Option<Instant>,
}

impl PersistenceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a save has been sent and not yet acknowledged.
    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Serialize the store and send it. Fails with `NotConnected` when there
    /// is no active session; nothing is buffered.
    pub fn save(
        &mut self,
        store: &CellStore,
        sink: &mut dyn MessageSink,
    ) -> Result<(), ConnectionError> {
        let message = ClientMessage::SaveNotebook {
            notebook_path: store.path().to_string(),
            content: NotebookContent::from_store(store),
        };
        sink.send(message)?;

        if self.pending_since.is_some() {
            debug!("[persistence] New save supersedes the pending one");
        }
        self.pending_since = Some(Instant::now());
        info!(
            "[persistence] Save sent for {} ({} cells)",
            store.path(),
            store.len()
        );
        Ok(())
    }

    /// Resolve the pending save from the service's acknowledgement.
    pub fn on_save_result(&mut self, result: SaveResult) -> Option<SaveOutcome> {
        let Some(since) = self.pending_since.take() else {
            warn!("[persistence] save_result received with no pending save, ignoring");
            return None;
        };

        if result.success {
            info!(
                "[persistence] Save acknowledged after {:?}",
                since.elapsed()
            );
            Some(SaveOutcome::Saved {
                message: result.message,
            })
        } else {
            let error = result
                .error
                .or(result.message)
                .unwrap_or_else(|| "save failed".to_string());
            warn!("[persistence] Save failed: {}", error);
            Some(SaveOutcome::Failed { error })
        }
    }

    /// The connection dropped; a pending acknowledgement can no longer arrive.
    pub fn on_disconnected(&mut self) -> Option<SaveOutcome> {
        self.pending_since.take().map(|_| {
            warn!("[persistence] Connection lost with a save pending");
            SaveOutcome::Failed {
                error: "connection lost before the save was acknowledged".to_string(),
            }
        })
    }
}
