//! In-memory document model for the open notebook.
//!
//! The store exclusively owns every [`Cell`]. Other components read cells
//! through snapshots and change them only through the mutation methods here,
//! which enforce the per-cell execution state machine.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::persistence::NotebookContent;

/// Execution lifecycle of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecutionState {
    /// Whether `self -> next` is an edge of the execution state machine.
    ///
    /// `Running -> Queued` is the reconnect edge: a request that was in
    /// flight when the connection dropped is resubmitted.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Idle | Completed | Failed, Queued)
                | (Queued, Running)
                | (Running, Completed | Failed | Queued)
        )
    }

    /// Queued or running.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ExecutionState::Queued | ExecutionState::Running)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Idle => write!(f, "idle"),
            ExecutionState::Queued => write!(f, "queued"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Completed => write!(f, "completed"),
            ExecutionState::Failed => write!(f, "failed"),
        }
    }
}

/// A single code cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Unique within the document and never reused.
    pub id: String,
    pub source: String,
    pub execution_state: ExecutionState,
    /// Last successful result text.
    pub output: String,
    /// Last failure message. Kept independently of `output`.
    pub error: Option<String>,
}

impl Cell {
    fn new(id: String, source: String) -> Self {
        Self {
            id,
            source,
            execution_state: ExecutionState::Idle,
            output: String::new(),
            error: None,
        }
    }
}

/// Error type for cell store operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CellStoreError {
    #[error("Cannot delete the only remaining cell")]
    LastCell,

    #[error("Cell not found: {0}")]
    CellNotFound(String),

    #[error("Invalid transition for cell {cell_id}: {from} -> {to}")]
    InvalidTransition {
        cell_id: String,
        from: ExecutionState,
        to: ExecutionState,
    },
}

/// Ordered collection of cells for one notebook document.
///
/// Iteration order is display and execution-numbering order. Cells are only
/// ever appended; nothing reorders them.
#[derive(Debug, Clone)]
pub struct CellStore {
    path: String,
    cells: Vec<Cell>,
    next_id: u64,
}

impl CellStore {
    /// New document with a single empty cell with id `"1"`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cells: vec![Cell::new("1".to_string(), String::new())],
            next_id: 2,
        }
    }

    /// Load a document from its persisted content. All cells start `Idle`
    /// with their first persisted output. Empty or duplicate ids are replaced
    /// with fresh ones, and an empty document gets one empty cell.
    pub fn from_content(path: impl Into<String>, content: &NotebookContent) -> Self {
        let next_id = content
            .cells
            .iter()
            .filter_map(|c| c.id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max.saturating_add(1));

        let mut store = Self {
            path: path.into(),
            cells: Vec::with_capacity(content.cells.len().max(1)),
            next_id,
        };

        for persisted in &content.cells {
            let id = if persisted.id.is_empty() || store.contains(&persisted.id) {
                store.allocate_id()
            } else {
                persisted.id.clone()
            };
            let mut cell = Cell::new(id, persisted.source.clone());
            cell.output = persisted.outputs.first().cloned().unwrap_or_default();
            store.cells.push(cell);
        }

        if store.cells.is_empty() {
            let id = store.allocate_id();
            store.cells.push(Cell::new(id, String::new()));
        }
        store
    }

    /// Addressing key for execute and save requests.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always false: a document has at least one cell.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id)
    }

    pub fn contains(&self, cell_id: &str) -> bool {
        self.get(cell_id).is_some()
    }

    /// Zero-based position of the cell in display order.
    pub fn position(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id == cell_id)
    }

    /// Append a new empty `Idle` cell and return its id.
    pub fn add_cell(&mut self) -> String {
        let id = self.allocate_id();
        self.cells.push(Cell::new(id.clone(), String::new()));
        id
    }

    /// Replace a cell's source. Allowed in every execution state; an in-flight
    /// run keeps the source captured when it was submitted.
    pub fn update_source(&mut self, cell_id: &str, text: &str) -> Result<(), CellStoreError> {
        let cell = self.cell_mut(cell_id)?;
        cell.source = text.to_string();
        Ok(())
    }

    /// Remove a cell. The only remaining cell can never be removed.
    pub fn delete_cell(&mut self, cell_id: &str) -> Result<Cell, CellStoreError> {
        let idx = self
            .position(cell_id)
            .ok_or_else(|| CellStoreError::CellNotFound(cell_id.to_string()))?;
        if self.cells.len() <= 1 {
            return Err(CellStoreError::LastCell);
        }
        Ok(self.cells.remove(idx))
    }

    /// Move a cell to `Queued` for a new run, clearing its previous result.
    /// Returns the source captured for submission.
    pub fn begin_run(&mut self, cell_id: &str) -> Result<String, CellStoreError> {
        self.transition(cell_id, ExecutionState::Queued)?;
        let cell = self.cell_mut(cell_id)?;
        cell.output.clear();
        cell.error = None;
        Ok(cell.source.clone())
    }

    /// Move a cell along one edge of the execution state machine.
    pub fn transition(&mut self, cell_id: &str, next: ExecutionState) -> Result<(), CellStoreError> {
        let cell = self.cell_mut(cell_id)?;
        let from = cell.execution_state;
        if !from.can_transition_to(next) {
            return Err(CellStoreError::InvalidTransition {
                cell_id: cell_id.to_string(),
                from,
                to: next,
            });
        }
        cell.execution_state = next;
        Ok(())
    }

    /// Store a result and finish the run: `Failed` when `error` is present,
    /// `Completed` otherwise.
    ///
    /// Returns `Ok(false)` without touching the store when the cell no longer
    /// exists.
    pub fn apply_result(
        &mut self,
        cell_id: &str,
        output: &str,
        error: Option<&str>,
    ) -> Result<bool, CellStoreError> {
        if !self.contains(cell_id) {
            debug!("[cell-store] Result for deleted cell {}, ignoring", cell_id);
            return Ok(false);
        }
        let next = if error.is_some() {
            ExecutionState::Failed
        } else {
            ExecutionState::Completed
        };
        self.transition(cell_id, next)?;
        let cell = self.cell_mut(cell_id)?;
        cell.output = output.to_string();
        cell.error = error.map(str::to_string);
        Ok(true)
    }

    fn cell_mut(&mut self, cell_id: &str) -> Result<&mut Cell, CellStoreError> {
        self.cells
            .iter_mut()
            .find(|c| c.id == cell_id)
            .ok_or_else(|| CellStoreError::CellNotFound(cell_id.to_string()))
    }

    fn allocate_id(&mut self) -> String {
        loop {
            let id = self.next_id.to_string();
            self.next_id = self.next_id.wrapping_add(1);
            if !self.contains(&id) {
                return id;
            }
        }
    }
}
