//! Execution coordinator: turns "run this cell" into `execute_cell` requests
//! and applies `cell_output` results back to the cell store.
//!
//! The correlation table maps a cell id to the bookkeeping for its one
//! outstanding request. A result only needs the cell id to resolve.
//!
//! Policies:
//! - A run requested while the connection is down leaves the cell `Queued`;
//!   it is sent when the connection comes back, without another click.
//! - A run requested while a request is already out for the cell does not
//!   send a second request. It marks the entry for a rerun, and when the
//!   current result arrives the cell is immediately resubmitted with the
//!   source it has at that moment.
//! - After a reconnect, every tracked request is sent again, including ones
//!   that were already sent (at-least-once; duplicate execution is accepted).
//! - Results for cells with no entry are discarded with a debug log.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cell_store::{CellStore, CellStoreError, ExecutionState};
use crate::connection::{ConnectionError, MessageSink};
use crate::protocol::{CellOutput, ClientMessage};

/// What happened to a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Sent to the service; the cell is `Running`.
    Submitted,
    /// Not connected; the cell stays `Queued` and is sent on reconnect.
    Queued,
    /// A request is already out for the cell; a rerun follows its result.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Captured but not yet sent on the current connection.
    Unsent,
    Sent { at: Instant },
}

/// Correlation entry for one cell.
#[derive(Debug)]
struct InFlight {
    /// Source captured when the request was created.
    code: String,
    phase: Phase,
    /// Another run was requested while this one was out.
    rerun: bool,
    attempts: u32,
}

/// Owns the correlation table. Never holds cell content beyond the source
/// captured for a request; all cell changes go through [`CellStore`].
#[derive(Debug, Default)]
pub struct ExecutionCoordinator {
    in_flight: HashMap<String, InFlight>,
    timeout: Option<Duration>,
}

impl ExecutionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `Running` cells whose request has been out longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of cells with a tracked request.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_tracked(&self, cell_id: &str) -> bool {
        self.in_flight.contains_key(cell_id)
    }

    /// Source that will be (or was) sent for the cell's tracked request.
    pub fn captured_code(&self, cell_id: &str) -> Option<&str> {
        self.in_flight.get(cell_id).map(|e| e.code.as_str())
    }

    /// Handle a user's run request for `cell_id`.
    pub fn run_cell(
        &mut self,
        store: &mut CellStore,
        sink: &mut dyn MessageSink,
        cell_id: &str,
    ) -> Result<RunOutcome, CellStoreError> {
        let source = store
            .get(cell_id)
            .map(|c| c.source.clone())
            .ok_or_else(|| CellStoreError::CellNotFound(cell_id.to_string()))?;

        if let Some(entry) = self.in_flight.get_mut(cell_id) {
            return Ok(match entry.phase {
                Phase::Unsent => {
                    debug!("[execution] Cell {} still queued, recapturing source", cell_id);
                    entry.code = source;
                    RunOutcome::Queued
                }
                Phase::Sent { .. } => {
                    debug!("[execution] Cell {} already running, deferring rerun", cell_id);
                    entry.rerun = true;
                    RunOutcome::Deferred
                }
            });
        }

        let code = store.begin_run(cell_id)?;
        self.in_flight.insert(
            cell_id.to_string(),
            InFlight {
                code,
                phase: Phase::Unsent,
                rerun: false,
                attempts: 0,
            },
        );
        Ok(self.submit(store, sink, cell_id))
    }

    /// Send every tracked request again after a (re)connect, in cell order.
    /// Returns the ids of the cells that were touched.
    pub fn on_connected(&mut self, store: &mut CellStore, sink: &mut dyn MessageSink) -> Vec<String> {
        self.in_flight.retain(|cell_id, _| {
            let exists = store.contains(cell_id);
            if !exists {
                debug!("[execution] Dropping entry for deleted cell {}", cell_id);
            }
            exists
        });

        let pending: Vec<String> = store
            .cells()
            .iter()
            .filter(|c| self.in_flight.contains_key(&c.id))
            .map(|c| c.id.clone())
            .collect();

        if !pending.is_empty() {
            info!("[execution] Resubmitting {} cell(s) after connect", pending.len());
        }

        for cell_id in &pending {
            if let Some(entry) = self.in_flight.get_mut(cell_id) {
                if let Phase::Sent { .. } = entry.phase {
                    entry.phase = Phase::Unsent;
                    if let Err(e) = store.transition(cell_id, ExecutionState::Queued) {
                        warn!("[execution] Could not requeue {}: {}", cell_id, e);
                    }
                }
            }
            self.submit(store, sink, cell_id);
        }
        pending
    }

    /// The connection dropped. Cells keep their state; nothing is failed.
    pub fn on_disconnected(&self) {
        if !self.in_flight.is_empty() {
            info!(
                "[execution] Connection lost with {} cell(s) in flight, will resubmit on reconnect",
                self.in_flight.len()
            );
        }
    }

    /// Apply a `cell_output` result. Returns true when it resolved a tracked
    /// request.
    pub fn on_cell_output(
        &mut self,
        store: &mut CellStore,
        sink: &mut dyn MessageSink,
        result: CellOutput,
    ) -> bool {
        let cell_id = result.cell_id.as_str();
        match self.in_flight.get(cell_id).map(|e| e.phase) {
            None => {
                debug!("[execution] Discarding result for unknown cell {}", cell_id);
                return false;
            }
            Some(Phase::Unsent) => {
                debug!("[execution] Discarding stale result for queued cell {}", cell_id);
                return false;
            }
            Some(Phase::Sent { .. }) => {}
        }
        let Some(entry) = self.in_flight.remove(cell_id) else {
            return false;
        };

        if let Phase::Sent { at } = entry.phase {
            info!(
                "[execution] Result for cell {} after {:?} (error: {})",
                cell_id,
                at.elapsed(),
                result.error.is_some()
            );
        }

        match store.apply_result(cell_id, &result.output, result.error.as_deref()) {
            Ok(true) => {}
            Ok(false) => return true,
            Err(e) => {
                warn!("[execution] Could not apply result for {}: {}", cell_id, e);
                return true;
            }
        }

        if entry.rerun {
            match self.run_cell(store, sink, cell_id) {
                Ok(outcome) => debug!("[execution] Deferred rerun of {}: {:?}", cell_id, outcome),
                Err(e) => warn!("[execution] Deferred rerun of {} failed: {}", cell_id, e),
            }
        }
        true
    }

    /// Drop the entry for a deleted cell so it is never resubmitted.
    pub fn forget(&mut self, cell_id: &str) {
        if self.in_flight.remove(cell_id).is_some() {
            debug!("[execution] Forgot in-flight request for deleted cell {}", cell_id);
        }
    }

    /// Fail every `Running` request older than the configured timeout.
    /// Returns the ids of the failed cells.
    pub fn check_timeouts(
        &mut self,
        store: &mut CellStore,
        sink: &mut dyn MessageSink,
        now: Instant,
    ) -> Vec<String> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter_map(|(cell_id, entry)| match entry.phase {
                Phase::Sent { at } if now.saturating_duration_since(at) >= timeout => {
                    Some(cell_id.clone())
                }
                _ => None,
            })
            .collect();

        for cell_id in &expired {
            warn!("[execution] Cell {} timed out after {:?}", cell_id, timeout);
            self.on_cell_output(
                store,
                sink,
                CellOutput {
                    cell_id: cell_id.clone(),
                    output: String::new(),
                    error: Some(format!("execution timed out after {}s", timeout.as_secs())),
                },
            );
        }
        expired
    }

    fn submit(&mut self, store: &mut CellStore, sink: &mut dyn MessageSink, cell_id: &str) -> RunOutcome {
        let Some(entry) = self.in_flight.get_mut(cell_id) else {
            return RunOutcome::Queued;
        };

        let message = ClientMessage::ExecuteCell {
            notebook_path: store.path().to_string(),
            cell_id: cell_id.to_string(),
            code: entry.code.clone(),
        };

        match sink.send(message) {
            Ok(()) => {
                entry.phase = Phase::Sent { at: Instant::now() };
                entry.attempts += 1;
                if let Err(e) = store.transition(cell_id, ExecutionState::Running) {
                    warn!("[execution] Could not mark {} running: {}", cell_id, e);
                }
                info!(
                    "[execution] Submitted cell {} (attempt {})",
                    cell_id, entry.attempts
                );
                RunOutcome::Submitted
            }
            Err(ConnectionError::NotConnected) => {
                debug!("[execution] Not connected, cell {} stays queued", cell_id);
                RunOutcome::Queued
            }
            Err(e) => {
                warn!("[execution] Send failed for cell {}: {}, keeping it queued", cell_id, e);
                RunOutcome::Queued
            }
        }
    }
}
