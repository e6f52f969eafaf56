//! Notebook session: the serial dispatch loop that owns all client state.
//!
//! The cell store, the execution and persistence coordinators and the
//! connection manager live inside one background task. User commands from
//! [`NotebookHandle`] and everything the network link observes arrive on the
//! same queue and are applied one at a time, so no state is shared across
//! tasks and no locks are needed.
//!
//! State changes are published on a broadcast channel as [`NotebookEvent`]s.

use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::cell_store::{Cell, CellStore, CellStoreError};
use crate::connection::{
    ConnectReply, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionOptions,
    ConnectionStatus, Connector, Credential, EventHandler, LinkMessage, LinkPoster,
};
use crate::execution::{ExecutionCoordinator, RunOutcome};
use crate::persistence::{PersistenceCoordinator, SaveOutcome};
use crate::protocol::{CellOutput, Envelope, ServerMessage};

/// How often in-flight executions are checked against the timeout.
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    CellStore(#[from] CellStoreError),

    #[error("Session task is not running")]
    ChannelClosed,
}

/// State change published to event subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum NotebookEvent {
    Connected { session_id: Option<String> },
    Disconnected { reason: String },
    /// The credential was rejected or expired. Reconnecting has stopped;
    /// call [`NotebookHandle::reauthenticate`] with a fresh credential.
    AuthenticationRequired { reason: String },
    /// A cell was added or its source, state or result changed.
    CellChanged(Cell),
    CellDeleted { cell_id: String },
    Saved { message: Option<String> },
    SaveFailed { error: String },
    /// A request-level failure not tied to a tracked cell.
    ServiceError { message: String },
}

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub connection: ConnectionOptions,
    /// Fail a running cell that has not produced a result after this long.
    pub execute_timeout: Option<Duration>,
}

enum Command {
    Connect {
        credential: Credential,
        reply: ConnectReply,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    AddCell {
        reply: oneshot::Sender<String>,
    },
    UpdateSource {
        cell_id: String,
        source: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    DeleteCell {
        cell_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RunCell {
        cell_id: String,
        reply: oneshot::Sender<Result<RunOutcome, SessionError>>,
    },
    Save {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetPath {
        path: String,
        reply: oneshot::Sender<()>,
    },
    GetCells {
        reply: oneshot::Sender<Vec<Cell>>,
    },
    GetCell {
        cell_id: String,
        reply: oneshot::Sender<Option<Cell>>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Subscribe {
        event: String,
        handler: EventHandler,
        reply: oneshot::Sender<()>,
    },
    SendEvent {
        event: String,
        data: serde_json::Value,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

enum Dispatch {
    Command(Command),
    Link(LinkMessage),
}

/// Handle to a running notebook session.
///
/// Cheap to clone; every clone talks to the same dispatch loop. The session
/// stops when the last handle is dropped.
#[derive(Clone)]
pub struct NotebookHandle {
    tx: mpsc::UnboundedSender<Dispatch>,
    events: broadcast::Sender<NotebookEvent>,
}

impl NotebookHandle {
    /// Start a session for `store`, talking to the service through
    /// `connector`. Nothing is dialed until [`connect`](Self::connect).
    pub fn spawn<C: Connector>(connector: C, store: CellStore, options: SessionOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        // The link only holds a weak sender so dropping every handle ends the loop
        let weak = tx.downgrade();
        let post: LinkPoster = std::sync::Arc::new(move |message: LinkMessage| {
            weak.upgrade()
                .is_some_and(|tx| tx.send(Dispatch::Link(message)).is_ok())
        });

        let path = store.path().to_string();
        let session = Session {
            store,
            execution: ExecutionCoordinator::new().with_timeout(options.execute_timeout),
            persistence: PersistenceCoordinator::new(),
            connection: ConnectionManager::new(connector, options.connection, post),
            events: events.clone(),
        };

        info!("[notebook-session] Starting session for {}", path);
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(run_session(session, rx))
                .catch_unwind()
                .await;
            match result {
                Ok(()) => info!("[notebook-session] Session for {} ended", path),
                Err(panic_info) => error!(
                    "[notebook-session] PANIC in session for {}: {:?}",
                    path, panic_info
                ),
            }
        });

        Self { tx, events }
    }

    /// Subscribe to state changes. Only events after this call are seen.
    pub fn events(&self) -> broadcast::Receiver<NotebookEvent> {
        self.events.subscribe()
    }

    /// Open a session with `credential`. Resolves once the service accepts
    /// or rejects it, or the first attempt fails. Replaces any current
    /// session.
    pub async fn connect(&self, credential: Credential) -> Result<(), SessionError> {
        let result = self
            .request(|reply| Command::Connect { credential, reply })
            .await?;
        Ok(result?)
    }

    /// Tear the session down and rebuild it with a fresh credential.
    /// In-flight executions are resubmitted once the new session is up.
    pub async fn reauthenticate(&self, credential: Credential) -> Result<(), SessionError> {
        self.connect(credential).await
    }

    /// Close the session. Idempotent.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus, SessionError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Append an empty cell and return its id.
    pub async fn add_cell(&self) -> Result<String, SessionError> {
        self.request(|reply| Command::AddCell { reply }).await
    }

    pub async fn update_source(&self, cell_id: &str, source: &str) -> Result<(), SessionError> {
        let cell_id = cell_id.to_string();
        let source = source.to_string();
        self.request(|reply| Command::UpdateSource {
            cell_id,
            source,
            reply,
        })
        .await?
    }

    /// Delete a cell. The last remaining cell cannot be deleted.
    pub async fn delete_cell(&self, cell_id: &str) -> Result<(), SessionError> {
        let cell_id = cell_id.to_string();
        self.request(|reply| Command::DeleteCell { cell_id, reply })
            .await?
    }

    /// Request execution of a cell with its current source.
    ///
    /// Without a connection the cell stays queued and is submitted on the
    /// next connect.
    pub async fn run_cell(&self, cell_id: &str) -> Result<RunOutcome, SessionError> {
        let cell_id = cell_id.to_string();
        self.request(|reply| Command::RunCell { cell_id, reply })
            .await?
    }

    /// Send the whole notebook to the service. The acknowledgement arrives
    /// later as [`NotebookEvent::Saved`] or [`NotebookEvent::SaveFailed`].
    pub async fn save(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Save { reply }).await?
    }

    pub async fn set_path(&self, path: &str) -> Result<(), SessionError> {
        let path = path.to_string();
        self.request(|reply| Command::SetPath { path, reply }).await
    }

    /// Snapshot of all cells in display order.
    pub async fn cells(&self) -> Result<Vec<Cell>, SessionError> {
        self.request(|reply| Command::GetCells { reply }).await
    }

    pub async fn cell(&self, cell_id: &str) -> Result<Option<Cell>, SessionError> {
        let cell_id = cell_id.to_string();
        self.request(|reply| Command::GetCell { cell_id, reply })
            .await
    }

    /// Register a handler for inbound events named `event`. Handlers run on
    /// the dispatch loop in arrival order and must not block.
    pub async fn subscribe<F>(&self, event: &str, handler: F) -> Result<(), SessionError>
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        let event = event.to_string();
        let handler: EventHandler = Box::new(handler);
        self.request(|reply| Command::Subscribe {
            event,
            handler,
            reply,
        })
        .await
    }

    /// Publish a raw event. Fails with `NotConnected` without a session.
    pub async fn send_event(
        &self,
        event: &str,
        data: serde_json::Value,
    ) -> Result<(), SessionError> {
        let event = event.to_string();
        self.request(|reply| Command::SendEvent { event, data, reply })
            .await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Dispatch::Command(make(reply_tx)))
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }
}

struct Session<C: Connector> {
    store: CellStore,
    execution: ExecutionCoordinator,
    persistence: PersistenceCoordinator,
    connection: ConnectionManager<C>,
    events: broadcast::Sender<NotebookEvent>,
}

async fn run_session<C: Connector>(mut session: Session<C>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    let check_timeouts = session.execution.timeout().is_some();
    let mut ticker = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            dispatch = rx.recv() => match dispatch {
                Some(Dispatch::Command(command)) => session.handle_command(command),
                Some(Dispatch::Link(message)) => {
                    if let Some(event) = session.connection.handle_link(message) {
                        session.on_connection_event(event);
                    }
                }
                None => {
                    debug!("[notebook-session] All handles dropped");
                    break;
                }
            },
            _ = ticker.tick(), if check_timeouts => session.on_tick(),
        }
    }
}

impl<C: Connector> Session<C> {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { credential, reply } => {
                self.lose_connection("replaced by a new session");
                self.connection.connect(credential, reply);
            }
            Command::Disconnect { reply } => {
                self.lose_connection("disconnected by request");
                let _ = reply.send(());
            }
            Command::AddCell { reply } => {
                let cell_id = self.store.add_cell();
                debug!("[notebook-session] Added cell {}", cell_id);
                self.emit_cell(&cell_id);
                let _ = reply.send(cell_id);
            }
            Command::UpdateSource {
                cell_id,
                source,
                reply,
            } => {
                let result = self.store.update_source(&cell_id, &source);
                if result.is_ok() {
                    self.emit_cell(&cell_id);
                }
                let _ = reply.send(result.map_err(SessionError::from));
            }
            Command::DeleteCell { cell_id, reply } => {
                let result = self.store.delete_cell(&cell_id).map(|_| {
                    self.execution.forget(&cell_id);
                    debug!("[notebook-session] Deleted cell {}", cell_id);
                    self.emit(NotebookEvent::CellDeleted {
                        cell_id: cell_id.clone(),
                    });
                });
                let _ = reply.send(result.map_err(SessionError::from));
            }
            Command::RunCell { cell_id, reply } => {
                let result = self
                    .execution
                    .run_cell(&mut self.store, &mut self.connection, &cell_id);
                if result.is_ok() {
                    self.emit_cell(&cell_id);
                }
                let _ = reply.send(result.map_err(SessionError::from));
            }
            Command::Save { reply } => {
                let result = self.persistence.save(&self.store, &mut self.connection);
                let _ = reply.send(result.map_err(SessionError::from));
            }
            Command::SetPath { path, reply } => {
                info!("[notebook-session] Notebook path is now {}", path);
                self.store.set_path(path);
                let _ = reply.send(());
            }
            Command::GetCells { reply } => {
                let _ = reply.send(self.store.cells().to_vec());
            }
            Command::GetCell { cell_id, reply } => {
                let _ = reply.send(self.store.get(&cell_id).cloned());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.connection.status());
            }
            Command::Subscribe {
                event,
                handler,
                reply,
            } => {
                self.connection.subscribe(event, handler);
                let _ = reply.send(());
            }
            Command::SendEvent { event, data, reply } => {
                let result = self.connection.send_event(&event, data);
                let _ = reply.send(result.map_err(SessionError::from));
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { session_id } => {
                self.emit(NotebookEvent::Connected { session_id });
                let resubmitted = self
                    .execution
                    .on_connected(&mut self.store, &mut self.connection);
                for cell_id in &resubmitted {
                    self.emit_cell(cell_id);
                }
            }
            ConnectionEvent::Disconnected { reason } => {
                self.on_link_lost();
                self.emit(NotebookEvent::Disconnected { reason });
            }
            ConnectionEvent::AuthRejected { reason } => {
                self.on_link_lost();
                self.emit(NotebookEvent::AuthenticationRequired { reason });
            }
            ConnectionEvent::Message(envelope) => self.on_message(envelope),
        }
    }

    fn on_message(&mut self, envelope: Envelope) {
        let message = match envelope.to_server_message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("[notebook-session] Unhandled event {}", envelope.event);
                return;
            }
            Err(e) => {
                warn!(
                    "[notebook-session] Malformed {} payload: {}",
                    envelope.event, e
                );
                return;
            }
        };

        match message {
            ServerMessage::CellOutput(output) => self.apply_output(output),
            ServerMessage::SaveResult(result) => {
                if let Some(outcome) = self.persistence.on_save_result(result) {
                    self.emit_save(outcome);
                }
            }
            ServerMessage::Error(service_error) => {
                warn!(
                    "[notebook-session] Service error (cell {:?}): {}",
                    service_error.cell_id, service_error.message
                );
                if let Some(cell_id) = service_error.cell_id.clone() {
                    if self.execution.is_tracked(&cell_id) {
                        self.apply_output(CellOutput {
                            cell_id,
                            output: String::new(),
                            error: Some(service_error.message),
                        });
                        return;
                    }
                }
                self.emit(NotebookEvent::ServiceError {
                    message: service_error.message,
                });
            }
        }
    }

    fn apply_output(&mut self, output: CellOutput) {
        let cell_id = output.cell_id.clone();
        if self
            .execution
            .on_cell_output(&mut self.store, &mut self.connection, output)
        {
            self.emit_cell(&cell_id);
        }
    }

    fn on_tick(&mut self) {
        let expired =
            self.execution
                .check_timeouts(&mut self.store, &mut self.connection, Instant::now());
        for cell_id in &expired {
            self.emit_cell(cell_id);
        }
    }

    /// Explicit teardown. Emits `Disconnected` only when a session was up.
    fn lose_connection(&mut self, reason: &str) {
        let was_connected = self.connection.status() == ConnectionStatus::Connected;
        self.connection.disconnect();
        if was_connected {
            self.on_link_lost();
            self.emit(NotebookEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn on_link_lost(&mut self) {
        self.execution.on_disconnected();
        if let Some(outcome) = self.persistence.on_disconnected() {
            self.emit_save(outcome);
        }
    }

    fn emit_save(&self, outcome: SaveOutcome) {
        self.emit(match outcome {
            SaveOutcome::Saved { message } => NotebookEvent::Saved { message },
            SaveOutcome::Failed { error } => NotebookEvent::SaveFailed { error },
        });
    }

    fn emit_cell(&self, cell_id: &str) {
        if let Some(cell) = self.store.get(cell_id) {
            self.emit(NotebookEvent::CellChanged(cell.clone()));
        }
    }

    fn emit(&self, event: NotebookEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
