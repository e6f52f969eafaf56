//! notebook-client - Cell execution and synchronization client for a remote
//! notebook kernel service.
//!
//! The client keeps an ordered set of code cells, sends them to the service
//! for execution over one authenticated connection, applies the results as
//! they come back, and asks the service to persist the whole notebook.
//!
//! All state lives in a single session task (see [`session`]). Network events
//! and user commands are applied there one at a time, in arrival order.
//!
//! On the wire, every message is a length-prefixed JSON frame (see
//! [`frame`]); the first frame in each direction is the handshake.

pub mod cell_store;
pub mod connection;
pub mod execution;
pub mod frame;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod settings;

pub use cell_store::{Cell, CellStore, CellStoreError, ExecutionState};
pub use connection::{
    ConnectionError, ConnectionOptions, ConnectionStatus, Connector, Credential, ReconnectPolicy,
    TcpConnector,
};
#[cfg(unix)]
pub use connection::UnixConnector;
pub use execution::RunOutcome;
pub use persistence::NotebookContent;
pub use session::{NotebookEvent, NotebookHandle, SessionError, SessionOptions};
pub use settings::ClientSettings;

/// Environment variable consulted for the session token.
pub const TOKEN_ENV_VAR: &str = "NOTEBOOK_TOKEN";
