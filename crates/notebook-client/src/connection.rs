//! Connection manager for the kernel service.
//!
//! Owns one logical, authenticated channel. The I/O lives in a background
//! link task that dials, performs the handshake, pumps frames, and on an
//! unexpected drop reconnects with exponential backoff. The link task never
//! touches session state: everything it observes is posted as a
//! [`LinkMessage`] onto the session's serial dispatch queue, where
//! [`ConnectionManager::handle_link`] applies it.
//!
//! Link messages carry a generation number. Each `connect` starts a new
//! generation, so late messages from a torn-down link are ignored.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::frame::{self, Handshake};
use crate::protocol::{events, ClientMessage, Envelope, HandshakeReply};

/// Error type for connection operations.
///
/// `Auth` means the credential must be replaced; `NotConnected` is a local
/// precondition failure. Everything else is a transport failure.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection timeout")]
    Timeout,
}

impl ConnectionError {
    /// Whether the caller should obtain a new credential rather than retry.
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectionError::Auth(_))
    }
}

/// Connection status as observed by the rest of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Opaque session credential from the authentication provider.
///
/// Immutable for the lifetime of a session; replacing it means tearing the
/// session down and connecting again.
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exponential backoff with jitter for reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay to randomize, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        capped.mul_f64(factor).min(self.max)
    }
}

/// Everything the link task needs besides the connector and credential.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Sent in every handshake so the service can recognize reconnects.
    pub client_id: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Opens transport streams to the kernel service.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// TCP transport (`host:port`).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    fn connect(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send {
        let addr = self.addr.clone();
        async move {
            let stream = tokio::net::TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok::<_, std::io::Error>(stream)
        }
    }
}

/// Unix domain socket transport.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
impl Connector for UnixConnector {
    type Stream = tokio::net::UnixStream;

    fn connect(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send {
        let path = self.path.clone();
        async move { tokio::net::UnixStream::connect(&path).await }
    }
}

/// Outbound message path used by the coordinators.
pub trait MessageSink {
    /// Fire-and-forget publish. Fails with `NotConnected` unless connected;
    /// nothing is buffered at this layer.
    fn send(&mut self, message: ClientMessage) -> Result<(), ConnectionError>;
}

/// What the link task observed.
#[derive(Debug)]
pub enum LinkEvent {
    Connecting {
        attempt: u32,
    },
    Connected {
        outbound: mpsc::UnboundedSender<Envelope>,
        session_id: Option<String>,
    },
    /// The link is down and will be retried after `retry_in`.
    Disconnected {
        reason: String,
        retry_in: Duration,
    },
    /// The first attempt failed; the link task has stopped.
    Failed {
        error: ConnectionError,
    },
    /// The service rejected the credential; the link task has stopped.
    AuthRejected {
        reason: String,
    },
    Inbound(Envelope),
}

/// A link event tagged with the generation of the link that produced it.
#[derive(Debug)]
pub struct LinkMessage {
    pub generation: u64,
    pub event: LinkEvent,
}

/// Posts link messages onto the dispatch queue. Returns false once the queue
/// is gone, which stops the link task.
pub type LinkPoster = Arc<dyn Fn(LinkMessage) -> bool + Send + Sync>;

/// Handler for inbound events of one name.
pub type EventHandler = Box<dyn FnMut(&Envelope) + Send>;

/// Connectivity change or inbound message, produced by
/// [`ConnectionManager::handle_link`] for higher components.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected { session_id: Option<String> },
    Disconnected { reason: String },
    AuthRejected { reason: String },
    Message(Envelope),
}

struct LinkHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        drop(self.task);
    }
}

/// Owns the session's channel to the kernel service.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    options: ConnectionOptions,
    post: LinkPoster,
    status: ConnectionStatus,
    generation: u64,
    link: Option<LinkHandle>,
    pending_connect: Option<ConnectReply>,
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    subscribers: HashMap<String, Vec<EventHandler>>,
}

/// Resolved when a connect attempt is accepted, rejected or fails.
pub type ConnectReply = oneshot::Sender<Result<(), ConnectionError>>;

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, options: ConnectionOptions, post: LinkPoster) -> Self {
        Self {
            connector: Arc::new(connector),
            options,
            post,
            status: ConnectionStatus::Disconnected,
            generation: 0,
            link: None,
            pending_connect: None,
            outbound: None,
            subscribers: HashMap::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Start a new session with `credential`, replacing any current one.
    ///
    /// Returns immediately. `reply` is resolved on the dispatch queue: `Ok`
    /// once the handshake is accepted, `Auth` if the credential is rejected,
    /// or a network error if the first attempt fails. Later drops are
    /// retried in the background.
    pub fn connect(&mut self, credential: Credential, reply: ConnectReply) {
        if credential.is_expired() {
            let _ = reply.send(Err(ConnectionError::Auth("credential expired".to_string())));
            return;
        }

        self.stop_link();
        self.generation += 1;
        self.status = ConnectionStatus::Connecting;
        self.pending_connect = Some(reply);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = LinkContext {
            connector: Arc::clone(&self.connector),
            credential,
            options: self.options.clone(),
            generation: self.generation,
            post: Arc::clone(&self.post),
        };
        info!("[connection] Connecting (generation {})", self.generation);
        let task = tokio::spawn(run_link(ctx, shutdown_rx));
        self.link = Some(LinkHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Tear down the session. Idempotent; always leaves `Disconnected`.
    /// Returns true when the status changed.
    pub fn disconnect(&mut self) -> bool {
        self.stop_link();
        // Late messages from the stopped link must not revive it
        self.generation += 1;
        let changed = self.status != ConnectionStatus::Disconnected;
        self.status = ConnectionStatus::Disconnected;
        if changed {
            info!("[connection] Disconnected by request");
        }
        changed
    }

    /// Register a handler for every inbound event named `event`, called in
    /// arrival order on the dispatch queue. The local `connected` and
    /// `disconnected` events can be subscribed to as well.
    pub fn subscribe(&mut self, event: impl Into<String>, handler: EventHandler) {
        self.subscribers.entry(event.into()).or_default().push(handler);
    }

    /// Publish a raw event. Fails with `NotConnected` unless connected.
    pub fn send_event(
        &mut self,
        event: &str,
        data: serde_json::Value,
    ) -> Result<(), ConnectionError> {
        self.send_envelope(Envelope {
            event: event.to_string(),
            data,
        })
    }

    /// Apply a message from the link task. Stale generations are ignored.
    pub fn handle_link(&mut self, message: LinkMessage) -> Option<ConnectionEvent> {
        if message.generation != self.generation {
            debug!(
                "[connection] Ignoring event from stale link {} (current {})",
                message.generation, self.generation
            );
            return None;
        }

        match message.event {
            LinkEvent::Connecting { attempt } => {
                debug!("[connection] Connecting, attempt {}", attempt);
                self.status = ConnectionStatus::Connecting;
                None
            }
            LinkEvent::Connected {
                outbound,
                session_id,
            } => {
                info!("[connection] Connected (session {:?})", session_id);
                self.outbound = Some(outbound);
                self.status = ConnectionStatus::Connected;
                self.resolve_connect(Ok(()));
                self.notify_local(
                    events::CONNECTED,
                    serde_json::json!({ "session_id": session_id.clone() }),
                );
                Some(ConnectionEvent::Connected { session_id })
            }
            LinkEvent::Disconnected { reason, retry_in } => {
                let was_connected = self.status == ConnectionStatus::Connected;
                self.outbound = None;
                self.status = ConnectionStatus::Disconnected;
                info!("[connection] Link down ({}), retrying in {:?}", reason, retry_in);
                if !was_connected {
                    return None;
                }
                self.notify_local(
                    events::DISCONNECTED,
                    serde_json::json!({ "reason": reason.clone() }),
                );
                Some(ConnectionEvent::Disconnected { reason })
            }
            LinkEvent::Failed { error } => {
                warn!("[connection] Connect failed: {}", error);
                self.outbound = None;
                self.link = None;
                self.status = ConnectionStatus::Disconnected;
                self.resolve_connect(Err(error));
                None
            }
            LinkEvent::AuthRejected { reason } => {
                warn!("[connection] Credential rejected: {}", reason);
                self.outbound = None;
                self.link = None;
                self.status = ConnectionStatus::Disconnected;
                self.resolve_connect(Err(ConnectionError::Auth(reason.clone())));
                Some(ConnectionEvent::AuthRejected { reason })
            }
            LinkEvent::Inbound(envelope) => {
                if let Some(handlers) = self.subscribers.get_mut(&envelope.event) {
                    for handler in handlers.iter_mut() {
                        handler(&envelope);
                    }
                }
                Some(ConnectionEvent::Message(envelope))
            }
        }
    }

    fn resolve_connect(&mut self, result: Result<(), ConnectionError>) {
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(result);
        }
    }

    fn notify_local(&mut self, event: &str, data: serde_json::Value) {
        if let Some(handlers) = self.subscribers.get_mut(event) {
            let envelope = Envelope {
                event: event.to_string(),
                data,
            };
            for handler in handlers.iter_mut() {
                handler(&envelope);
            }
        }
    }

    fn send_envelope(&mut self, envelope: Envelope) -> Result<(), ConnectionError> {
        if self.status != ConnectionStatus::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        debug!("[connection] Sending {}", envelope.event);
        // A closed channel means the link just died; its Disconnected event
        // is already on the queue.
        outbound
            .send(envelope)
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn stop_link(&mut self) {
        self.outbound = None;
        self.resolve_connect(Err(ConnectionError::NotConnected));
        if let Some(link) = self.link.take() {
            link.stop();
        }
    }
}

impl<C: Connector> MessageSink for ConnectionManager<C> {
    fn send(&mut self, message: ClientMessage) -> Result<(), ConnectionError> {
        let envelope = message.to_envelope().map_err(|e| {
            ConnectionError::Protocol(format!("encode {}: {}", message.event_name(), e))
        })?;
        self.send_envelope(envelope)
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.stop_link();
    }
}

struct LinkContext<C> {
    connector: Arc<C>,
    credential: Credential,
    options: ConnectionOptions,
    generation: u64,
    post: LinkPoster,
}

impl<C> LinkContext<C> {
    fn post(&self, event: LinkEvent) -> bool {
        (self.post)(LinkMessage {
            generation: self.generation,
            event,
        })
    }
}

/// Resolves once shutdown is requested or the manager is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Background task owning the transport for one generation.
async fn run_link<C: Connector>(ctx: LinkContext<C>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    let mut established_once = false;

    loop {
        if !ctx.post(LinkEvent::Connecting { attempt }) {
            return;
        }

        if ctx.credential.is_expired() {
            ctx.post(LinkEvent::AuthRejected {
                reason: "credential expired".to_string(),
            });
            return;
        }

        let established = tokio::select! {
            result = establish(&ctx) => result,
            _ = wait_shutdown(&mut shutdown) => return,
        };

        let reason = match established {
            Ok((stream, session_id)) => {
                attempt = 0;
                established_once = true;
                match pump(&ctx, &mut shutdown, stream, session_id).await {
                    Some(reason) => reason,
                    None => return,
                }
            }
            Err(ConnectionError::Auth(reason)) => {
                ctx.post(LinkEvent::AuthRejected { reason });
                return;
            }
            Err(error) if !established_once => {
                // Initial connect failures go back to the caller
                ctx.post(LinkEvent::Failed { error });
                return;
            }
            Err(error) => error.to_string(),
        };

        let delay = ctx.options.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        if !ctx.post(LinkEvent::Disconnected {
            reason,
            retry_in: delay,
        }) {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(&mut shutdown) => return,
        }
    }
}

/// Dial and authenticate. Returns the stream and the service's session id.
async fn establish<C: Connector>(
    ctx: &LinkContext<C>,
) -> Result<(C::Stream, Option<String>), ConnectionError> {
    let mut stream = tokio::time::timeout(ctx.options.connect_timeout, ctx.connector.connect())
        .await
        .map_err(|_| ConnectionError::Timeout)??;

    let handshake = Handshake {
        token: ctx.credential.token().to_string(),
        client_id: ctx.options.client_id.clone(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let reply = tokio::time::timeout(ctx.options.handshake_timeout, async {
        frame::send_json_frame(&mut stream, &handshake).await?;
        frame::recv_handshake_frame(&mut stream).await
    })
    .await
    .map_err(|_| ConnectionError::Timeout)??;

    let data = reply.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        )
    })?;

    match serde_json::from_slice::<HandshakeReply>(&data)
        .map_err(|e| ConnectionError::Protocol(format!("handshake reply: {}", e)))?
    {
        HandshakeReply::Accepted { session_id } => Ok((stream, session_id)),
        HandshakeReply::Rejected { reason } => Err(ConnectionError::Auth(reason)),
    }
}

/// Move frames until the link drops or shutdown is requested.
/// Returns the drop reason, or `None` on shutdown.
async fn pump<C: Connector>(
    ctx: &LinkContext<C>,
    shutdown: &mut watch::Receiver<bool>,
    stream: C::Stream,
    session_id: Option<String>,
) -> Option<String> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    let mut writer_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            frame::send_json_frame(&mut writer, &envelope).await?;
        }
        Ok::<(), std::io::Error>(())
    });

    if !ctx.post(LinkEvent::Connected {
        outbound: outbound_tx,
        session_id,
    }) {
        writer_task.abort();
        return None;
    }

    let reason = loop {
        tokio::select! {
            _ = wait_shutdown(shutdown) => break None,
            written = &mut writer_task => {
                break Some(match written {
                    Ok(Ok(())) => "outbound channel closed".to_string(),
                    Ok(Err(e)) => format!("write failed: {}", e),
                    Err(e) => format!("writer task failed: {}", e),
                });
            }
            received = frame::recv_frame(&mut reader) => match received {
                Ok(Some(data)) => match serde_json::from_slice::<Envelope>(&data) {
                    Ok(envelope) => {
                        if !ctx.post(LinkEvent::Inbound(envelope)) {
                            break None;
                        }
                    }
                    Err(e) => warn!("[connection] Ignoring malformed frame: {}", e),
                },
                Ok(None) => break Some("connection closed by service".to_string()),
                Err(e) => break Some(format!("read failed: {}", e)),
            },
        }
    };

    writer_task.abort();
    reason
}

/// Sink that records what it sends, for coordinator tests.
#[cfg(test)]
pub(crate) struct RecordingSink {
    pub connected: bool,
    pub sent: Vec<ClientMessage>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn connected() -> Self {
        Self {
            connected: true,
            sent: Vec::new(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            sent: Vec::new(),
        }
    }
}

#[cfg(test)]
impl MessageSink for RecordingSink {
    fn send(&mut self, message: ClientMessage) -> Result<(), ConnectionError> {
        if !self.connected {
            return Err(ConnectionError::NotConnected);
        }
        self.sent.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Connector that hands the far end of an in-memory pipe to a closure
    /// playing the service.
    struct PipeConnector<F> {
        serve: F,
    }

    impl<F> Connector for PipeConnector<F>
    where
        F: Fn(DuplexStream) + Send + Sync + 'static,
    {
        type Stream = DuplexStream;

        fn connect(&self) -> impl Future<Output = std::io::Result<DuplexStream>> + Send {
            let (client, server) = tokio::io::duplex(64 * 1024);
            (self.serve)(server);
            async move { Ok::<_, std::io::Error>(client) }
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        type Stream = DuplexStream;

        fn connect(&self) -> impl Future<Output = std::io::Result<DuplexStream>> + Send {
            async {
                Err::<DuplexStream, _>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            }
        }
    }

    fn accepting_service(server: DuplexStream) {
        tokio::spawn(async move {
            let mut server = server;
            let _hs: Handshake = frame::recv_json_frame(&mut server).await.unwrap().unwrap();
            frame::send_json_frame(
                &mut server,
                &HandshakeReply::Accepted {
                    session_id: Some("s-1".into()),
                },
            )
            .await
            .unwrap();
            // Echo every execute_cell back as a cell_output
            while let Ok(Some(env)) = frame::recv_json_frame::<_, Envelope>(&mut server).await {
                let reply = ServerMessage::CellOutput(crate::protocol::CellOutput {
                    cell_id: env.data["cell_id"].as_str().unwrap_or_default().to_string(),
                    output: "ok".into(),
                    error: None,
                });
                if frame::send_json_frame(&mut server, &reply).await.is_err() {
                    break;
                }
            }
        });
    }

    fn rejecting_service(server: DuplexStream) {
        tokio::spawn(async move {
            let mut server = server;
            let _hs: Handshake = frame::recv_json_frame(&mut server).await.unwrap().unwrap();
            frame::send_json_frame(
                &mut server,
                &HandshakeReply::Rejected {
                    reason: "invalid token".into(),
                },
            )
            .await
            .unwrap();
        });
    }

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: 0.0,
            },
            client_id: "test-client".into(),
        }
    }

    fn manager<C: Connector>(connector: C) -> (ConnectionManager<C>, mpsc::UnboundedReceiver<LinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let post: LinkPoster = Arc::new(move |m: LinkMessage| tx.send(m).is_ok());
        (ConnectionManager::new(connector, fast_options(), post), rx)
    }

    /// Feed link messages into the manager until one produces an event.
    async fn next_event<C: Connector>(
        manager: &mut ConnectionManager<C>,
        rx: &mut mpsc::UnboundedReceiver<LinkMessage>,
    ) -> ConnectionEvent {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for link message")
                .expect("link channel closed");
            if let Some(event) = manager.handle_link(message) {
                return event;
            }
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_millis(3200), "{:?}", d);
            assert!(d <= Duration::from_millis(4800), "{:?}", d);
            assert!(policy.delay(10) <= policy.max);
        }
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("super-secret");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert_eq!(credential.token(), "super-secret");
    }

    #[test]
    fn test_credential_expiry() {
        let fresh = Credential::new("t").with_expiry(Utc::now() + chrono::Duration::hours(1));
        let stale = Credential::new("t").with_expiry(Utc::now() - chrono::Duration::seconds(1));
        assert!(!Credential::new("t").is_expired());
        assert!(!fresh.is_expired());
        assert!(stale.is_expired());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Connected).unwrap(),
            "\"connected\""
        );
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (mut manager, _rx) = manager(RefusingConnector);
        let err = manager
            .send(ClientMessage::ExecuteCell {
                notebook_path: "nb.ipynb".into(),
                cell_id: "1".into(),
                code: "1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
        assert!(matches!(
            manager.send_event("ping", serde_json::Value::Null),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let (mut manager, mut rx) = manager(PipeConnector {
            serve: accepting_service,
        });
        let (reply_tx, reply_rx) = oneshot::channel();
        manager.connect(Credential::new("good"), reply_tx);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);

        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ConnectionEvent::Connected {
                session_id: Some("s-1".into())
            }
        );
        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(manager.status(), ConnectionStatus::Connected);

        manager
            .send(ClientMessage::ExecuteCell {
                notebook_path: "nb.ipynb".into(),
                cell_id: "1".into(),
                code: "1+1".into(),
            })
            .unwrap();

        match next_event(&mut manager, &mut rx).await {
            ConnectionEvent::Message(env) => {
                assert_eq!(env.event, "cell_output");
                assert_eq!(env.data["cell_id"], "1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let (mut manager, mut rx) = manager(PipeConnector {
            serve: accepting_service,
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["connected", "cell_output"] {
            let seen = Arc::clone(&seen);
            manager.subscribe(
                name,
                Box::new(move |env: &Envelope| {
                    seen.lock().unwrap().push(env.event.clone());
                }),
            );
        }

        let (reply_tx, _reply_rx) = oneshot::channel();
        manager.connect(Credential::new("good"), reply_tx);
        next_event(&mut manager, &mut rx).await;
        for id in ["1", "2"] {
            manager
                .send(ClientMessage::ExecuteCell {
                    notebook_path: "nb.ipynb".into(),
                    cell_id: id.into(),
                    code: String::new(),
                })
                .unwrap();
        }
        next_event(&mut manager, &mut rx).await;
        next_event(&mut manager, &mut rx).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["connected", "cell_output", "cell_output"]
        );
    }

    #[tokio::test]
    async fn test_rejected_credential_is_auth_error() {
        let (mut manager, mut rx) = manager(PipeConnector {
            serve: rejecting_service,
        });
        let (reply_tx, reply_rx) = oneshot::channel();
        manager.connect(Credential::new("bad"), reply_tx);

        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ConnectionEvent::AuthRejected {
                reason: "invalid token".into()
            }
        );
        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(err.is_auth());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_expired_credential_fails_before_dialing() {
        let (mut manager, _rx) = manager(RefusingConnector);
        let (reply_tx, reply_rx) = oneshot::channel();
        let expired = Credential::new("t").with_expiry(Utc::now() - chrono::Duration::minutes(5));
        manager.connect(expired, reply_tx);

        assert!(reply_rx.await.unwrap().unwrap_err().is_auth());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error() {
        let (mut manager, mut rx) = manager(RefusingConnector);
        let (reply_tx, reply_rx) = oneshot::channel();
        manager.connect(Credential::new("t"), reply_tx);

        // Connecting, then Failed; no retry follows
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            assert!(manager.handle_link(message).is_none());
        }
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Network(_)));
    }

    /// Feed link messages into the manager until the connect reply resolves
    /// with an error.
    async fn connect_error<C: Connector>(
        manager: &mut ConnectionManager<C>,
        rx: &mut mpsc::UnboundedReceiver<LinkMessage>,
        mut reply_rx: oneshot::Receiver<Result<(), ConnectionError>>,
    ) -> ConnectionError {
        let wait = async {
            loop {
                tokio::select! {
                    result = &mut reply_rx => return result.unwrap().unwrap_err(),
                    Some(message) = rx.recv() => {
                        manager.handle_link(message);
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(3), wait)
            .await
            .expect("timed out waiting for connect reply")
    }

    #[tokio::test]
    async fn test_handshake_failures_map_to_error_kinds() {
        // Reads the handshake and never answers
        let (mut silent, mut rx) = manager(PipeConnector {
            serve: |server: DuplexStream| {
                tokio::spawn(async move {
                    let mut server = server;
                    let _hs: Option<Handshake> = frame::recv_json_frame(&mut server).await.unwrap();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            },
        });
        let (reply_tx, reply_rx) = oneshot::channel();
        silent.connect(Credential::new("t"), reply_tx);
        let err = connect_error(&mut silent, &mut rx, reply_rx).await;
        assert!(matches!(err, ConnectionError::Timeout), "{:?}", err);

        // Answers with something that is not a handshake reply
        let (mut garbled, mut rx) = manager(PipeConnector {
            serve: |server: DuplexStream| {
                tokio::spawn(async move {
                    let mut server = server;
                    let _hs: Option<Handshake> = frame::recv_json_frame(&mut server).await.unwrap();
                    frame::send_frame(&mut server, b"not json").await.unwrap();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            },
        });
        let (reply_tx, reply_rx) = oneshot::channel();
        garbled.connect(Credential::new("t"), reply_tx);
        let err = connect_error(&mut garbled, &mut rx, reply_rx).await;
        assert!(matches!(err, ConnectionError::Protocol(_)), "{:?}", err);

        // Hangs up instead of answering
        let (mut closing, mut rx) = manager(PipeConnector {
            serve: |server: DuplexStream| {
                tokio::spawn(async move {
                    let mut server = server;
                    let _hs: Option<Handshake> = frame::recv_json_frame(&mut server).await.unwrap();
                });
            },
        });
        let (reply_tx, reply_rx) = oneshot::channel();
        closing.connect(Credential::new("t"), reply_tx);
        let err = connect_error(&mut closing, &mut rx, reply_rx).await;
        assert!(matches!(err, ConnectionError::Network(_)), "{:?}", err);
        assert_eq!(closing.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_ignores_stale_link() {
        let (mut manager, mut rx) = manager(PipeConnector {
            serve: accepting_service,
        });
        let (reply_tx, _reply_rx) = oneshot::channel();
        manager.connect(Credential::new("good"), reply_tx);
        next_event(&mut manager, &mut rx).await;

        assert!(manager.disconnect());
        assert!(!manager.disconnect());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        // Anything the old link still posts is ignored
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            assert!(manager.handle_link(message).is_none());
        }
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_service_drop_triggers_reconnect() {
        let connections = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&connections);
        let (mut manager, mut rx) = manager(PipeConnector {
            serve: move |server: DuplexStream| {
                let n = {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    *n
                };
                tokio::spawn(async move {
                    let mut server = server;
                    let _hs: Handshake =
                        frame::recv_json_frame(&mut server).await.unwrap().unwrap();
                    frame::send_json_frame(
                        &mut server,
                        &HandshakeReply::Accepted {
                            session_id: Some(format!("s-{}", n)),
                        },
                    )
                    .await
                    .unwrap();
                    if n == 1 {
                        // Drop the first connection right away
                        return;
                    }
                    while let Ok(Some(_)) =
                        frame::recv_json_frame::<_, Envelope>(&mut server).await
                    {}
                });
            },
        });

        let (reply_tx, _reply_rx) = oneshot::channel();
        manager.connect(Credential::new("good"), reply_tx);

        assert!(matches!(
            next_event(&mut manager, &mut rx).await,
            ConnectionEvent::Connected { .. }
        ));
        assert!(matches!(
            next_event(&mut manager, &mut rx).await,
            ConnectionEvent::Disconnected { .. }
        ));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            next_event(&mut manager, &mut rx).await,
            ConnectionEvent::Connected {
                session_id: Some("s-2".into())
            }
        );
        assert_eq!(*connections.lock().unwrap(), 2);
    }
}
