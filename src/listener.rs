//! One listening socket per `(application, port)` pair.
//!
//! A listener owns exactly one acceptor task for its whole lifetime. The
//! acceptor pushes accepted sockets into a queue; the control loop drains the
//! queue, spawns a session per socket and watches the shutdown token. The
//! listening socket lives inside the acceptor and is closed once, when the
//! acceptor exits.

use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::connector::Connector;
use crate::error::ProxyError;
use crate::tunnel;

/// Accepted sockets waiting for the control loop.
const ACCEPT_QUEUE_DEPTH: usize = 64;

/// Where the acceptor takes new client sockets from.
trait AcceptSource: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl AcceptSource for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Listening,
    Accepting,
    ShuttingDown,
    ListenError,
    Closed,
}

pub struct ListenerManager {
    app: String,
    port: u16,
    bind_addr: String,
    connector: Connector,
    state: watch::Sender<ListenerState>,
}

impl ListenerManager {
    pub fn new(app: impl Into<String>, port: u16, bind_host: &str, connector: Connector) -> Self {
        let (state, _) = watch::channel(ListenerState::Created);
        Self {
            app: app.into(),
            port,
            bind_addr: format!("{bind_host}:{port}"),
            connector,
            state,
        }
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Observe lifecycle transitions of this listener.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ListenerState) {
        debug!(?state, "Listener state changed");
        self.state.send_replace(state);
    }

    /// Binds the socket and serves sessions until shutdown or an accept failure.
    ///
    /// Returns only after the acceptor has exited and every session spawned by
    /// this listener has unwound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let span = info_span!("listener", app = %self.app, listen_addr = %self.bind_addr);
        self.serve(shutdown).instrument(span).await
    }

    async fn serve(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let listener = match TcpListener::bind(&self.bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(error = %source, "Failed to bind listener");
                self.set_state(ListenerState::ListenError);
                self.set_state(ListenerState::Closed);
                return Err(ProxyError::ListenFailure {
                    addr: self.bind_addr.clone(),
                    source,
                });
            }
        };
        self.set_state(ListenerState::Listening);
        info!("Listener bound");

        self.serve_from(listener, shutdown).await
    }

    async fn serve_from<A: AcceptSource>(
        self,
        source: A,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        let (queue_tx, mut queue_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let acceptor = tokio::spawn(
            accept_loop(source, queue_tx, shutdown.clone()).in_current_span(),
        );
        self.set_state(ListenerState::Accepting);

        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Shutdown received; no longer accepting");
                    break;
                }
                accepted = queue_rx.recv() => match accepted {
                    Some((stream, peer)) => self.spawn_session(&sessions, stream, peer, &shutdown),
                    // The acceptor dropped its end of the queue; its result says why.
                    None => break,
                },
            }
        }

        // Unblocks an acceptor waiting on a full queue.
        drop(queue_rx);
        let accept_result = match acceptor.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e)),
        };

        let result = match accept_result {
            Ok(()) => {
                self.set_state(ListenerState::ShuttingDown);
                Ok(())
            }
            Err(source) => {
                error!(error = %source, "Listener stopped accepting");
                self.set_state(ListenerState::ListenError);
                Err(ProxyError::AcceptFailure {
                    addr: self.bind_addr.clone(),
                    source,
                })
            }
        };

        sessions.close();
        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "Waiting for open sessions to close");
        }
        sessions.wait().await;

        self.set_state(ListenerState::Closed);
        info!("Listener closed");
        result
    }

    fn spawn_session(
        &self,
        sessions: &TaskTracker,
        client: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) {
        let connector = self.connector.clone();
        let shutdown = shutdown.clone();
        let port = self.port;
        let span = info_span!("session", app = %self.app, port, client_addr = %peer);

        sessions.spawn(
            async move {
                match handle_session(client, port, &connector, &shutdown).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => debug!("Session cancelled by shutdown"),
                    Err(e) => warn!(error = %e, "Session failed"),
                }
            }
            .instrument(span),
        );
    }
}

async fn accept_loop<A: AcceptSource>(
    mut source: A,
    queue: mpsc::Sender<(TcpStream, SocketAddr)>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            accepted = source.accept() => accepted?,
        };
        debug!(client_addr = %peer, "Accepted connection");

        if queue.send((stream, peer)).await.is_err() {
            return Ok(());
        }
    }
}

/// Dials a backend for the accepted client and relays until the session ends.
async fn handle_session(
    client: TcpStream,
    port: u16,
    connector: &Connector,
    shutdown: &CancellationToken,
) -> Result<(), ProxyError> {
    if let Err(e) = client.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY on client socket");
    }

    let (target, target_addr) = connector.connect(port, shutdown).await?;
    info!(target_addr = %target_addr, "Opened tunnel");

    let mut report = tunnel::pipe(client.into_split(), target.into_split(), shutdown).await;
    info!(
        target_addr = %target_addr,
        bytes_to_target = report.client_to_target.bytes(),
        bytes_to_client = report.target_to_client.bytes(),
        shutdown = report.shutdown,
        "Closed tunnel"
    );

    match report.take_error() {
        Some(e) => Err(ProxyError::TunnelIo(e)),
        None => Ok(()),
    }
}
