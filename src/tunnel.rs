//! Bidirectional byte relay between the two sockets of a session.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How one direction of a tunnel ended.
#[derive(Debug)]
pub enum DirectionOutcome {
    /// The source reached end of input after `bytes` were copied.
    Finished { bytes: u64 },
    /// Reading or writing failed.
    Failed(io::Error),
    /// Torn down because the other direction ended or shutdown fired.
    Interrupted,
}

impl DirectionOutcome {
    #[must_use]
    pub const fn bytes(&self) -> Option<u64> {
        match self {
            Self::Finished { bytes } => Some(*bytes),
            _ => None,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&io::Error> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct TunnelReport {
    pub client_to_target: DirectionOutcome,
    pub target_to_client: DirectionOutcome,
    /// The session ended because shutdown fired rather than because a direction finished.
    pub shutdown: bool,
}

impl TunnelReport {
    /// Takes the first relay failure out of the report, if there was one.
    pub fn take_error(&mut self) -> Option<io::Error> {
        [&mut self.client_to_target, &mut self.target_to_client]
            .into_iter()
            .find(|outcome| outcome.error().is_some())
            .and_then(
                |outcome| match std::mem::replace(outcome, DirectionOutcome::Interrupted) {
                    DirectionOutcome::Failed(e) => Some(e),
                    _ => None,
                },
            )
    }
}

/// Relays bytes between `client` and `target` until the session ends.
///
/// Both sides are passed as `(reader, writer)` halves, e.g. from
/// `TcpStream::into_split`. Each direction runs as its own task. The session is
/// over as soon as either direction finishes or `shutdown` fires; the other
/// direction is then aborted and joined, so every half has been dropped by the
/// time this returns.
pub async fn pipe<CR, CW, TR, TW>(
    client: (CR, CW),
    target: (TR, TW),
    shutdown: &CancellationToken,
) -> TunnelReport
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    TR: AsyncRead + Unpin + Send + 'static,
    TW: AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = client;
    let (target_read, target_write) = target;

    let mut upstream = tokio::spawn(relay(client_read, target_write));
    let mut downstream = tokio::spawn(relay(target_read, client_write));

    let report = tokio::select! {
        biased;
        () = shutdown.cancelled() => {
            debug!("Shutdown fired; tearing down tunnel");
            upstream.abort();
            downstream.abort();
            TunnelReport {
                client_to_target: join(upstream).await,
                target_to_client: join(downstream).await,
                shutdown: true,
            }
        }
        joined = &mut upstream => {
            downstream.abort();
            TunnelReport {
                client_to_target: outcome(joined),
                target_to_client: join(downstream).await,
                shutdown: false,
            }
        }
        joined = &mut downstream => {
            upstream.abort();
            TunnelReport {
                client_to_target: join(upstream).await,
                target_to_client: outcome(joined),
                shutdown: false,
            }
        }
    };

    debug!(
        client_to_target = ?report.client_to_target,
        target_to_client = ?report.target_to_client,
        "Tunnel closed"
    );
    report
}

async fn relay<R, W>(mut reader: R, mut writer: W) -> DirectionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outcome = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => DirectionOutcome::Finished { bytes },
        Err(e) => DirectionOutcome::Failed(e),
    };
    // The peer may already have closed; a failed shutdown changes nothing.
    let _ = writer.shutdown().await;
    outcome
}

async fn join(handle: JoinHandle<DirectionOutcome>) -> DirectionOutcome {
    outcome(handle.await)
}

fn outcome(joined: Result<DirectionOutcome, tokio::task::JoinError>) -> DirectionOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => DirectionOutcome::Interrupted,
        Err(e) => DirectionOutcome::Failed(io::Error::other(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf, duplex, split};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    type Halves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    /// An in-memory connection: the proxy-facing halves and the peer's end.
    fn connection(capacity: usize) -> (Halves, DuplexStream) {
        let (peer, proxy_side) = duplex(capacity);
        (split(proxy_side), peer)
    }

    #[tokio::test]
    async fn relays_both_directions_until_target_closes() {
        let (client_side, mut client_app) = connection(1024);
        let (target_side, mut target_app) = connection(1024);
        let shutdown = CancellationToken::new();

        let session = tokio::spawn(async move { pipe(client_side, target_side, &shutdown).await });

        client_app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_app.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(target_app);

        let report = timeout(TEST_TIMEOUT, session).await.unwrap().unwrap();
        assert!(!report.shutdown);
        assert_eq!(report.target_to_client.bytes(), Some(5));

        // The client side sees end of input once the session is torn down.
        let mut rest = Vec::new();
        let n = timeout(TEST_TIMEOUT, client_app.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn client_close_ends_session_and_closes_target() {
        let (client_side, client_app) = connection(1024);
        let (target_side, mut target_app) = connection(1024);
        let shutdown = CancellationToken::new();

        let session = tokio::spawn(async move { pipe(client_side, target_side, &shutdown).await });
        drop(client_app);

        let report = timeout(TEST_TIMEOUT, session).await.unwrap().unwrap();
        assert_eq!(report.client_to_target.bytes(), Some(0));

        let mut rest = Vec::new();
        let n = timeout(TEST_TIMEOUT, target_app.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn shutdown_tears_down_idle_session() {
        let (client_side, mut client_app) = connection(1024);
        let (target_side, mut target_app) = connection(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let session = tokio::spawn(async move { pipe(client_side, target_side, &token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let report = timeout(TEST_TIMEOUT, session).await.unwrap().unwrap();
        assert!(report.shutdown);
        assert!(matches!(report.client_to_target, DirectionOutcome::Interrupted));
        assert!(matches!(report.target_to_client, DirectionOutcome::Interrupted));

        let mut buf = Vec::new();
        assert_eq!(client_app.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(target_app.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_token_returns_immediately() {
        let (client_side, _client_app) = connection(64);
        let (target_side, _target_app) = connection(64);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = timeout(TEST_TIMEOUT, pipe(client_side, target_side, &shutdown))
            .await
            .unwrap();
        assert!(report.shutdown);
    }

    #[test]
    fn take_error_moves_first_failure_out() {
        let mut report = TunnelReport {
            client_to_target: DirectionOutcome::Finished { bytes: 3 },
            target_to_client: DirectionOutcome::Failed(io::Error::from(io::ErrorKind::BrokenPipe)),
            shutdown: false,
        };

        let err = report.take_error().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(report.take_error().is_none());
        assert_eq!(report.client_to_target.bytes(), Some(3));
        assert!(report.target_to_client.error().is_none());
    }
}
