//! Backend dialing with a bounded, cancellable retry loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL_MS, ProxyConfig,
};
use crate::error::ProxyError;
use crate::selector::TargetSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Dials allowed after the first one fails.
    pub max_retries: u32,
    /// Wait between two dials.
    pub interval: Duration,
    /// Upper bound for a single dial.
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl From<&ProxyConfig> for RetryPolicy {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            interval: config.retry_interval(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct Connector {
    selector: Arc<TargetSelector>,
    policy: RetryPolicy,
}

impl Connector {
    #[must_use]
    pub fn new(selector: Arc<TargetSelector>, policy: RetryPolicy) -> Self {
        Self { selector, policy }
    }

    /// Resolves a backend for `port` and dials it, retrying on dial failure.
    ///
    /// The first dial happens immediately. Every retry re-resolves the target,
    /// so consecutive attempts walk the application's round-robin rotation.
    /// A port with no resolvable target fails at once without retrying.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn connect(
        &self,
        port: u16,
        shutdown: &CancellationToken,
    ) -> Result<(TcpStream, String), ProxyError> {
        if shutdown.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let mut target = self.selector.resolve(port)?;
        let app = self.selector.application(port).unwrap_or_default();
        let mut attempt: u32 = 0;

        loop {
            match self.dial(&target, shutdown).await {
                Ok(stream) => {
                    info!(app, target_addr = %target, attempts = attempt + 1, "Connected to target");
                    return Ok((stream, target));
                }
                Err(ProxyError::Cancelled) => return Err(ProxyError::Cancelled),
                Err(e) => {
                    warn!(app, target_addr = %target, attempt = attempt + 1, error = %e, "Dial failed");
                }
            }

            if attempt >= self.policy.max_retries {
                break;
            }
            attempt += 1;

            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Err(ProxyError::Cancelled),
                () = sleep(self.policy.interval) => {}
            }

            target = self.selector.resolve(port)?;
        }

        warn!(
            app,
            port,
            attempts = attempt + 1,
            "Retry budget exhausted; giving up on this session"
        );
        Err(ProxyError::TargetUnavailable { port })
    }

    async fn dial(
        &self,
        target: &str,
        shutdown: &CancellationToken,
    ) -> Result<TcpStream, ProxyError> {
        debug!(target_addr = %target, "Attempting to connect to target");

        let attempt = timeout(self.policy.connect_timeout, TcpStream::connect(target));
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(ProxyError::Cancelled),
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(target_addr = %target, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(ProxyError::DialFailure {
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(ProxyError::DialFailure {
                target: target.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
            }),
        }
    }
}
