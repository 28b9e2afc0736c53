use futures_util::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::AppRegistry;
use crate::config::{Config, DEFAULT_BIND_HOST, ProxyConfig};
use crate::connector::{Connector, RetryPolicy};
use crate::error::ProxyError;
use crate::listener::ListenerManager;
use crate::selector::TargetSelector;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_host: String,
    pub retry: RetryPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&ProxyConfig> for ServerSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            bind_host: config.bind_host.clone(),
            retry: RetryPolicy::from(config),
        }
    }
}

/// How one listener ended.
#[derive(Debug)]
pub struct ListenerReport {
    pub app: String,
    pub port: u16,
    pub result: Result<(), ProxyError>,
}

pub struct Server {
    selector: Arc<TargetSelector>,
    settings: ServerSettings,
}

impl Server {
    /// Builds the port lookup for `registry`. Fails if two applications share a port.
    pub fn new(registry: AppRegistry, settings: ServerSettings) -> Result<Self, ProxyError> {
        let selector = Arc::new(TargetSelector::new(registry)?);
        Ok(Self { selector, settings })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        Self::new(
            AppRegistry::from_config(&config.apps),
            ServerSettings::from(&config.proxy),
        )
    }

    #[must_use]
    pub const fn selector(&self) -> &Arc<TargetSelector> {
        &self.selector
    }

    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// One listener per `(application, port)` pair, sharing a single connector.
    #[must_use]
    pub fn listeners(&self) -> Vec<ListenerManager> {
        let connector = Connector::new(Arc::clone(&self.selector), self.settings.retry);
        self.selector
            .ports()
            .into_iter()
            .map(|(app, port)| {
                ListenerManager::new(app, port, &self.settings.bind_host, connector.clone())
            })
            .collect()
    }

    /// Runs every listener until `shutdown` fires and all of them have closed.
    pub async fn start(&self, shutdown: CancellationToken) -> Vec<ListenerReport> {
        let listeners = self.listeners();
        info!(listeners = listeners.len(), "Starting server");

        let handles = listeners.into_iter().map(|listener| {
            let app = listener.app().to_string();
            let port = listener.port();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = listener.run(shutdown).await;
                ListenerReport { app, port, result }
            })
        });

        let mut reports = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok(report) => {
                    if let Err(e) = &report.result {
                        error!(app = %report.app, port = report.port, error = %e, "Listener failed");
                    }
                    reports.push(report);
                }
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }

        info!("All listeners returned");
        reports
    }
}
