use std::collections::BTreeSet;
use tracing::warn;

use crate::config::AppConfig;

/// A named service: the ports it listens on and the backends it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub ports: BTreeSet<u16>,
    pub targets: Vec<String>,
}

impl Application {
    pub fn new(
        name: impl Into<String>,
        ports: impl IntoIterator<Item = u16>,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            ports: ports.into_iter().collect(),
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&AppConfig> for Application {
    fn from(config: &AppConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.ports.iter().copied(),
            config.targets.iter().cloned(),
        )
    }
}

/// Ordered, immutable list of applications built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: Vec<Application>,
}

impl AppRegistry {
    #[must_use]
    pub fn new(apps: Vec<Application>) -> Self {
        for app in &apps {
            if app.targets.is_empty() && !app.ports.is_empty() {
                warn!(
                    app = %app.name,
                    ports = ?app.ports,
                    "Application has no targets; its ports will refuse every session"
                );
            }
        }
        Self { apps }
    }

    #[must_use]
    pub fn from_config(apps: &[AppConfig]) -> Self {
        Self::new(apps.iter().map(Application::from).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Application> {
        self.apps.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl IntoIterator for AppRegistry {
    type Item = Application;
    type IntoIter = std::vec::IntoIter<Application>;

    fn into_iter(self) -> Self::IntoIter {
        self.apps.into_iter()
    }
}
