//! Port Relay
//!
//! A TCP reverse proxy. Each configured application listens on a set of ports
//! and forwards every accepted connection to one of its backend targets,
//! chosen round-robin, retrying the dial a bounded number of times.

pub mod app;
pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod selector;
pub mod server;
pub mod tunnel;

// Re-export commonly used types and functions
pub use app::{AppRegistry, Application};
pub use config::{AppConfig, Config, ProxyConfig, load_config, parse_config};
pub use connector::{Connector, RetryPolicy};
pub use error::ProxyError;
pub use listener::{ListenerManager, ListenerState};
pub use selector::TargetSelector;
pub use server::{ListenerReport, Server, ServerSettings};
pub use tunnel::{DirectionOutcome, TunnelReport, pipe};
