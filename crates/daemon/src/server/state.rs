use std::sync::Arc;

use crate::auth::AuthGate;
use crate::config::Config;
use crate::files::DirectoryBrowser;
use crate::session::{RegistryConfig, SessionLimits, SessionRegistry};

/// Shared application state for the server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: AuthGate,
    pub registry: SessionRegistry,
    pub browser: Arc<DirectoryBrowser>,
}

impl AppState {
    /// Builds the state, creating a registry from the session config.
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(registry_config(&config));
        Self::with_registry(config, registry)
    }

    /// Builds the state around an existing registry.
    pub fn with_registry(config: Config, registry: SessionRegistry) -> Self {
        let auth = AuthGate::new(config.server.token.as_deref());
        let browser = DirectoryBrowser::new(config.files.roots());
        Self {
            config: Arc::new(config),
            auth,
            registry,
            browser: Arc::new(browser),
        }
    }
}

/// Registry policy from the `[session]` section.
pub fn registry_config(config: &Config) -> RegistryConfig {
    let session = &config.session;
    RegistryConfig {
        max_sessions: session.max_sessions,
        idle_timeout: session.idle_timeout(),
        limits: SessionLimits {
            buffer_capacity: session.buffer_capacity,
            output_watermark: session.output_watermark,
            terminate_grace: session.terminate_grace(),
        },
    }
}
