//! Shared application state for the proxy server.

use std::sync::Arc;

use labproxy::io::config::ServerConfig;
use labproxy::io::executor::Executor;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Authorizes and launches commands per the loaded configuration.
    pub executor: Arc<Executor>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            executor: Arc::new(Executor::new(Arc::new(config))),
        }
    }
}
