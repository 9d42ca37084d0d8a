//! # HTTP Gateway
//!
//! Server-hosted execution mode. Each `POST /api/verify` request runs its
//! own pipeline session and streams the pipeline events back as
//! Server-Sent Events. Dropping the connection cancels the run.

mod auth;
mod server;

pub use auth::GatewayAuth;
pub use server::{GatewayState, SharedGateway, router as gateway_router, run as run_gateway};

use serde::{Deserialize, Serialize};

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Accepted bearer tokens for `/api/verify`. Empty means open mode.
    pub auth_tokens: Vec<String>,
    /// Concurrent runs allowed before new requests get 429.
    pub max_concurrent_runs: usize,
    /// SSE keep-alive comment interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            auth_tokens: Vec::new(),
            max_concurrent_runs: 16,
            keep_alive_secs: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5000);
        assert!(config.auth_tokens.is_empty());
        assert_eq!(config.max_concurrent_runs, 16);
    }

    #[test]
    fn test_gateway_config_partial_deserialize() {
        let config: GatewayConfig = serde_json::from_str(r#"{"port":9090}"#).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.keep_alive_secs, 15);
    }
}
