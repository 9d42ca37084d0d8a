//! Gateway authentication.

use super::GatewayConfig;
use axum::http::{HeaderMap, header};

/// Bearer-token authentication for gateway requests.
#[derive(Debug, Clone)]
pub struct GatewayAuth {
    valid_tokens: Vec<String>,
}

impl GatewayAuth {
    /// Create a new auth validator from the gateway config.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.auth_tokens.clone())
    }

    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            valid_tokens: tokens,
        }
    }

    /// Validate a token.
    ///
    /// If no tokens are configured, all tokens are accepted (open mode).
    pub fn validate(&self, token: &str) -> bool {
        if self.valid_tokens.is_empty() {
            return true;
        }
        self.valid_tokens.iter().any(|t| t == token)
    }

    /// Validate the `Authorization: Bearer <token>` header of a request.
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        if self.is_open_mode() {
            return true;
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| self.validate(token.trim()))
    }

    /// Whether the gateway is in open mode (no auth required).
    pub fn is_open_mode(&self) -> bool {
        self.valid_tokens.is_empty()
    }
}
