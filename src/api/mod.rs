//! HTTP surface of the gateway.
//!
//! - [`auth`]: the token-exchange middleware
//! - [`proxy`]: forwards verified requests to the protected origin
//! - [`health`]: unauthenticated liveness probe

pub mod auth;
pub mod health;
pub mod proxy;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use self::{auth::TokenExchange, proxy::Origin};

/// Build the gateway router.
///
/// `/healthz` is answered locally. Every other request passes through the
/// token-exchange filter and, if it is let through, is proxied to `origin`.
pub fn router(filter: Arc<TokenExchange>, origin: Arc<Origin>) -> Router {
    Router::new()
        .fallback(proxy::forward)
        .layer(middleware::from_fn_with_state(
            filter,
            auth::token_exchange_middleware,
        ))
        // Added after the layer so the probe skips authentication.
        .route("/healthz", get(health::healthz))
        .with_state(origin)
}
