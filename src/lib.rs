//! Inline token-exchange gateway.
//!
//! Sits in front of a protected service, verifies each request's bearer
//! credential against a remote verification endpoint and, on success, replaces
//! the credential with an identity header and a time-ordered correlation ID.
//!
//! The filter is usable on its own as axum middleware
//! ([`api::auth::token_exchange_middleware`]); the binary wires it in front of
//! a reverse proxy ([`api::router`]).

pub mod api;
pub mod config;
pub mod correlation;
pub mod error;
pub mod verify;

pub use api::auth::{token_exchange_middleware, TokenExchange};
pub use config::{Config, FilterConfig};
pub use correlation::{CorrelationId, CorrelationIdGenerator};
pub use error::{ConfigError, Rejection};
pub use verify::{RetryPolicy, VerificationOutcome};
