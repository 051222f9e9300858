//! Error types for the gateway.
//!
//! - [`ConfigError`] fails construction of a filter instance, never a request.
//! - [`Rejection`] short-circuits a single request. It converts into a plain
//!   text response carrying only a generic message; the detail (upstream error,
//!   decode error) is logged by the caller and never written to the body.
//! - [`ProxyError`] wraps [`anyhow::Error`] for the origin-forwarding handler.
//! - [`CorrelationError`] reports a failed correlation ID generation.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

/// Realm advertised on every `401` the filter produces.
pub const AUTH_REALM: &str = "Bearer realm=\"token-exchange-gateway\"";

/// Invalid filter configuration, detected when the filter is built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("verification_url must be set")]
    MissingVerificationUrl,

    #[error("invalid verification_url `{url}`: {reason}")]
    InvalidVerificationUrl { url: String, reason: String },

    #[error("building verification HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// The secure random source could not fill an identifier.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("secure random source unavailable: {0}")]
    EntropyUnavailable(String),
}

/// The verification endpoint answered 200 but the body is not a usable identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("reading body: {0}")]
    Read(#[from] reqwest::Error),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("not a JSON object: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A terminal per-request failure.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("missing Authorization header")]
    MissingCredential,

    #[error("verification endpoint rejected the token")]
    InvalidToken,

    #[error("verification endpoint unreachable after {attempts} attempts: {source}")]
    UpstreamUnavailable {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("verification endpoint returned HTTP {0}")]
    UpstreamStatus(StatusCode),

    #[error("unusable verification response: {0}")]
    MalformedIdentity(#[from] IdentityError),

    #[error("correlation id generation failed: {0}")]
    CorrelationId(#[from] CorrelationError),

    #[error("request cancelled while verifying")]
    Cancelled,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::UpstreamStatus(code) => *code,
            Self::UpstreamUnavailable { .. }
            | Self::MalformedIdentity(_)
            | Self::CorrelationId(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The generic message written to the response body.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingCredential => "Missing Authorization header",
            Self::InvalidToken => "Invalid token",
            Self::UpstreamUnavailable { .. } => "Failed to reach users-api",
            Self::UpstreamStatus(_) => "Unexpected response from users-api",
            Self::MalformedIdentity(_) => "Failed to process user info",
            Self::CorrelationId(_) => "Failed to assign correlation id",
            Self::Cancelled => "Request cancelled",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.public_message();
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, AUTH_REALM)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Wraps [`anyhow::Error`] so the proxy handler can propagate with `?`.
///
/// Any failure to reach or read the protected origin surfaces as
/// `502 Bad Gateway`.
#[derive(Debug)]
pub struct ProxyError(anyhow::Error);

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %format!("{:#}", self.0), "origin request failed");
        (StatusCode::BAD_GATEWAY, "Bad gateway").into_response()
    }
}

impl<E> From<E> for ProxyError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
