//! Token-exchange authentication middleware.
//!
//! Every request must carry an `Authorization` header. The credential is sent
//! to the configured verification endpoint; on success the request continues
//! to the next handler with the credential replaced by:
//!
//! - `X-User-Info`: base64 of the identity JSON object returned upstream
//! - `X-Correlation-ID`: a fresh time-ordered ID (see [`crate::correlation`])
//! - `X-User-Id`: optional copy of one identity field (`user_id_field`),
//!   a convenience for handlers that only need the subject
//!
//! The `Authorization` header never reaches the next handler. Inbound copies of
//! the three identity headers are overwritten or removed, so clients cannot
//! inject them.
//!
//! # Bypass
//! With `production = false`, a credential of `test-token` (with or without the
//! `Bearer ` prefix) is answered `200 OK` immediately and the request is **not**
//! forwarded. This lets local setups run without the verification service and
//! is unreachable in production mode.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument as _};

use crate::{
    config::FilterConfig,
    correlation::{CorrelationId, CorrelationIdGenerator},
    error::{ConfigError, Rejection},
    verify::{Identity, RetryPolicy, VerificationClient, VerificationOutcome},
};

/// Base64-encoded identity JSON.
pub const USER_INFO_HEADER: HeaderName = HeaderName::from_static("x-user-info");
/// Correlation ID, set on the forwarded request and echoed on the response.
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");
/// Optional promoted identity field.
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");

/// Credential accepted without verification outside production.
pub const BYPASS_TOKEN: &str = "test-token";

/// One configured instance of the filter.
///
/// Long-lived and shared (`Arc<TokenExchange>`) across all requests; holds no
/// per-request state.
#[derive(Debug)]
pub struct TokenExchange {
    name: String,
    config: FilterConfig,
    verifier: VerificationClient,
    ids: Arc<CorrelationIdGenerator>,
}

impl TokenExchange {
    /// Validate `config` and build the filter. No network I/O happens here.
    pub fn new(config: FilterConfig, name: impl Into<String>) -> Result<Self, ConfigError> {
        let url = config.validate()?;
        let verifier =
            VerificationClient::new(url, std::time::Duration::from_millis(config.timeout_ms))?;
        Ok(Self {
            name: name.into(),
            config,
            verifier,
            ids: CorrelationIdGenerator::global(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.verifier = self.verifier.with_retry_policy(retry);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<CorrelationIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Decide what to do with `authorization` without touching the request.
    #[tracing::instrument(skip_all, fields(filter = %self.name))]
    pub async fn verify(
        &self,
        authorization: &HeaderValue,
        cancel: &CancellationToken,
    ) -> VerificationOutcome {
        if !self.config.production && is_bypass_credential(authorization) {
            return VerificationOutcome::Bypassed;
        }
        self.verifier.introspect(authorization, cancel).await
    }

    /// Run the filter for one request.
    ///
    /// A [`CancellationToken`] in the request extensions, if present, aborts
    /// verification (including backoff waits) when it fires.
    pub async fn handle(&self, mut req: Request, next: Next) -> Response {
        let Some(authorization) = req
            .headers()
            .get(header::AUTHORIZATION)
            .filter(|v| !v.is_empty())
            .cloned()
        else {
            return Rejection::MissingCredential.into_response();
        };

        let cancel = req
            .extensions()
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();

        let identity = match self.verify(&authorization, &cancel).await.into_result() {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                debug!(filter = %self.name, "bypass credential accepted");
                return StatusCode::OK.into_response();
            }
            Err(rejection) => return self.reject(rejection),
        };

        let correlation_id = match self.ids.generate() {
            Ok(id) => id,
            Err(e) => return self.reject(e.into()),
        };

        self.rewrite_headers(req.headers_mut(), &identity, &correlation_id);

        debug!(filter = %self.name, %correlation_id, "credential verified, forwarding");

        let span = tracing::debug_span!("verified", correlation_id = %correlation_id);
        let mut response = next.run(req).instrument(span).await;

        if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        response
    }

    /// Swap the credential for the identity headers.
    fn rewrite_headers(
        &self,
        headers: &mut HeaderMap,
        identity: &Identity,
        correlation_id: &CorrelationId,
    ) {
        let user_info = BASE64_STANDARD.encode(Value::Object(identity.clone()).to_string());
        headers.insert(
            USER_INFO_HEADER,
            HeaderValue::from_str(&user_info).expect("base64 is a valid header value"),
        );
        headers.insert(
            CORRELATION_ID_HEADER,
            HeaderValue::from_str(&correlation_id.to_string())
                .expect("hyphenated uuid is a valid header value"),
        );

        match self.promoted_user_id(identity) {
            Some(value) => {
                headers.insert(USER_ID_HEADER, value);
            }
            None => {
                headers.remove(USER_ID_HEADER);
            }
        }

        headers.remove(header::AUTHORIZATION);
    }

    fn promoted_user_id(&self, identity: &Identity) -> Option<HeaderValue> {
        let field = self.config.user_id_field()?;
        let raw = match identity.get(field)? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        match HeaderValue::from_str(&raw) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(filter = %self.name, field, "identity field is not a valid header value, not promoted");
                None
            }
        }
    }

    fn reject(&self, rejection: Rejection) -> Response {
        match &rejection {
            Rejection::MissingCredential => {}
            Rejection::InvalidToken => {
                info!(filter = %self.name, "verification endpoint rejected the token");
            }
            Rejection::UpstreamUnavailable { attempts, source } => {
                error!(filter = %self.name, attempts, error = %source, "failed to reach verification endpoint");
            }
            Rejection::UpstreamStatus(code) => {
                warn!(filter = %self.name, status = code.as_u16(), "unexpected response from verification endpoint");
            }
            Rejection::MalformedIdentity(e) => {
                error!(filter = %self.name, error = %e, "failed to decode identity");
            }
            Rejection::CorrelationId(e) => {
                error!(filter = %self.name, error = %e, "failed to generate correlation id");
            }
            Rejection::Cancelled => {
                debug!(filter = %self.name, "request cancelled during verification");
            }
        }
        rejection.into_response()
    }
}

/// `true` when the credential, minus an optional `Bearer ` prefix, is the
/// bypass token.
fn is_bypass_credential(authorization: &HeaderValue) -> bool {
    authorization
        .to_str()
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v) == BYPASS_TOKEN)
        .unwrap_or(false)
}

/// Axum middleware entry point; see [`TokenExchange::handle`].
pub async fn token_exchange_middleware(
    State(filter): State<Arc<TokenExchange>>,
    req: Request,
    next: Next,
) -> Response {
    filter.handle(req, next).await
}
