//! HTTP client for the token verification (introspection) endpoint.
//!
//! A [`VerificationClient`] is built once per filter instance and reused for
//! every request; [`reqwest::Client`] pools connections internally.
//!
//! One introspection is a `GET <verification_url>` carrying the caller's
//! `Authorization` header verbatim. Transport failures are retried according
//! to the [`RetryPolicy`]; any HTTP status, including 5xx, is final. Once a
//! 200 arrives, every problem with its body is an [`IdentityError`].

pub mod retry;

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConfigError, IdentityError, Rejection};

pub use retry::{RetryError, RetryPolicy};

/// The decoded identity returned by the verification endpoint.
pub type Identity = Map<String, Value>;

/// Largest identity body accepted from the verification endpoint.
pub const MAX_IDENTITY_BYTES: usize = 1024 * 1024;

/// Result of checking one credential.
#[derive(Debug)]
pub enum VerificationOutcome {
    /// Non-production shortcut; no upstream call was made.
    Bypassed,
    /// Upstream answered 200 with a JSON object.
    Authorized { identity: Identity },
    /// Upstream answered 401.
    Unauthorized,
    /// No HTTP response could be obtained within the retry budget.
    UpstreamUnavailable {
        attempts: u32,
        last_error: reqwest::Error,
    },
    /// Upstream answered with something other than 200 or 401.
    UpstreamUnexpectedStatus { code: StatusCode },
    /// Upstream answered 200 but the body could not be read, was too large,
    /// or is not a JSON object.
    MalformedIdentity { error: IdentityError },
    /// The caller abandoned the request while verification was in flight.
    Cancelled,
}

impl VerificationOutcome {
    /// `Ok(Some(identity))` to forward, `Ok(None)` for a bypass, `Err` to reject.
    pub fn into_result(self) -> Result<Option<Identity>, Rejection> {
        match self {
            Self::Bypassed => Ok(None),
            Self::Authorized { identity } => Ok(Some(identity)),
            Self::Unauthorized => Err(Rejection::InvalidToken),
            Self::UpstreamUnavailable {
                attempts,
                last_error,
            } => Err(Rejection::UpstreamUnavailable {
                attempts,
                source: last_error,
            }),
            Self::UpstreamUnexpectedStatus { code } => Err(Rejection::UpstreamStatus(code)),
            Self::MalformedIdentity { error } => Err(error.into()),
            Self::Cancelled => Err(Rejection::Cancelled),
        }
    }
}

/// Calls the verification endpoint for a single filter instance.
#[derive(Debug, Clone)]
pub struct VerificationClient {
    client: Client,
    url: Url,
    retry: RetryPolicy,
}

impl VerificationClient {
    /// Build a client for `url` with a per-attempt `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ask the endpoint whether `authorization` is valid.
    ///
    /// Never returns [`VerificationOutcome::Bypassed`]; the bypass decision
    /// belongs to the filter.
    pub async fn introspect(
        &self,
        authorization: &HeaderValue,
        cancel: &CancellationToken,
    ) -> VerificationOutcome {
        let send = |attempt: u32| {
            let request = self
                .client
                .get(self.url.clone())
                .header(header::AUTHORIZATION, authorization.clone());
            debug!(attempt, url = %self.url, "calling verification endpoint");
            request.send()
        };

        let response = match self.retry.run(cancel, send).await {
            Ok(response) => response,
            Err(RetryError::Exhausted { attempts, last }) => {
                return VerificationOutcome::UpstreamUnavailable {
                    attempts,
                    last_error: last,
                };
            }
            Err(RetryError::Cancelled { .. }) => return VerificationOutcome::Cancelled,
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return VerificationOutcome::Unauthorized,
            code => return VerificationOutcome::UpstreamUnexpectedStatus { code },
        }

        // The status line arrived, so a failure here is not retried.
        match read_identity(response).await {
            Ok(identity) => VerificationOutcome::Authorized { identity },
            Err(error) => VerificationOutcome::MalformedIdentity { error },
        }
    }
}

/// Read at most [`MAX_IDENTITY_BYTES`] and decode them as a JSON object.
async fn read_identity(mut response: reqwest::Response) -> Result<Identity, IdentityError> {
    let too_large = IdentityError::TooLarge {
        limit: MAX_IDENTITY_BYTES,
    };
    if response
        .content_length()
        .is_some_and(|len| len > MAX_IDENTITY_BYTES as u64)
    {
        return Err(too_large);
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_IDENTITY_BYTES {
            return Err(too_large);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(serde_json::from_slice(&body)?)
}
