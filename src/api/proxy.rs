//! Reverse proxy to the protected origin.
//!
//! Requests that survive [`crate::api::auth`] are replayed against
//! `[forward].base_url` with their method, path, query, headers and body. The
//! origin's status, headers and body are returned as-is. Hop-by-hop headers
//! are dropped in both directions.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName},
    response::Response,
};
use reqwest::Client;

use crate::{config::ForwardConfig, error::ProxyError};

/// Largest request body buffered before forwarding.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP client bound to the protected origin.
///
/// Built once at startup; [`Client`] pools connections across requests.
#[derive(Debug, Clone)]
pub struct Origin {
    client: Client,
    base_url: String,
}

impl Origin {
    pub fn new(cfg: &ForwardConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building origin HTTP client")?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Replay `req` against the origin and return its response.
    pub async fn forward(&self, req: Request) -> anyhow::Result<Response> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);

        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .context("reading request body")?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("{} {url}", parts.method))?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        let bytes = upstream
            .bytes()
            .await
            .context("reading origin response body")?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Fallback handler: forward everything that is not a gateway-local route.
pub async fn forward(
    State(origin): State<Arc<Origin>>,
    req: Request,
) -> Result<Response, ProxyError> {
    Ok(origin.forward(req).await?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use tower::ServiceExt;
    use wiremock::matchers::{body_string, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn app(base_url: String) -> Router {
        let origin = Origin::new(&ForwardConfig {
            base_url,
            timeout_ms: 2_000,
        })
        .unwrap();
        Router::new()
            .fallback(super::forward)
            .with_state(Arc::new(origin))
    }

    #[tokio::test]
    async fn forwards_method_path_query_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/17"))
            .and(query_param("expand", "items"))
            .and(header_eq("x-user-id", "123"))
            .and(body_string("{\"qty\":2}"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-origin", "yes")
                    .set_body_string("created"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resp = app(server.uri())
            .oneshot(
                Request::post("/orders/17?expand=items")
                    .header("x-user-id", "123")
                    .header("connection", "keep-alive")
                    .body(Body::from("{\"qty\":2}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("x-origin").unwrap(), "yes");
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn trailing_slash_in_base_url_is_not_doubled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let resp = app(format!("{}/", server.uri()))
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn origin_errors_are_passed_through_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such order"))
            .mount(&server)
            .await;

        let resp = app(server.uri())
            .oneshot(Request::get("/orders/0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreachable_origin_is_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let resp = app(format!("http://127.0.0.1:{port}"))
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("x-keep", "1".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }
}
