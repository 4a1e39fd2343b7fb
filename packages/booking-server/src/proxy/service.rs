//! Catch-all forwarding handler.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::response::Response;
use axum::Router;
use tracing::Instrument;

use super::dispatcher::Dispatcher;
use super::retry::{retry_with_predicate, RetryPolicy};
use crate::error::ApiError;
use crate::observability::{PROXY_NO_TARGET, PROXY_REQUESTS};
use crate::trace::Tracer;

/// Largest request body the proxy buffers before forwarding.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub account_url: String,
    pub booking_url: String,
    pub retry: RetryPolicy,
    /// Bound on one forward attempt.
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            account_url: "http://account:8080".to_string(),
            booking_url: "http://booking:8080".to_string(),
            retry: RetryPolicy::default(),
            upstream_timeout: Duration::from_secs(10),
        }
    }
}

struct ProxyInner {
    dispatcher: Dispatcher,
    client: reqwest::Client,
    retry: RetryPolicy,
    tracer: Tracer,
}

/// Shared proxy state: routing table, client and retry policy.
#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<ProxyInner>,
}

impl ProxyState {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        dispatcher: Dispatcher,
        retry: RetryPolicy,
        upstream_timeout: Duration,
        tracer: Tracer,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                dispatcher,
                client,
                retry,
                tracer,
            }),
        })
    }

    /// Builds the reference routing table from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable target urls or client setup failure.
    pub fn from_config(config: &ProxyConfig, tracer: Tracer) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::reference(&config.account_url, &config.booking_url)?;
        Ok(Self::new(
            dispatcher,
            config.retry.clone(),
            config.upstream_timeout,
            tracer,
        )?)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

/// Every path not claimed by the probe routes is forwarded.
pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(forward).with_state(state)
}

async fn forward(State(proxy): State<ProxyState>, request: Request) -> Result<Response, ApiError> {
    let proxy = &proxy.inner;
    let (parts, body) = request.into_parts();

    let parent = proxy.tracer.inbound_context(&parts.headers);
    let mut span = proxy.tracer.start_span("proxy_forward", parent.as_ref());
    let path = parts.uri.path();
    span.set_tag("http.method", &parts.method);
    span.set_tag("http.path", path);

    let target = match proxy.dispatcher.dispatch(path, &mut span) {
        Ok(target) => target,
        Err(err) => {
            metrics::counter!(PROXY_NO_TARGET).increment(1);
            return Err(ApiError::bad_gateway(err.to_string()));
        }
    };
    metrics::counter!(PROXY_REQUESTS, "target" => target.name.clone()).increment(1);

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|len| len > MAX_BODY_BYTES) {
        return Err(body_too_large());
    }
    // A chunked body has no declared length, so the limit is enforced while buffering.
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| {
            tracing::debug!(error = %err, "request body rejected");
            body_too_large()
        })?;
    let url = target.url_for(path, parts.uri.query());

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    proxy.tracer.inject_headers(span.context(), &mut headers);

    let sent = retry_with_predicate(
        &proxy.retry,
        || {
            proxy
                .client
                .request(parts.method.clone(), url.clone())
                .headers(headers.clone())
                .body(body.clone())
                .send()
        },
        |err: &reqwest::Error| err.is_connect() || err.is_timeout(),
    )
    .instrument(span.tracing_span().clone())
    .await;

    let upstream = match sent {
        Ok(upstream) => upstream,
        Err(err) => {
            span.set_tag("proxy_error", &err);
            span.set_error(err.to_string());
            return Err(ApiError::bad_gateway(format!("retry count exceeded: {err}")));
        }
    };

    let status = upstream.status();
    span.set_tag("http.status_code", status.as_u16());
    let mut response_headers = upstream.headers().clone();
    let bytes = upstream.bytes().await.map_err(|e| {
        span.set_error(e.to_string());
        ApiError::bad_gateway(format!("upstream body failed: {e}"))
    })?;

    strip_hop_by_hop(&mut response_headers);
    response_headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn body_too_large() -> ApiError {
    ApiError::payload_too_large(format!("request body exceeds {MAX_BODY_BYTES} bytes"))
}

/// Removes connection-scoped headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
}
