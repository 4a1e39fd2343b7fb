//! HTTP client for the account service, used by the booking front door and
//! the queue consumer.

use std::time::Duration;

use booking_core::{BookingRecord, CausalContext, MessageBody};
use http::HeaderMap;
use reqwest::{StatusCode, Url};

use crate::trace::Tracer;

/// Where the account service lives and how long a call may take.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub account_url: String,
    /// Bound on every call, connect through body.
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            account_url: "http://account:8080".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Errors from calls to the account service.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid account service url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("http client setup failed: {0}")]
    Client(String),
    #[error("account service unreachable: {0}")]
    Unreachable(String),
    #[error("account service returned {0}")]
    Status(StatusCode),
    #[error("unexpected account service response: {0}")]
    Decode(String),
}

/// Typed calls against the account service. Every call carries the given
/// causal context in its headers.
#[derive(Debug, Clone)]
pub struct AccountClient {
    http: reqwest::Client,
    base_url: Url,
    tracer: Tracer,
}

impl AccountClient {
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidUrl`] when the base url does not parse
    /// or cannot carry a path, and [`UpstreamError::Client`] when the HTTP
    /// client cannot be built.
    pub fn new(config: &UpstreamConfig, tracer: Tracer) -> Result<Self, UpstreamError> {
        let invalid = |reason: String| UpstreamError::InvalidUrl {
            url: config.account_url.clone(),
            reason,
        };
        let base_url = Url::parse(&config.account_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a base url".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            tracer,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `GET /account/login`. Any non-2xx answer is a rejection.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Unreachable`] when the call does not complete,
    /// [`UpstreamError::Status`] on a non-success status.
    pub async fn login(&self, ctx: &CausalContext) -> Result<(), UpstreamError> {
        let url = self.endpoint(&["account", "login"])?;
        let response = self
            .http
            .get(url)
            .headers(self.trace_headers(ctx))
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response.status())
    }

    /// `PUT /account/booking/{id}`, with `payload` as the JSON body if given.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Unreachable`] when the call does not complete,
    /// [`UpstreamError::Status`] on a non-success status.
    pub async fn finalize(
        &self,
        ctx: &CausalContext,
        id: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), UpstreamError> {
        let url = self.endpoint(&["account", "booking", id])?;
        let mut request = self.http.put(url).headers(self.trace_headers(ctx));
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = request.send().await.map_err(transport_error)?;
        ensure_success(response.status())
    }

    /// `GET /account/booking/{id}`; `Ok(None)` on 404.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Unreachable`] when the call does not complete,
    /// [`UpstreamError::Status`] on any other non-success status, and
    /// [`UpstreamError::Decode`] when the body is not a booking record.
    pub async fn lookup(
        &self,
        ctx: &CausalContext,
        id: &str,
    ) -> Result<Option<BookingRecord>, UpstreamError> {
        let url = self.endpoint(&["account", "booking", id])?;
        let response = self
            .http
            .get(url)
            .headers(self.trace_headers(ctx))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ensure_success(response.status())?;

        let body: MessageBody<BookingRecord> = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(Some(body.message))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| UpstreamError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a base url".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn trace_headers(&self, ctx: &CausalContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.tracer.inject_headers(ctx, &mut headers);
        headers
    }
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Unreachable(format!("timed out: {err}"))
    } else {
        UpstreamError::Unreachable(err.to_string())
    }
}

fn ensure_success(status: StatusCode) -> Result<(), UpstreamError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(UpstreamError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> Result<AccountClient, UpstreamError> {
        AccountClient::new(
            &UpstreamConfig {
                account_url: url.to_string(),
                timeout: Duration::from_millis(200),
            },
            Tracer::local("test"),
        )
    }

    #[test]
    fn rejects_unparsable_and_non_base_urls() {
        assert!(matches!(
            client("not a url"),
            Err(UpstreamError::InvalidUrl { .. })
        ));
        assert!(matches!(
            client("mailto:someone@example.com"),
            Err(UpstreamError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn endpoint_escapes_ids_and_keeps_base_path() {
        let client = client("http://account:8080/edge/").unwrap();
        let url = client.endpoint(&["account", "booking", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "http://account:8080/edge/account/booking/a%2Fb%20c");
    }

    #[tokio::test]
    async fn unreachable_service_is_reported() {
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = client(&format!("http://{closed}")).unwrap();
        let err = client.login(&CausalContext::root(true)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable(_)));
    }
}
