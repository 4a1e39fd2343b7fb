//! Span lifecycle on top of the core causal context.
//!
//! A [`Tracer`] is built once per service at startup and handed to every
//! component that opens spans. Spans are OpenTelemetry SDK spans: the tracer
//! owns a `TracerProvider` whose simple span processor hands each sampled
//! span to the exporter when its [`TraceSpan`] is dropped. Each `TraceSpan`
//! also carries a `tracing::Span` with the same ids, parented to the
//! OpenTelemetry span through `tracing-opentelemetry`, so log lines and
//! nested `tracing` spans join the trace when the bridge layer is installed
//! (see [`crate::observability::init_logging`]).

use std::sync::Arc;
use std::time::Duration;

use booking_core::{
    CausalContext, ExtractError, Extractor, Injector, PropagationFormat, Propagator, SpanId,
};
use futures_util::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::trace::{Span as _, SpanBuilder, Status, TraceError, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;
use tracing::{info_span, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

const INSTRUMENTATION_NAME: &str = "booking-relay";

// ---------------------------------------------------------------------------
// Header carriers
// ---------------------------------------------------------------------------

/// Writes propagation entries into an HTTP header map.
///
/// Keys or values that are not valid header text are skipped.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Reads propagation entries from an HTTP header map (case-insensitive).
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// Providers and exporters
// ---------------------------------------------------------------------------

/// Startup tracing configuration.
#[derive(Debug, Clone, Copy)]
pub struct TracingConfig {
    /// Wire format used on both HTTP headers and work items.
    pub format: PropagationFormat,
    /// Sampling decision for traces started by this process. Spans under a
    /// remote parent follow the parent's decision.
    pub sampled: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: PropagationFormat::Jaeger,
            sampled: true,
        }
    }
}

fn sdk_config(service: &str, sampled: bool) -> sdktrace::Config {
    let root = if sampled {
        Sampler::AlwaysOn
    } else {
        Sampler::AlwaysOff
    };
    sdktrace::config()
        .with_sampler(Sampler::ParentBased(Box::new(root)))
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service.to_string(),
        )]))
}

/// Builds the process-wide provider.
///
/// With `jaeger_agent` set, sampled spans are sent to that agent
/// (`host:port`, UDP) as they finish. Without it spans only show up through
/// the `tracing` bridge.
///
/// # Errors
///
/// Returns [`TraceError`] if the Jaeger agent pipeline cannot be built.
pub fn build_provider(
    service: &str,
    sampled: bool,
    jaeger_agent: Option<&str>,
) -> Result<TracerProvider, TraceError> {
    let config = sdk_config(service, sampled);
    match jaeger_agent {
        Some(endpoint) => opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name(service)
            .with_endpoint(endpoint)
            .with_trace_config(config)
            .build_simple(),
        None => Ok(TracerProvider::builder().with_config(config).build()),
    }
}

/// A span after it finished, as exported.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub name: String,
    pub context: CausalContext,
    pub tags: Vec<(String, String)>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl FinishedSpan {
    fn from_data(data: &SpanData) -> Option<Self> {
        let parent = (data.parent_span_id != SpanId::INVALID).then_some(data.parent_span_id);
        let context = CausalContext::from_span_context(&data.span_context, parent)?;
        let error = match &data.status {
            Status::Error { description } => Some(description.to_string()),
            _ => None,
        };
        Some(Self {
            name: data.name.to_string(),
            context,
            tags: data
                .attributes
                .iter()
                .map(|kv| (kv.key.as_str().to_string(), kv.value.as_str().into_owned()))
                .collect(),
            error,
            duration: data
                .end_time
                .duration_since(data.start_time)
                .unwrap_or_default(),
        })
    }

    /// Value of the first tag named `key`.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Span exporter that keeps finished spans in memory, for assertions in
/// tests. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything exported so far, in finish order.
    #[must_use]
    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .iter()
            .filter_map(FinishedSpan::from_data)
            .collect()
    }

    /// All finished spans with the given name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<FinishedSpan> {
        self.spans()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.spans.lock().extend(batch);
        Box::pin(std::future::ready(Ok(())))
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TracerInner {
    service: String,
    propagator: Box<dyn Propagator>,
    sampled: bool,
    // Spans only reach the processors while the provider is alive.
    _provider: TracerProvider,
    tracer: sdktrace::Tracer,
}

/// Opens spans and moves their context across HTTP headers.
///
/// Cloning is cheap; every clone shares the same propagator and provider.
#[derive(Debug, Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// A tracer with its own provider exporting to `exporter`.
    #[must_use]
    pub fn new<E>(service: impl Into<String>, config: TracingConfig, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        let service = service.into();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter)
            .with_config(sdk_config(&service, config.sampled))
            .build();
        Self::with_provider(service, config, provider)
    }

    /// A tracer on a shared provider, e.g. one from [`build_provider`].
    #[must_use]
    pub fn with_provider(
        service: impl Into<String>,
        config: TracingConfig,
        provider: TracerProvider,
    ) -> Self {
        let tracer = provider.tracer(INSTRUMENTATION_NAME);
        Self {
            inner: Arc::new(TracerInner {
                service: service.into(),
                propagator: config.format.propagator(),
                sampled: config.sampled,
                _provider: provider,
                tracer,
            }),
        }
    }

    /// A tracer with the default configuration and no exporter.
    #[must_use]
    pub fn local(service: impl Into<String>) -> Self {
        let service = service.into();
        let config = TracingConfig::default();
        let provider = TracerProvider::builder()
            .with_config(sdk_config(&service, config.sampled))
            .build();
        Self::with_provider(service, config, provider)
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    #[must_use]
    pub fn propagator(&self) -> &dyn Propagator {
        self.inner.propagator.as_ref()
    }

    /// Opens a span as a child of `parent`, or as the root of a new trace.
    #[must_use]
    pub fn start_span(&self, name: &'static str, parent: Option<&CausalContext>) -> TraceSpan {
        let parent_cx = parent.map_or_else(Context::new, CausalContext::as_parent);
        let span = SpanBuilder::from_name(name).start_with_context(&self.inner.tracer, &parent_cx);
        let context = CausalContext::from_span_context(
            span.span_context(),
            parent.map(|p| p.span_id),
        )
        .unwrap_or_else(|| {
            parent.map_or_else(|| CausalContext::root(self.inner.sampled), CausalContext::child)
        });

        let log_span = info_span!(
            "span",
            service = %self.inner.service,
            name = name,
            trace_id = %context.trace_id,
            span_id = %context.span_id,
        );
        log_span.set_parent(context.as_parent());

        TraceSpan {
            name,
            context,
            error: None,
            span,
            log_span,
            tracer: self.clone(),
        }
    }

    /// Writes `ctx` into outgoing request headers.
    pub fn inject_headers(&self, ctx: &CausalContext, headers: &mut HeaderMap) {
        self.inner
            .propagator
            .inject(ctx, &mut HeaderInjector(headers));
    }

    /// Reads the caller's context from incoming request headers.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] when the header is absent or malformed.
    pub fn extract_headers(&self, headers: &HeaderMap) -> Result<CausalContext, ExtractError> {
        self.inner.propagator.extract(&HeaderExtractor(headers))
    }

    /// Like [`Self::extract_headers`], but logs and discards extraction
    /// failures: a request without a usable context starts a new trace.
    #[must_use]
    pub fn inbound_context(&self, headers: &HeaderMap) -> Option<CausalContext> {
        match self.extract_headers(headers) {
            Ok(ctx) => Some(ctx),
            Err(ExtractError::Missing { .. }) => None,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed inbound trace header");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TraceSpan
// ---------------------------------------------------------------------------

/// An open span. Ends, and is exported if sampled, when dropped.
#[derive(Debug)]
pub struct TraceSpan {
    name: &'static str,
    context: CausalContext,
    error: Option<String>,
    span: sdktrace::Span,
    log_span: Span,
    // Keeps the provider alive until the span has ended.
    tracer: Tracer,
}

impl TraceSpan {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn context(&self) -> &CausalContext {
        &self.context
    }

    /// The `tracing` span to instrument work done under this span.
    #[must_use]
    pub fn tracing_span(&self) -> &Span {
        &self.log_span
    }

    pub fn set_tag(&mut self, key: &'static str, value: impl ToString) {
        self.span.set_attribute(KeyValue::new(key, value.to_string()));
    }

    /// Marks the span as failed. The last message wins.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.log_span
            .in_scope(|| tracing::warn!(error = %message, "span error"));
        self.error = Some(message);
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Opens a child span under this one.
    #[must_use]
    pub fn child(&self, name: &'static str) -> TraceSpan {
        self.tracer.start_span(name, Some(&self.context))
    }
}

impl Drop for TraceSpan {
    fn drop(&mut self) {
        if let Some(message) = self.error.take() {
            self.span.set_status(Status::error(message));
        }
        self.span.end();
    }
}
