//! Causal context and its wire representations.
//!
//! A [`CausalContext`] identifies one span inside one trace. It crosses
//! process boundaries as a string written into a flat string-keyed
//! carrier: HTTP headers on the synchronous path, a field of the
//! [`WorkItem`](crate::work::WorkItem) on the queue path. A [`Propagator`]
//! owns the encoding and is the only thing that knows the key name.
//!
//! The encodings themselves are OpenTelemetry's: [`JaegerPropagator`] wraps
//! the `opentelemetry-jaeger` propagator and [`W3cPropagator`] wraps the
//! SDK's `TraceContextPropagator`. The wrappers add the one thing the
//! OpenTelemetry API does not report, which is *why* extraction produced no
//! span context.

use std::fmt;
use std::str::FromStr;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceFlags, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

pub use opentelemetry::propagation::{Extractor, Injector};
pub use opentelemetry::trace::{SpanId, TraceId};

// ---------------------------------------------------------------------------
// CausalContext
// ---------------------------------------------------------------------------

/// The identifier set that correlates related operations across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CausalContext {
    /// Shared by every span of one logical request chain.
    pub trace_id: TraceId,
    /// Identifies this span.
    pub span_id: SpanId,
    /// The span this one was opened under, if any.
    pub parent_span_id: Option<SpanId>,
    /// Whether the trace is recorded by the backend.
    pub sampled: bool,
}

impl CausalContext {
    /// Starts a new trace with a single root span.
    #[must_use]
    pub fn root(sampled: bool) -> Self {
        let ids = RandomIdGenerator::default();
        Self {
            trace_id: ids.new_trace_id(),
            span_id: ids.new_span_id(),
            parent_span_id: None,
            sampled,
        }
    }

    /// Opens a child span: same trace, fresh span id, parent = this span.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: RandomIdGenerator::default().new_span_id(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
        }
    }

    /// True when both contexts belong to the same trace.
    #[must_use]
    pub fn same_trace(&self, other: &Self) -> bool {
        self.trace_id == other.trace_id
    }

    /// This span as another process sees it once it crossed the wire.
    #[must_use]
    pub fn remote_span_context(&self) -> SpanContext {
        let flags = if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        SpanContext::new(
            self.trace_id,
            self.span_id,
            flags,
            true,
            TraceState::default(),
        )
    }

    /// An OpenTelemetry context whose active span is this one, for opening
    /// children or injecting.
    #[must_use]
    pub fn as_parent(&self) -> Context {
        Context::new().with_remote_span_context(self.remote_span_context())
    }

    /// Reads the ids back out of an OpenTelemetry span context.
    ///
    /// Returns `None` for an invalid (all-zero) context.
    #[must_use]
    pub fn from_span_context(span_context: &SpanContext, parent: Option<SpanId>) -> Option<Self> {
        span_context.is_valid().then(|| Self {
            trace_id: span_context.trace_id(),
            span_id: span_context.span_id(),
            parent_span_id: parent,
            sampled: span_context.is_sampled(),
        })
    }
}

// ---------------------------------------------------------------------------
// Propagator
// ---------------------------------------------------------------------------

/// Errors from reading a context out of a carrier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("carrier has no `{key}` entry")]
    Missing { key: &'static str },
    #[error("malformed `{key}` entry: {value:?}")]
    Malformed { key: &'static str, value: String },
}

/// Encodes a [`CausalContext`] into a carrier and back.
///
/// Implementations must satisfy `extract(inject(ctx))` agreeing with `ctx`
/// on every field their format can represent.
pub trait Propagator: Send + Sync + fmt::Debug {
    /// The carrier key this propagator reads and writes.
    fn key(&self) -> &'static str;

    /// Writes the wire form of `ctx` into `carrier` under [`Self::key`].
    fn inject(&self, ctx: &CausalContext, carrier: &mut dyn Injector);

    /// Reads the context back out of `carrier`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Missing`] when the key is absent and
    /// [`ExtractError::Malformed`] when the value does not parse.
    fn extract(&self, carrier: &dyn Extractor) -> Result<CausalContext, ExtractError>;
}

fn extract_with<P: TextMapPropagator>(
    wire: &P,
    key: &'static str,
    carrier: &dyn Extractor,
) -> Result<CausalContext, ExtractError> {
    let value = carrier.get(key).ok_or(ExtractError::Missing { key })?;
    let cx = wire.extract_with_context(&Context::new(), carrier);
    CausalContext::from_span_context(cx.span().span_context(), None).ok_or_else(|| {
        ExtractError::Malformed {
            key,
            value: value.to_string(),
        }
    })
}

/// Jaeger's native format: `uber-trace-id: {trace}:{span}:{parent}:{flags}`.
///
/// The parent slot is deprecated in Jaeger clients: it is written as `0`
/// and ignored on the way in. Flag bit 0 carries the sampling decision.
/// Short trace ids and `%3A`-encoded separators are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaegerPropagator;

impl JaegerPropagator {
    pub const KEY: &'static str = "uber-trace-id";

    fn wire() -> opentelemetry_jaeger::Propagator {
        opentelemetry_jaeger::Propagator::new()
    }
}

impl Propagator for JaegerPropagator {
    fn key(&self) -> &'static str {
        Self::KEY
    }

    fn inject(&self, ctx: &CausalContext, carrier: &mut dyn Injector) {
        Self::wire().inject_context(&ctx.as_parent(), carrier);
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<CausalContext, ExtractError> {
        extract_with(&Self::wire(), Self::KEY, carrier)
    }
}

/// W3C Trace Context: `traceparent: 00-{trace}-{span}-{flags}`.
///
/// The format has no parent slot; the extracted context always has
/// `parent_span_id == None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cPropagator;

impl W3cPropagator {
    pub const KEY: &'static str = "traceparent";
}

impl Propagator for W3cPropagator {
    fn key(&self) -> &'static str {
        Self::KEY
    }

    fn inject(&self, ctx: &CausalContext, carrier: &mut dyn Injector) {
        TraceContextPropagator::new().inject_context(&ctx.as_parent(), carrier);
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<CausalContext, ExtractError> {
        extract_with(&TraceContextPropagator::new(), Self::KEY, carrier)
    }
}

// ---------------------------------------------------------------------------
// PropagationFormat
// ---------------------------------------------------------------------------

/// Startup selection of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationFormat {
    #[default]
    Jaeger,
    W3c,
}

impl PropagationFormat {
    /// Builds the propagator for this format.
    #[must_use]
    pub fn propagator(self) -> Box<dyn Propagator> {
        match self {
            Self::Jaeger => Box::new(JaegerPropagator),
            Self::W3c => Box::new(W3cPropagator),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jaeger => "jaeger",
            Self::W3c => "w3c",
        }
    }
}

impl fmt::Display for PropagationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown propagation format `{0}` (expected `jaeger` or `w3c`)")]
pub struct UnknownFormat(pub String);

impl FromStr for PropagationFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jaeger" | "uber" => Ok(Self::Jaeger),
            "w3c" | "traceparent" => Ok(Self::W3c),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
