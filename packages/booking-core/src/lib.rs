//! Booking relay core: causal context propagation, the queue work item and
//! the booking record schema shared by every service.

pub mod booking;
pub mod trace;
pub mod work;

pub use booking::{BookingRecord, BookingStatus, MessageBody};
pub use trace::{
    CausalContext, ExtractError, Extractor, Injector, JaegerPropagator, PropagationFormat,
    Propagator, SpanId, TraceId, W3cPropagator,
};
pub use work::{WorkItem, WorkItemError};

