//! Tracing decorators: one span per receive, one span per published
//! message, with span context carried across the wire in message
//! attributes.
//!
//! Propagation is an explicit dependency: both decorators take a
//! [`Propagator`] instead of consulting process-wide state. The shipped
//! [`W3c`] propagator implements the W3C trace-context headers
//! (`Traceparent` / `Tracestate`). The legacy `Tracecontext` attribute
//! written by older producers is left untouched and carried opaquely.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, field};

use crate::{
    api::{DelayedWriter, MessageWriter, ReceiveError, Receiver, Topic, WriteError},
    message::{Attributes, Message},
};

const TRACEPARENT: &str = "Traceparent";
const TRACESTATE: &str = "Tracestate";

/// A remote span identity carried through message attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
    pub trace_state: Option<String>,
}

impl SpanContext {
    /// A fresh sampled context with random non-zero identifiers.
    pub fn generate() -> Self {
        let mut trace_id: u128 = rand::random();
        while trace_id == 0 {
            trace_id = rand::random();
        }
        let mut span_id: u64 = rand::random();
        while span_id == 0 {
            span_id = rand::random();
        }
        Self {
            trace_id,
            span_id,
            sampled: true,
            trace_state: None,
        }
    }
}

/// Carries span context into and out of message attributes.
pub trait Propagator: Send + Sync {
    fn extract(&self, attrs: &Attributes) -> Option<SpanContext>;
    fn inject(&self, ctx: &SpanContext, attrs: &mut Attributes);
}

/// W3C trace-context propagation over the `Traceparent` and `Tracestate`
/// attributes.
#[derive(Clone, Copy, Debug, Default)]
pub struct W3c;

impl Propagator for W3c {
    fn extract(&self, attrs: &Attributes) -> Option<SpanContext> {
        let header = attrs.get(TRACEPARENT);
        let mut parts = header.split('-');

        let version = parts.next()?;
        if version.len() != 2 || version == "ff" || u8::from_str_radix(version, 16).is_err() {
            return None;
        }

        let trace_id = parts.next().filter(|s| s.len() == 32)?;
        let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
        let span_id = parts.next().filter(|s| s.len() == 16)?;
        let span_id = u64::from_str_radix(span_id, 16).ok()?;
        let flags = parts.next().filter(|s| s.len() == 2)?;
        let flags = u8::from_str_radix(flags, 16).ok()?;

        if trace_id == 0 || span_id == 0 {
            return None;
        }

        let trace_state = Some(attrs.get(TRACESTATE))
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        Some(SpanContext {
            trace_id,
            span_id,
            sampled: flags & 0x01 != 0,
            trace_state,
        })
    }

    fn inject(&self, ctx: &SpanContext, attrs: &mut Attributes) {
        attrs.set(
            TRACEPARENT,
            format!(
                "00-{:032x}-{:016x}-{:02x}",
                ctx.trace_id,
                ctx.span_id,
                u8::from(ctx.sampled)
            ),
        );
        if let Some(state) = &ctx.trace_state {
            attrs.set(TRACESTATE, state.clone());
        }
    }
}

/// Wraps `next` in a receiver that opens a span per message, linked to the
/// upstream context found in the attributes.
pub fn receiver<R>(next: R, propagator: Arc<dyn Propagator>) -> TraceReceiver<R>
where
    R: Receiver,
{
    TraceReceiver {
        next,
        propagator,
        span_name: "message.receive",
    }
}

pub struct TraceReceiver<R> {
    next: R,
    propagator: Arc<dyn Propagator>,
    span_name: &'static str,
}

impl<R> TraceReceiver<R> {
    pub fn span_name(mut self, name: &'static str) -> Self {
        self.span_name = name;
        self
    }
}

#[async_trait]
impl<R> Receiver for TraceReceiver<R>
where
    R: Receiver,
{
    async fn receive(&self, ctx: CancellationToken, msg: Message) -> Result<(), ReceiveError> {
        if ctx.is_cancelled() {
            return Err(ReceiveError::Cancelled);
        }

        let span = tracing::debug_span!(
            "receive",
            operation = self.span_name,
            trace_id = field::Empty,
            parent_span_id = field::Empty,
        );
        if let Some(remote) = self.propagator.extract(&msg.attributes) {
            span.record("trace_id", format!("{:032x}", remote.trace_id).as_str());
            span.record("parent_span_id", format!("{:016x}", remote.span_id).as_str());
        }

        self.next.receive(ctx, msg).instrument(span).await
    }
}

/// Wraps `next` in a topic whose writers open a span per message and inject
/// its context into the attributes on close.
pub fn topic<T>(next: T, propagator: Arc<dyn Propagator>) -> TraceTopic<T>
where
    T: Topic,
{
    TraceTopic {
        next,
        propagator,
        span_name: "message.publish",
    }
}

pub struct TraceTopic<T> {
    next: T,
    propagator: Arc<dyn Propagator>,
    span_name: &'static str,
}

impl<T> TraceTopic<T> {
    pub fn span_name(mut self, name: &'static str) -> Self {
        self.span_name = name;
        self
    }
}

#[async_trait]
impl<T> Topic for TraceTopic<T>
where
    T: Topic,
{
    async fn new_writer(&self, ctx: CancellationToken) -> Box<dyn MessageWriter> {
        let span_ctx = SpanContext::generate();
        let span = tracing::debug_span!(
            "publish",
            operation = self.span_name,
            trace_id = format!("{:032x}", span_ctx.trace_id).as_str(),
        );

        Box::new(TraceWriter {
            next: self.next.new_writer(ctx).await,
            propagator: self.propagator.clone(),
            span_ctx,
            span,
            closed: false,
        })
    }
}

struct TraceWriter {
    next: Box<dyn MessageWriter>,
    propagator: Arc<dyn Propagator>,
    span_ctx: SpanContext,
    span: Span,
    closed: bool,
}

#[async_trait]
impl MessageWriter for TraceWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.next.write(buf).await
    }

    async fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.closed = true;

        // Context must land in the attributes before the inner close
        // publishes them.
        self.propagator.inject(&self.span_ctx, self.next.attributes());
        let res = self.next.close().await;
        self.span.in_scope(|| tracing::debug!("message published"));
        res
    }

    fn attributes(&mut self) -> &mut Attributes {
        self.next.attributes()
    }

    fn as_delayed(&mut self) -> Option<&mut dyn DelayedWriter> {
        self.next.as_delayed()
    }
}
