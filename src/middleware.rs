//! Middleware chain wrapping each target call
//!
//! Composition is inside-out: panic-guard → tracing → metrics → breaker →
//! transport. Every stage observes both outcomes and surfaces errors
//! upstream verbatim; nothing here retries.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::Instrument;

use crate::breaker::{outcome_of, Outcome};
use crate::breaker_registry::BreakerRegistry;
use crate::context::CallCtx;
use crate::metrics::{ApiLabels, CallMetrics};
use crate::transport::{HttpTransport, Target};
use crate::CallError;

const SPAN_ID_HEADER: &str = "x-span-id";

/// The full per-call stack of one pool, shared by all of its targets.
#[derive(Debug, Clone)]
pub(crate) struct CallChain {
    method: reqwest::Method,
    method_label: String,
    uri: String,
    api_labels: ApiLabels,
    transport: HttpTransport,
    metrics: Arc<CallMetrics>,
    breakers: Arc<BreakerRegistry>,
}

impl CallChain {
    pub(crate) fn new(
        method: reqwest::Method,
        method_label: String,
        uri: String,
        api_labels: ApiLabels,
        transport: HttpTransport,
        metrics: Arc<CallMetrics>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self { method, method_label, uri, api_labels, transport, metrics, breakers }
    }

    /// Run the whole chain for one selected target.
    pub(crate) async fn call(
        &self,
        ctx: &CallCtx,
        target: &Target,
        body: Vec<u8>,
    ) -> Result<(Vec<u8>, u16), CallError> {
        recover_panics(self.traced(ctx, target, body)).await
    }

    async fn traced(
        &self,
        ctx: &CallCtx,
        target: &Target,
        body: Vec<u8>,
    ) -> Result<(Vec<u8>, u16), CallError> {
        let span = tracing::info_span!(
            "outbound_call",
            uri = %self.uri,
            method = %self.method_label,
            target = %target.addr,
            otel.kind = "client",
        );
        async move {
            let mut headers = reqwest::header::HeaderMap::new();
            if let Some(id) = tracing::Span::current().id() {
                if let Ok(value) =
                    reqwest::header::HeaderValue::from_str(&id.into_u64().to_string())
                {
                    headers.insert(SPAN_ID_HEADER, value);
                }
            }
            self.measured(ctx, target, headers, body).await
        }
        .instrument(span)
        .await
    }

    async fn measured(
        &self,
        ctx: &CallCtx,
        target: &Target,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
    ) -> Result<(Vec<u8>, u16), CallError> {
        let start = Instant::now();
        let result = self.guarded(ctx, target, headers, body).await;

        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
        self.metrics.observe_call(&self.api_labels, latency_ms);
        if let Ok((_, status)) = &result {
            if *status >= 400 {
                self.metrics.observe_errcode(&self.api_labels, *status);
            }
        }
        result
    }

    async fn guarded(
        &self,
        ctx: &CallCtx,
        target: &Target,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
    ) -> Result<(Vec<u8>, u16), CallError> {
        let labels = &target.labels;
        self.metrics
            .observe_concurrency(labels, self.breakers.in_flight(&target.command_key) as f64);

        let start = Instant::now();
        let result = self
            .breakers
            .run(
                &target.command_key,
                ctx,
                self.transport.send(self.method.clone(), &target.addr, &self.uri, headers, body),
            )
            .await;
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_run_duration(labels, elapsed);
        self.metrics.set_total_duration(labels, elapsed);

        match &result {
            Ok(_) => {
                self.metrics.inc_attempts(labels);
                self.metrics.inc_successes(labels);
            }
            Err(err) => match outcome_of(err) {
                Outcome::ShortCircuit => self.metrics.inc_short_circuits(labels),
                outcome => {
                    self.metrics.inc_attempts(labels);
                    self.metrics.inc_errors(labels);
                    match outcome {
                        Outcome::Timeout => self.metrics.inc_timeouts(labels),
                        Outcome::ConcurrencyReject => self.metrics.inc_rejects(labels),
                        Outcome::Canceled => self.metrics.inc_context_canceled(labels),
                        Outcome::DeadlineExceeded => {
                            self.metrics.inc_context_deadline_exceeded(labels)
                        }
                        _ => self.metrics.inc_failures(labels),
                    }
                }
            },
        }
        result
    }
}

/// Scoped recovery region: no panic crosses the pool boundary.
pub(crate) async fn recover_panics<T, F>(fut: F) -> Result<T, CallError>
where
    F: std::future::Future<Output = Result<T, CallError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::error!(%message, "recovered panic at call boundary");
            Err(CallError::Internal { message })
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic: unknown payload".to_string()
    }
}
