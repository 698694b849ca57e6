//! Prometheus metric families for calls and breaker outcomes.
//! Bring your own `prometheus::Registry`; families are registered on
//! construction and the registry stays exposed for HTTP scraping.

use std::sync::Arc;

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};

const API_LABELS: &[&str] = &["src", "tgt", "uri", "method"];
const API_LABELS_WITH_CODE: &[&str] = &["src", "tgt", "uri", "method", "status"];
const BREAKER_LABELS: &[&str] = &["command", "method", "uri", "src", "tgt", "src_ip", "tgt_ip"];

const LATENCY_BUCKETS_MS: &[f64] =
    &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0];

/// Pre-resolved `{src, tgt, uri, method}` label values for one pool.
#[derive(Debug, Clone)]
pub struct ApiLabels {
    values: [String; 4],
}

impl ApiLabels {
    fn refs(&self) -> [&str; 4] {
        [&self.values[0], &self.values[1], &self.values[2], &self.values[3]]
    }
}

/// Pre-resolved breaker label values for one target.
#[derive(Debug, Clone)]
pub struct BreakerLabels {
    values: [String; 7],
}

impl BreakerLabels {
    fn refs(&self) -> [&str; 7] {
        [
            &self.values[0],
            &self.values[1],
            &self.values[2],
            &self.values[3],
            &self.values[4],
            &self.values[5],
            &self.values[6],
        ]
    }
}

/// All metric families emitted by the call engine.
///
/// Constructed once during bootstrap and carried in the client context;
/// never a process-wide singleton.
#[derive(Debug, Clone)]
pub struct CallMetrics {
    registry: Arc<Registry>,
    local_ip: String,

    api_call: IntCounterVec,
    api_errcode: IntCounterVec,
    api_latency: HistogramVec,

    cb_attempts: IntCounterVec,
    cb_errors: IntCounterVec,
    cb_successes: IntCounterVec,
    cb_failures: IntCounterVec,
    cb_rejects: IntCounterVec,
    cb_short_circuits: IntCounterVec,
    cb_timeouts: IntCounterVec,
    cb_fallback_successes: IntCounterVec,
    cb_fallback_failures: IntCounterVec,
    cb_context_canceled: IntCounterVec,
    cb_context_deadline_exceeded: IntCounterVec,
    cb_total_duration: GaugeVec,
    cb_run_duration: HistogramVec,
    cb_concurrency_inuse: HistogramVec,
}

fn api_counter(name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help).namespace("service").subsystem("api"), API_LABELS)
}

fn cb_counter(name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help).namespace("hystrix_go"), BREAKER_LABELS)
}

impl CallMetrics {
    /// Create the metric families and register them into `registry`.
    ///
    /// # Errors
    /// Returns an error if any family cannot be registered (name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();

        let api_call = api_counter("call", "Api call.")?;
        let api_errcode = IntCounterVec::new(
            Opts::new("errcode", "Error code of api call.").namespace("service").subsystem("api"),
            API_LABELS_WITH_CODE,
        )?;
        let api_latency = HistogramVec::new(
            HistogramOpts::new("latency", "Latency of api call in milliseconds.")
                .namespace("service")
                .subsystem("api")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
            API_LABELS,
        )?;

        let cb_attempts = cb_counter("attempts", "The number of attempts.")?;
        let cb_errors =
            cb_counter("errors", "The number of unsuccessful attempts; any non-success result.")?;
        let cb_successes = cb_counter("successes", "The number of requests that succeed.")?;
        let cb_failures = cb_counter("failures", "The number of requests that fail.")?;
        let cb_rejects = cb_counter("rejects", "The number of requests that are rejected.")?;
        let cb_short_circuits = cb_counter(
            "short_circuits",
            "The number of requests short circuited because the circuit was open.",
        )?;
        let cb_timeouts =
            cb_counter("timeouts", "The number of requests that timed out in the breaker.")?;
        let cb_fallback_successes =
            cb_counter("fallback_successes", "The number of successful fallback executions.")?;
        let cb_fallback_failures =
            cb_counter("fallback_failures", "The number of failed fallback executions.")?;
        let cb_context_canceled =
            cb_counter("context_canceled", "The number of caller cancellations.")?;
        let cb_context_deadline_exceeded =
            cb_counter("context_deadline_exceeded", "The number of caller deadline expiries.")?;
        let cb_total_duration = GaugeVec::new(
            Opts::new("total_duration_seconds", "Total runtime of the command in seconds.")
                .namespace("hystrix_go"),
            BREAKER_LABELS,
        )?;
        let cb_run_duration = HistogramVec::new(
            HistogramOpts::new("run_duration_seconds", "Runtime of the guarded call.")
                .namespace("hystrix_go"),
            BREAKER_LABELS,
        )?;
        let cb_concurrency_inuse = HistogramVec::new(
            HistogramOpts::new("concurrency_inuse", "Concurrency in use by the command.")
                .namespace("hystrix_go"),
            BREAKER_LABELS,
        )?;

        let metrics = Self {
            registry: registry.clone(),
            local_ip: local_ip(),
            api_call,
            api_errcode,
            api_latency,
            cb_attempts,
            cb_errors,
            cb_successes,
            cb_failures,
            cb_rejects,
            cb_short_circuits,
            cb_timeouts,
            cb_fallback_successes,
            cb_fallback_failures,
            cb_context_canceled,
            cb_context_deadline_exceeded,
            cb_total_duration,
            cb_run_duration,
            cb_concurrency_inuse,
        };

        registry.register(Box::new(metrics.api_call.clone()))?;
        registry.register(Box::new(metrics.api_errcode.clone()))?;
        registry.register(Box::new(metrics.api_latency.clone()))?;
        registry.register(Box::new(metrics.cb_attempts.clone()))?;
        registry.register(Box::new(metrics.cb_errors.clone()))?;
        registry.register(Box::new(metrics.cb_successes.clone()))?;
        registry.register(Box::new(metrics.cb_failures.clone()))?;
        registry.register(Box::new(metrics.cb_rejects.clone()))?;
        registry.register(Box::new(metrics.cb_short_circuits.clone()))?;
        registry.register(Box::new(metrics.cb_timeouts.clone()))?;
        registry.register(Box::new(metrics.cb_fallback_successes.clone()))?;
        registry.register(Box::new(metrics.cb_fallback_failures.clone()))?;
        registry.register(Box::new(metrics.cb_context_canceled.clone()))?;
        registry.register(Box::new(metrics.cb_context_deadline_exceeded.clone()))?;
        registry.register(Box::new(metrics.cb_total_duration.clone()))?;
        registry.register(Box::new(metrics.cb_run_duration.clone()))?;
        registry.register(Box::new(metrics.cb_concurrency_inuse.clone()))?;

        Ok(metrics)
    }

    /// The registry backing these families, for scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn api_labels(&self, src: &str, tgt: &str, uri: &str, method: &str) -> ApiLabels {
        ApiLabels { values: [src.into(), tgt.into(), uri.into(), method.into()] }
    }

    pub(crate) fn breaker_labels(
        &self,
        command: &str,
        method: &str,
        uri: &str,
        src: &str,
        tgt: &str,
        tgt_ip: &str,
    ) -> BreakerLabels {
        BreakerLabels {
            values: [
                command.into(),
                method.into(),
                uri.into(),
                src.into(),
                tgt.into(),
                self.local_ip.clone(),
                tgt_ip.into(),
            ],
        }
    }

    pub(crate) fn observe_call(&self, labels: &ApiLabels, latency_ms: f64) {
        self.api_latency.with_label_values(&labels.refs()).observe(latency_ms);
        self.api_call.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn observe_errcode(&self, labels: &ApiLabels, status: u16) {
        let status = status.to_string();
        let [src, tgt, uri, method] = labels.refs();
        self.api_errcode.with_label_values(&[src, tgt, uri, method, &status]).inc();
    }

    /// Materialize every breaker family at zero for a fresh target, so
    /// scrapes see the series before the first call.
    pub(crate) fn init_breaker(&self, labels: &BreakerLabels) {
        let refs = labels.refs();
        self.cb_attempts.with_label_values(&refs).inc_by(0);
        self.cb_errors.with_label_values(&refs).inc_by(0);
        self.cb_successes.with_label_values(&refs).inc_by(0);
        self.cb_failures.with_label_values(&refs).inc_by(0);
        self.cb_rejects.with_label_values(&refs).inc_by(0);
        self.cb_short_circuits.with_label_values(&refs).inc_by(0);
        self.cb_timeouts.with_label_values(&refs).inc_by(0);
        self.cb_fallback_successes.with_label_values(&refs).inc_by(0);
        self.cb_fallback_failures.with_label_values(&refs).inc_by(0);
        self.cb_context_canceled.with_label_values(&refs).inc_by(0);
        self.cb_context_deadline_exceeded.with_label_values(&refs).inc_by(0);
        self.cb_total_duration.with_label_values(&refs).set(0.0);
    }

    pub(crate) fn inc_attempts(&self, labels: &BreakerLabels) {
        self.cb_attempts.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_errors(&self, labels: &BreakerLabels) {
        self.cb_errors.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_successes(&self, labels: &BreakerLabels) {
        self.cb_successes.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_failures(&self, labels: &BreakerLabels) {
        self.cb_failures.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_rejects(&self, labels: &BreakerLabels) {
        self.cb_rejects.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_short_circuits(&self, labels: &BreakerLabels) {
        self.cb_short_circuits.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_timeouts(&self, labels: &BreakerLabels) {
        self.cb_timeouts.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_context_canceled(&self, labels: &BreakerLabels) {
        self.cb_context_canceled.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn inc_context_deadline_exceeded(&self, labels: &BreakerLabels) {
        self.cb_context_deadline_exceeded.with_label_values(&labels.refs()).inc();
    }

    pub(crate) fn set_total_duration(&self, labels: &BreakerLabels, seconds: f64) {
        self.cb_total_duration.with_label_values(&labels.refs()).set(seconds);
    }

    pub(crate) fn observe_run_duration(&self, labels: &BreakerLabels, seconds: f64) {
        self.cb_run_duration.with_label_values(&labels.refs()).observe(seconds);
    }

    pub(crate) fn observe_concurrency(&self, labels: &BreakerLabels, in_use: f64) {
        self.cb_concurrency_inuse.with_label_values(&labels.refs()).observe(in_use);
    }
}

/// First routable local address, for the `src_ip` label.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &Registry, family: &str, wanted: &[(&str, &str)]) -> Option<f64> {
        for mf in registry.gather() {
            if mf.get_name() != family {
                continue;
            }
            for metric in mf.get_metric() {
                let labels: Vec<(&str, &str)> = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name(), l.get_value()))
                    .collect();
                if wanted.iter().all(|pair| labels.contains(pair)) {
                    return Some(metric.get_counter().value());
                }
            }
        }
        None
    }

    #[test]
    fn families_register_once() {
        let metrics = CallMetrics::new(Registry::new()).unwrap();
        // A second instance on the same registry collides by name.
        assert!(CallMetrics::new(metrics.registry.clone()).is_err());
    }

    #[test]
    fn observe_call_increments_and_times() {
        let metrics = CallMetrics::new(Registry::new()).unwrap();
        let labels = metrics.api_labels("a", "b", "/x", "GET");
        metrics.observe_call(&labels, 12.5);
        metrics.observe_call(&labels, 3.0);

        let value = counter_value(
            metrics.registry(),
            "service_api_call",
            &[("src", "a"), ("tgt", "b"), ("uri", "/x"), ("method", "GET")],
        );
        assert_eq!(value, Some(2.0));
    }

    #[test]
    fn errcode_carries_status_label() {
        let metrics = CallMetrics::new(Registry::new()).unwrap();
        let labels = metrics.api_labels("a", "b", "/x", "GET");
        metrics.observe_errcode(&labels, 404);

        let value =
            counter_value(metrics.registry(), "service_api_errcode", &[("status", "404")]);
        assert_eq!(value, Some(1.0));
    }

    #[test]
    fn init_breaker_materializes_zeroed_series() {
        let metrics = CallMetrics::new(Registry::new()).unwrap();
        let labels = metrics.breaker_labels("GET-/x", "GET", "/x", "a", "b", "10.0.0.1");
        metrics.init_breaker(&labels);

        let value =
            counter_value(metrics.registry(), "hystrix_go_attempts", &[("command", "GET-/x")]);
        assert_eq!(value, Some(0.0));
    }
}
