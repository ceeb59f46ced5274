use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PIPELINE_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECORDS_STREAMED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static STREAM_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("whisperer_http_requests_total", "HTTP request count."),
                &["route", "status"],
            )
            .expect("create whisperer_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "whisperer_http_request_duration_seconds",
                    "Time until the response head was produced, in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route"],
            )
            .expect("create whisperer_http_request_duration_seconds"),
        )
    })
}

fn pipeline_failures_total() -> &'static IntCounterVec {
    PIPELINE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "whisperer_pipeline_failures_total",
                    "Data requests that stopped before completion, by stage and error code.",
                ),
                &["stage", "code"],
            )
            .expect("create whisperer_pipeline_failures_total"),
        )
    })
}

fn records_streamed_total() -> &'static IntCounter {
    RECORDS_STREAMED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "whisperer_records_streamed_total",
                "Records written to response bodies.",
            )
            .expect("create whisperer_records_streamed_total"),
        )
    })
}

fn stream_failures_total() -> &'static IntCounterVec {
    STREAM_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "whisperer_stream_failures_total",
                    "Failures after the response was committed.",
                ),
                &["kind"],
            )
            .expect("create whisperer_stream_failures_total"),
        )
    })
}

pub fn observe_http_request(route: &str, status: u16, duration: Duration) {
    let status = status.to_string();
    http_requests_total()
        .with_label_values(&[route, status.as_str()])
        .inc();
    http_request_duration_seconds()
        .with_label_values(&[route])
        .observe(duration.as_secs_f64());
}

pub fn observe_pipeline_failure(stage: &str, code: &str) {
    pipeline_failures_total()
        .with_label_values(&[stage, code])
        .inc();
}

pub fn observe_records_streamed(count: usize) {
    records_streamed_total().inc_by(count as u64);
}

pub fn observe_stream_failure(kind: &str) {
    stream_failures_total().with_label_values(&[kind]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = records_streamed_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_observed_series() {
        observe_http_request("data", 200, Duration::from_millis(12));
        observe_pipeline_failure("token_validated", "data_cant_view");
        observe_stream_failure("serialization");
        observe_records_streamed(3);

        let (body, content_type) = render().expect("metrics should render");
        let text = String::from_utf8(body).expect("metrics should be utf-8");

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("whisperer_http_requests_total{route=\"data\",status=\"200\"}"));
        assert!(text.contains("whisperer_pipeline_failures_total"));
        assert!(text.contains("whisperer_stream_failures_total{kind=\"serialization\"}"));
        assert!(text.contains("whisperer_records_streamed_total"));
    }
}
