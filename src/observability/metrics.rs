use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub assignments_total: IntCounterVec,
    pub matching_latency_seconds: HistogramVec,
    pub reassignments_total: IntCounterVec,
    pub bookings_cancelled_total: IntCounterVec,
    pub expired_assignments_total: IntCounter,
    pub retry_tasks_processed_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Assignment offers by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let matching_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "matching_latency_seconds",
                "Latency of a full matching pass in seconds",
            ),
            &["outcome"],
        )
        .expect("valid matching_latency_seconds metric");

        let reassignments_total = IntCounterVec::new(
            Opts::new("reassignments_total", "Scheduled reassignments by trigger"),
            &["trigger"],
        )
        .expect("valid reassignments_total metric");

        let bookings_cancelled_total = IntCounterVec::new(
            Opts::new("bookings_cancelled_total", "Cancelled bookings by reason"),
            &["reason"],
        )
        .expect("valid bookings_cancelled_total metric");

        let expired_assignments_total = IntCounter::new(
            "expired_assignments_total",
            "Offers that expired without a driver response",
        )
        .expect("valid expired_assignments_total metric");

        let retry_tasks_processed_total = IntCounterVec::new(
            Opts::new(
                "retry_tasks_processed_total",
                "Consumed retry tasks by outcome",
            ),
            &["outcome"],
        )
        .expect("valid retry_tasks_processed_total metric");

        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(matching_latency_seconds.clone()))
            .expect("register matching_latency_seconds");
        registry
            .register(Box::new(reassignments_total.clone()))
            .expect("register reassignments_total");
        registry
            .register(Box::new(bookings_cancelled_total.clone()))
            .expect("register bookings_cancelled_total");
        registry
            .register(Box::new(expired_assignments_total.clone()))
            .expect("register expired_assignments_total");
        registry
            .register(Box::new(retry_tasks_processed_total.clone()))
            .expect("register retry_tasks_processed_total");

        Self {
            registry,
            assignments_total,
            matching_latency_seconds,
            reassignments_total,
            bookings_cancelled_total,
            expired_assignments_total,
            retry_tasks_processed_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
