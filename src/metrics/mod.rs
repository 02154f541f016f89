//! Process-wide analytics metrics: stage duration histograms, failure
//! counters per error kind, and detector pattern counts, exported on a pull
//! endpoint.

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder, Encoder};
use std::time::Instant;

#[derive(Clone)]
pub struct AnalyticsMetrics {
    registry: Registry,

    stage_duration: HistogramVec,
    stage_failures: CounterVec,
    runs_completed: Counter,
    runs_failed: Counter,

    features_written: Counter,
    patterns_detected: CounterVec,
    alerts_emitted: CounterVec,
    alert_clusters_emitted: Counter,

    start_time: Instant,
}

impl AnalyticsMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let stage_duration = HistogramVec::new(
            HistogramOpts::new("analytics_stage_duration_seconds", "Duration of each pipeline stage"),
            &["stage"],
        )?;
        registry.register(Box::new(stage_duration.clone()))?;

        let stage_failures = CounterVec::new(
            Opts::new("analytics_stage_failures_total", "Stage failures by error kind"),
            &["stage", "error_kind"],
        )?;
        registry.register(Box::new(stage_failures.clone()))?;

        let runs_completed = Counter::with_opts(Opts::new(
            "analytics_runs_completed_total",
            "Total pipeline runs that wrote an audit row",
        ))?;
        registry.register(Box::new(runs_completed.clone()))?;

        let runs_failed = Counter::with_opts(Opts::new(
            "analytics_runs_failed_total",
            "Total pipeline runs that aborted before the audit stage",
        ))?;
        registry.register(Box::new(runs_failed.clone()))?;

        let features_written = Counter::with_opts(Opts::new(
            "analytics_features_written_total",
            "Total feature vectors written",
        ))?;
        registry.register(Box::new(features_written.clone()))?;

        let patterns_detected = CounterVec::new(
            Opts::new("analytics_patterns_detected_total", "Patterns detected by type"),
            &["pattern_type"],
        )?;
        registry.register(Box::new(patterns_detected.clone()))?;

        let alerts_emitted = CounterVec::new(
            Opts::new("analytics_alerts_emitted_total", "Alerts emitted by typology"),
            &["typology_type"],
        )?;
        registry.register(Box::new(alerts_emitted.clone()))?;

        let alert_clusters_emitted = Counter::with_opts(Opts::new(
            "analytics_alert_clusters_emitted_total",
            "Total same-entity alert clusters emitted",
        ))?;
        registry.register(Box::new(alert_clusters_emitted.clone()))?;

        Ok(Self {
            registry,
            stage_duration,
            stage_failures,
            runs_completed,
            runs_failed,
            features_written,
            patterns_detected,
            alerts_emitted,
            alert_clusters_emitted,
            start_time: Instant::now(),
        })
    }

    pub fn record_stage_duration(&self, stage: &str, seconds: f64) {
        self.stage_duration.with_label_values(&[stage]).observe(seconds);
    }

    pub fn record_stage_failure(&self, stage: &str, error_kind: &str) {
        self.stage_failures.with_label_values(&[stage, error_kind]).inc();
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.inc();
    }

    pub fn record_run_failed(&self) {
        self.runs_failed.inc();
    }

    pub fn record_features_written(&self, n: usize) {
        self.features_written.inc_by(n as f64);
    }

    pub fn record_patterns_detected(&self, pattern_type: &str, n: usize) {
        self.patterns_detected.with_label_values(&[pattern_type]).inc_by(n as f64);
    }

    pub fn record_alerts_emitted(&self, typology_type: &str, n: usize) {
        self.alerts_emitted.with_label_values(&[typology_type]).inc_by(n as f64);
    }

    pub fn record_alert_clusters_emitted(&self, n: usize) {
        self.alert_clusters_emitted.inc_by(n as f64);
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve `/health` and `/metrics` on `port` until the process exits.
    /// Runs forever; callers spawn this on its own task alongside a pipeline run.
    pub async fn serve(self: std::sync::Arc<Self>, port: u16) {
        use warp::Filter;

        let health = warp::path("health").and(warp::get()).map(|| "ok");

        let m = self.clone();
        let metrics_route = warp::path("metrics").and(warp::get()).map(move || match m.render() {
            Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
            Err(e) => warp::reply::with_status(e.to_string(), warp::http::StatusCode::INTERNAL_SERVER_ERROR),
        });

        let routes = health.or(metrics_route).with(warp::log("analytics_metrics"));
        log::info!("metrics endpoint listening on 0.0.0.0:{port}");
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    }
}
