//! Exporter self-metrics: atomic counters describing the collection engine.
//!
//! Shared as `Arc<ExporterMetrics>` between the collector and the HTTP layer,
//! rendered by hand after the collected metrics on every scrape.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

pub const PREFIX: &str = "tenant_sql_exporter";

#[derive(Default)]
pub struct ExporterMetrics {
    // ─── Scrapes ─────────────────────────────────────────────────────────
    pub scrapes_total: AtomicU64,
    pub last_scrape_duration_ms: AtomicU64,

    // ─── Tenants ─────────────────────────────────────────────────────────
    pub tenants_configured: AtomicU64,
    pub tenants_ready: AtomicU64,

    // ─── Per (metric, tenant) outcomes ───────────────────────────────────
    pub query_errors: AtomicU64,
    pub config_skips: AtomicU64,
    /// Metric collections that hit the timeout before every tenant answered.
    pub timeouts: AtomicU64,
    /// Tenant results delivered after their metric's collection had finished.
    pub late_results: AtomicU64,
}

impl ExporterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Append Prometheus text for every self-metric to `out`.
    pub fn render(&self, out: &mut String) {
        let rows: [(&str, &str, &str, &AtomicU64); 8] = [
            ("scrapes_total", "counter", "Scrapes served.", &self.scrapes_total),
            (
                "last_scrape_duration_milliseconds",
                "gauge",
                "Duration of the most recent collection cycle.",
                &self.last_scrape_duration_ms,
            ),
            ("tenants_configured", "gauge", "Tenants present in configuration.", &self.tenants_configured),
            ("tenants_ready", "gauge", "Tenants that passed provisioning.", &self.tenants_ready),
            ("query_errors_total", "counter", "Tenant queries that failed or returned unusable rows.", &self.query_errors),
            ("config_skips_total", "counter", "Metric/tenant pairs skipped for configuration problems.", &self.config_skips),
            ("timeouts_total", "counter", "Metric collections cut short by the timeout.", &self.timeouts),
            ("late_results_total", "counter", "Tenant results discarded because they arrived after the timeout.", &self.late_results),
        ];

        for (name, kind, help, value) in rows {
            let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
            let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
            let _ = writeln!(out, "{PREFIX}_{name} {}", value.load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_returns_previous_value() {
        let m = ExporterMetrics::new();
        assert_eq!(ExporterMetrics::inc(&m.late_results), 0);
        assert_eq!(ExporterMetrics::inc(&m.late_results), 1);
        assert_eq!(m.late_results.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn render_lists_every_counter() {
        let m = ExporterMetrics::new();
        ExporterMetrics::set(&m.tenants_ready, 3);
        ExporterMetrics::inc(&m.timeouts);

        let mut out = String::new();
        m.render(&mut out);
        assert!(out.contains("# TYPE tenant_sql_exporter_late_results_total counter\n"));
        assert!(out.contains("tenant_sql_exporter_tenants_ready 3\n"));
        assert!(out.contains("tenant_sql_exporter_timeouts_total 1\n"));
        assert_eq!(out.lines().filter(|l| l.starts_with("# HELP")).count(), 8);
    }
}
