//! Process lifecycle: provision tenants, build the collector, serve scrapes.

use std::sync::Arc;
use tracing::{info, warn};

use crate::collector::Collector;
use crate::config::Config;
use crate::exposition::{self, AppState};
use crate::metrics::ExporterMetrics;
use crate::tenant::prepare_tenants;

/// Start the exporter and run until Ctrl-C.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let addr = config.listen_addr()?;
    let stats = Arc::new(ExporterMetrics::new());

    // ─── Tenants ────────────────────────────────────────────────────────

    ExporterMetrics::set(&stats.tenants_configured, config.tenants.len() as u64);
    let tenants = prepare_tenants(
        &config.tenants,
        config.connect_timeout(),
        config.connect_timeout(),
    )
    .await;
    ExporterMetrics::set(&stats.tenants_ready, tenants.len() as u64);

    if tenants.is_empty() {
        warn!(configured = config.tenants.len(), "no tenant is ready; scrapes will only carry self-metrics");
    }
    if config.metrics.is_empty() {
        warn!("no metric definitions configured");
    }

    // ─── Collector ──────────────────────────────────────────────────────

    let timeout = config.timeout();
    let collector = Arc::new(Collector::new(
        config.metrics,
        tenants,
        timeout,
        Arc::clone(&stats),
    ));
    info!(
        metrics = collector.definitions().len(),
        tenants = collector.tenants().len(),
        timeout_secs = timeout.as_secs(),
        "collector ready"
    );

    // ─── HTTP ───────────────────────────────────────────────────────────

    let listener = exposition::bind(addr).await?;
    let state = AppState {
        collector: Arc::clone(&collector),
        stats,
    };
    exposition::serve(listener, state, shutdown_signal()).await?;

    info!("shutting down");
    for tenant in collector.tenants() {
        tenant.close().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
