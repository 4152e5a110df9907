//! Collection engine: metrics fan out across tenants, snapshots fan back in.
//!
//! `collect_metric` runs one definition against every tenant and stops
//! waiting once the timeout fires; `Collector::collect` runs every definition
//! at once. Per-tenant failures are logged and contribute nothing. No error
//! ever reaches the caller of `collect`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::eligibility::{ensure_base_schema, resolve_statement};
use crate::metrics::ExporterMetrics;
use crate::model::{MetricDefinition, MetricSnapshot, Observation};
use crate::normalize;
use crate::tenant::Tenant;

pub struct Collector {
    metrics: Arc<[Arc<MetricDefinition>]>,
    tenants: Arc<[Arc<Tenant>]>,
    timeout: Duration,
    stats: Arc<ExporterMetrics>,
}

impl Collector {
    /// Definitions are frozen here, after the base schema has been added to
    /// every schema filter.
    pub fn new(
        mut definitions: Vec<MetricDefinition>,
        tenants: Vec<Arc<Tenant>>,
        timeout: Duration,
        stats: Arc<ExporterMetrics>,
    ) -> Self {
        ensure_base_schema(&mut definitions);
        Self {
            metrics: definitions.into_iter().map(Arc::new).collect(),
            tenants: tenants.into(),
            timeout,
            stats,
        }
    }

    pub fn definitions(&self) -> &[Arc<MetricDefinition>] {
        &self.metrics
    }

    pub fn tenants(&self) -> &[Arc<Tenant>] {
        &self.tenants
    }

    /// One full collection cycle. Snapshots come back in definition order;
    /// a definition with no usable results still yields an empty snapshot.
    pub async fn collect(&self) -> Vec<MetricSnapshot> {
        let started = Instant::now();
        let mut tasks = JoinSet::new();

        for (idx, metric) in self.metrics.iter().enumerate() {
            let metric = Arc::clone(metric);
            let tenants = Arc::clone(&self.tenants);
            let stats = Arc::clone(&self.stats);
            let timeout = self.timeout;
            tasks.spawn(async move {
                let observations = collect_metric(&metric, &tenants, timeout, &stats).await;
                let mut snapshot = MetricSnapshot::empty(&metric);
                snapshot.observations = observations;
                (idx, snapshot)
            });
        }

        let mut snapshots = Vec::with_capacity(self.metrics.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => snapshots.push(entry),
                Err(e) => error!(error = %e, "metric collection task failed"),
            }
        }
        snapshots.sort_by_key(|(idx, _)| *idx);

        let elapsed = started.elapsed();
        ExporterMetrics::inc(&self.stats.scrapes_total);
        ExporterMetrics::set(&self.stats.last_scrape_duration_ms, elapsed.as_millis() as u64);
        debug!(
            metrics = snapshots.len(),
            tenants = self.tenants.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "collection cycle done"
        );

        snapshots.into_iter().map(|(_, s)| s).collect()
    }
}

/// Evaluate `metric` on every tenant concurrently and gather what arrives
/// before `timeout`. Tenants still running are left to finish on their own;
/// their results are dropped.
pub async fn collect_metric(
    metric: &Arc<MetricDefinition>,
    tenants: &[Arc<Tenant>],
    timeout: Duration,
    stats: &Arc<ExporterMetrics>,
) -> Vec<Observation> {
    let (tx, mut rx) = mpsc::channel::<Vec<Observation>>(tenants.len().max(1));

    for tenant in tenants {
        let tx = tx.clone();
        let metric = Arc::clone(metric);
        let tenant = Arc::clone(tenant);
        let stats = Arc::clone(stats);
        tokio::spawn(async move {
            let observations = evaluate(&metric, &tenant, &stats).await;
            if tx.send(observations).await.is_err() {
                ExporterMetrics::inc(&stats.late_results);
                debug!(metric = %metric.name, tenant = %tenant.name, "late result discarded");
            }
        });
    }
    drop(tx);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut observations = Vec::new();
    let mut delivered = 0;
    while delivered < tenants.len() {
        tokio::select! {
            delivery = rx.recv() => match delivery {
                Some(batch) => {
                    delivered += 1;
                    observations.extend(batch);
                }
                None => break,
            },
            _ = &mut deadline => {
                ExporterMetrics::inc(&stats.timeouts);
                warn!(
                    metric = %metric.name,
                    pending = tenants.len() - delivered,
                    timeout_ms = timeout.as_millis() as u64,
                    "metric collection timed out"
                );
                break;
            }
        }
    }

    observations
}

/// Eligibility, execution, and normalization for one (metric, tenant) pair.
async fn evaluate(metric: &MetricDefinition, tenant: &Tenant, stats: &ExporterMetrics) -> Vec<Observation> {
    let statement = match resolve_statement(metric, &tenant.tags, &tenant.schemas) {
        Ok(statement) => statement,
        Err(reason) if reason.is_config_problem() => {
            ExporterMetrics::inc(&stats.config_skips);
            error!(metric = %metric.name, tenant = %tenant.name, reason = %reason, "metric skipped");
            return Vec::new();
        }
        Err(reason) => {
            debug!(metric = %metric.name, tenant = %tenant.name, reason = %reason, "metric not applicable");
            return Vec::new();
        }
    };

    match normalize::evaluate(tenant, &statement).await {
        Ok(observations) => observations,
        Err(e) => {
            ExporterMetrics::inc(&stats.query_errors);
            error!(metric = %metric.name, tenant = %tenant.name, error = %e, "tenant query failed");
            Vec::new()
        }
    }
}
