//! HTTP exposition: every scrape runs a fresh collection cycle.
//!
//! Endpoints:
//!   GET /metrics  collected metrics plus exporter self-metrics, Prometheus text
//!   GET /health   liveness with the ready tenant count
//!   GET /status   JSON view of ready tenants and metric definitions

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::fmt::Write;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::collector::Collector;
use crate::metrics::ExporterMetrics;
use crate::model::MetricSnapshot;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub stats: Arc<ExporterMetrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "exposition endpoint listening");
    Ok(listener)
}

/// Serve until `shutdown` resolves; in-flight scrapes are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ─── GET /metrics ────────────────────────────────────────────────────────────

async fn metrics(State(state): State<AppState>) -> Response {
    let snapshots = state.collector.collect().await;

    let mut out = String::with_capacity(4096);
    render_snapshots(&snapshots, &mut out);
    state.stats.render(&mut out);

    (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], out).into_response()
}

/// Prometheus text for collected snapshots. Snapshots without observations
/// are left out entirely.
pub fn render_snapshots(snapshots: &[MetricSnapshot], out: &mut String) {
    for snapshot in snapshots.iter().filter(|s| !s.observations.is_empty()) {
        let name = &snapshot.name;
        let _ = writeln!(out, "# HELP {name} {}", escape_help(&snapshot.help));
        let _ = writeln!(out, "# TYPE {name} {}", snapshot.metric_type);

        for obs in &snapshot.observations {
            out.push_str(name);
            if !obs.labels.is_empty() {
                out.push('{');
                for (i, (label, value)) in obs.labels.iter().zip(&obs.label_values).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{label}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", format_value(obs.value));
        }
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', r"\\").replace('\n', r"\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".into()
    } else if value == f64::INFINITY {
        "+Inf".into()
    } else if value == f64::NEG_INFINITY {
        "-Inf".into()
    } else {
        value.to_string()
    }
}

// ─── GET /health ─────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "tenants": state.collector.tenants().len(),
    }))
}

// ─── GET /status ─────────────────────────────────────────────────────────────

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let tenants: Vec<_> = state
        .collector
        .tenants()
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "user": t.user,
                "usage": t.usage,
                "tags": t.tags,
                "schemas": t.schemas,
            })
        })
        .collect();

    let metrics: Vec<_> = state
        .collector
        .definitions()
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "type": m.metric_type.to_string(),
                "tag_filter": m.tag_filter,
                "schema_filter": m.schema_filter,
            })
        })
        .collect();

    Json(json!({ "tenants": tenants, "metrics": metrics }))
}
