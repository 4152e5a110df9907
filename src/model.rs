//! Metric definitions and the observations collected for them.

use serde::Deserialize;
use std::fmt;

/// Prometheus sample type of a metric definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MetricType {
    Gauge,
    Counter,
}

impl TryFrom<String> for MetricType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(format!("unknown metric_type '{other}' (expected gauge or counter)")),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        })
    }
}

/// One `[[metric]]` block: a SQL template plus tenant filters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    #[serde(rename = "sql")]
    pub sql_template: String,
    #[serde(default)]
    pub tag_filter: Vec<String>,
    #[serde(default)]
    pub schema_filter: Vec<String>,
}

/// One (value, label set) pair from one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub value: f64,
    pub labels: Vec<String>,
    pub label_values: Vec<String>,
}

/// All observations for one metric definition in one collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub observations: Vec<Observation>,
}

impl MetricSnapshot {
    pub fn empty(def: &MetricDefinition) -> Self {
        Self {
            name: def.name.clone(),
            help: def.help.clone(),
            metric_type: def.metric_type,
            observations: Vec::new(),
        }
    }
}
