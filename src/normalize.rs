//! Result normalization: tabular rows into labeled numeric observations.
//!
//! Column 0 is the value; columns 1..n become labels named after the column.
//! Every observation starts with the `tenant` and `usage` labels. A result is
//! accepted whole or not at all: one NULL or one unparsable value discards
//! every row.

use std::collections::HashSet;

use crate::error::QueryError;
use crate::model::Observation;
use crate::query::{ColumnClass, QueryResult};
use crate::tenant::Tenant;

pub const TENANT_LABEL: &str = "tenant";
pub const USAGE_LABEL: &str = "usage";

/// Run `statement` on the tenant and normalize the result.
pub async fn evaluate(tenant: &Tenant, statement: &str) -> Result<Vec<Observation>, QueryError> {
    let result = tenant.executor.query(statement).await?;
    normalize(&tenant.name, &tenant.usage, &result)
}

/// Turn one tenant's result into observations.
pub fn normalize(
    tenant_name: &str,
    usage: &str,
    result: &QueryResult,
) -> Result<Vec<Observation>, QueryError> {
    let first = result.columns.first().ok_or(QueryError::NoColumns)?;
    match first.class() {
        ColumnClass::Numeric => {}
        class => {
            return Err(QueryError::FirstColumnNotNumeric {
                column: first.name.clone(),
                class,
            });
        }
    }

    let label_names: Vec<String> = result.columns[1..]
        .iter()
        .map(|c| label_name(&c.name))
        .collect();
    let mut seen = HashSet::from([TENANT_LABEL, USAGE_LABEL]);
    for name in &label_names {
        if !seen.insert(name.as_str()) {
            return Err(QueryError::DuplicateLabel { label: name.clone() });
        }
    }
    let tenant_value = tenant_name.to_lowercase();
    let usage_value = usage.to_lowercase();

    let mut observations = Vec::with_capacity(result.rows.len());
    for (row_idx, row) in result.rows.iter().enumerate() {
        let mut cells = Vec::with_capacity(row.len());
        for (col_idx, cell) in row.iter().enumerate() {
            let Some(cell) = cell else {
                let column = result
                    .columns
                    .get(col_idx)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("#{col_idx}"));
                return Err(QueryError::NullValue { row: row_idx, column });
            };
            cells.push(cell.as_str());
        }

        let Some((raw_value, label_cells)) = cells.split_first() else {
            return Err(QueryError::Protocol(format!("row {row_idx} has no cells")));
        };
        let value = raw_value
            .parse::<f64>()
            .map_err(|_| QueryError::InvalidFloat {
                value: raw_value.to_string(),
            })?;

        let mut labels = Vec::with_capacity(2 + label_names.len());
        let mut label_values = Vec::with_capacity(2 + label_names.len());
        labels.push(TENANT_LABEL.to_string());
        label_values.push(tenant_value.clone());
        labels.push(USAGE_LABEL.to_string());
        label_values.push(usage_value.clone());

        for (name, raw) in label_names.iter().zip(label_cells) {
            labels.push(name.clone());
            label_values.push(normalize_label_value(raw));
        }

        observations.push(Observation {
            value,
            labels,
            label_values,
        });
    }

    Ok(observations)
}

/// Lower-cased column name with every character outside `[a-z0-9_]`
/// replaced by `_`; a leading digit gets a `_` prefix.
pub fn label_name(column: &str) -> String {
    let mut out: String = column
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Lower-case and join whitespace-separated words with `_`.
/// `"Data Center"` → `"data_center"`; idempotent.
pub fn normalize_label_value(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
