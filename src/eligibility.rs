//! Tenant eligibility: does a metric apply to a tenant, and with which schema?
//!
//! Tag filter, then schema resolution, then template rendering, then the
//! statement-shape check. Everything here is pure and case-insensitive.

use thiserror::Error;

use crate::model::MetricDefinition;

/// Token in `sql` replaced by the resolved schema name.
pub const SCHEMA_PLACEHOLDER: &str = "<SCHEMA>";

/// Schema every tenant can see; appended to every schema filter.
pub const BASE_SCHEMA: &str = "pg_catalog";

/// Why a (metric, tenant) pair is not evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    /// Tag filter not satisfied. Expected, not an error.
    #[error("tenant tags do not match tag filter")]
    NotApplicable,
    #[error("no schema_filter entry matches a tenant schema")]
    SchemaUnresolved,
    #[error("only select statements are allowed")]
    InvalidStatement,
}

impl SkipReason {
    /// Configuration problems are worth an error log; tag misses are not.
    pub fn is_config_problem(self) -> bool {
        !matches!(self, Self::NotApplicable)
    }
}

/// Append the base schema to every definition's schema filter if missing.
pub fn ensure_base_schema(defs: &mut [MetricDefinition]) {
    for def in defs {
        if !contains_ignore_case(&def.schema_filter, BASE_SCHEMA) {
            def.schema_filter.push(BASE_SCHEMA.to_string());
        }
    }
}

/// Decide applicability and produce the statement to run for this tenant.
pub fn resolve_statement(
    metric: &MetricDefinition,
    tenant_tags: &[String],
    tenant_schemas: &[String],
) -> Result<String, SkipReason> {
    if !sub_slice_in_slice(&metric.tag_filter, tenant_tags) {
        return Err(SkipReason::NotApplicable);
    }

    let schema = first_value_in_slice(&metric.schema_filter, tenant_schemas)
        .ok_or(SkipReason::SchemaUnresolved)?;

    let statement = metric.sql_template.replace(SCHEMA_PLACEHOLDER, schema);
    if !is_select(&statement) {
        return Err(SkipReason::InvalidStatement);
    }

    Ok(statement)
}

/// True when the trimmed statement starts with `select`, any case.
pub fn is_select(statement: &str) -> bool {
    statement
        .trim()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
}

/// True if `slice` contains `value`, ignoring case.
pub fn contains_ignore_case(slice: &[String], value: &str) -> bool {
    slice.iter().any(|s| s.eq_ignore_ascii_case(value))
}

/// True if every item of `sub` is in `slice` (ignoring case), or `sub` is empty.
pub fn sub_slice_in_slice(sub: &[String], slice: &[String]) -> bool {
    sub.iter().all(|want| contains_ignore_case(slice, want))
}

/// First item of `candidates`, in candidate order, that occurs in `slice`.
pub fn first_value_in_slice<'a>(candidates: &'a [String], slice: &[String]) -> Option<&'a str> {
    candidates
        .iter()
        .find(|c| contains_ignore_case(slice, c))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricType;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn metric(sql: &str, tags: &[&str], schemas: &[&str]) -> MetricDefinition {
        MetricDefinition {
            name: "m".into(),
            help: "h".into(),
            metric_type: MetricType::Gauge,
            sql_template: sql.into(),
            tag_filter: strings(tags),
            schema_filter: strings(schemas),
        }
    }

    #[test]
    fn empty_tag_filter_always_matches() {
        assert!(sub_slice_in_slice(&[], &[]));
        assert!(sub_slice_in_slice(&[], &strings(&["prod"])));
    }

    #[test]
    fn tag_filter_requires_every_tag() {
        assert!(!sub_slice_in_slice(&strings(&["x"]), &strings(&["y"])));
        assert!(!sub_slice_in_slice(&strings(&["prod", "erp"]), &strings(&["prod"])));
        assert!(sub_slice_in_slice(&strings(&["prod", "erp"]), &strings(&["erp", "x", "prod"])));
    }

    #[test]
    fn tag_filter_ignores_case() {
        assert!(sub_slice_in_slice(&strings(&["PROD"]), &strings(&["prod"])));
    }

    #[test]
    fn schema_resolution_follows_filter_order() {
        let filter = strings(&["b", "a"]);
        let schemas = strings(&["a", "b"]);
        assert_eq!(first_value_in_slice(&filter, &schemas), Some("b"));
        let missing = strings(&["c"]);
        assert_eq!(first_value_in_slice(&missing, &schemas), None);
    }

    #[test]
    fn renders_every_placeholder_with_filter_spelling() {
        let def = metric("select count(*) from <SCHEMA>.a join <SCHEMA>.b using (id)", &[], &["APP"]);
        let sql = resolve_statement(&def, &[], &strings(&["app"])).unwrap();
        assert_eq!(sql, "select count(*) from APP.a join APP.b using (id)");
    }

    #[test]
    fn tag_miss_is_not_applicable() {
        let def = metric("select 1", &["prod"], &["pg_catalog"]);
        let err = resolve_statement(&def, &strings(&["dev"]), &strings(&["pg_catalog"])).unwrap_err();
        assert_eq!(err, SkipReason::NotApplicable);
        assert!(!err.is_config_problem());
    }

    #[test]
    fn unresolved_schema_is_config_problem() {
        let def = metric("select 1 from <SCHEMA>.t", &[], &["app"]);
        let err = resolve_statement(&def, &[], &strings(&["pg_catalog", "public"])).unwrap_err();
        assert_eq!(err, SkipReason::SchemaUnresolved);
        assert!(err.is_config_problem());
    }

    #[test]
    fn non_select_is_always_rejected() {
        let def = metric("update foo set x=1", &[], &["pg_catalog"]);
        let err = resolve_statement(&def, &[], &strings(&["pg_catalog"])).unwrap_err();
        assert_eq!(err, SkipReason::InvalidStatement);
        assert!(!is_select("sel"));
        assert!(!is_select(""));
        assert!(!is_select("with x as (select 1) select * from x"));
        assert!(is_select("  \n SELECT 1"));
    }

    #[test]
    fn base_schema_added_once() {
        let mut defs = vec![
            metric("select 1", &[], &["app"]),
            metric("select 1", &[], &["PG_CATALOG", "app"]),
            metric("select 1", &[], &[]),
        ];
        ensure_base_schema(&mut defs);
        assert_eq!(defs[0].schema_filter, strings(&["app", "pg_catalog"]));
        assert_eq!(defs[1].schema_filter, strings(&["PG_CATALOG", "app"]));
        assert_eq!(defs[2].schema_filter, strings(&["pg_catalog"]));
        for def in &defs {
            assert!(contains_ignore_case(&def.schema_filter, BASE_SCHEMA));
        }
    }
}
