//! Tenant provisioning: configured tenants become ready tenants.
//!
//! A tenant is ready once its pool can reach the database, a liveness check
//! passes, and its usage string and visible schemas have been read. A tenant
//! that fails any step is logged and left out for the rest of the process run.

use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::connection::ConnectTarget;
use crate::eligibility::{BASE_SCHEMA, contains_ignore_case};
use crate::error::ProvisionError;
use crate::pool::TenantPool;
use crate::query::QueryExecutor;
use crate::tls;

pub const PING_SQL: &str = "SELECT 1";
pub const USAGE_SQL: &str = "SELECT coalesce(shobj_description(oid, 'pg_database'), '') \
     FROM pg_database WHERE datname = current_database()";
pub const SCHEMAS_SQL: &str = "SELECT nspname FROM pg_namespace \
     WHERE has_schema_privilege(nspname, 'USAGE') ORDER BY nspname";

const UNKNOWN_USAGE: &str = "unknown";

/// One `[[tenant]]` block as parsed from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TenantConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to the user name, as libpq does.
    pub database: Option<String>,
    pub user: String,
    pub password: Option<String>,
    /// Environment variable holding the password; wins over `password`.
    pub password_env: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    pub tls_ca: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    2
}

impl TenantConfig {
    fn password(&self) -> Result<String, ProvisionError> {
        if let Some(var) = &self.password_env {
            return std::env::var(var)
                .map_err(|e| ProvisionError::Password(format!("${var}: {e}")));
        }
        Ok(self.password.clone().unwrap_or_default())
    }

    fn target(&self, password: String) -> ConnectTarget {
        ConnectTarget {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone().unwrap_or_else(|| self.user.clone()),
            user: self.user.clone(),
            password,
        }
    }
}

/// A ready tenant. Shared read-only by every collection task.
pub struct Tenant {
    pub name: String,
    pub user: String,
    pub tags: Vec<String>,
    pub usage: String,
    /// Always contains the base schema.
    pub schemas: Vec<String>,
    pub executor: Arc<dyn QueryExecutor>,
}

impl Tenant {
    /// Ping, then fetch usage and schemas through `executor`.
    pub async fn discover(
        name: &str,
        user: &str,
        tags: Vec<String>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Result<Self, ProvisionError> {
        executor.query(PING_SQL).await.map_err(ProvisionError::Ping)?;

        let usage = executor
            .query(USAGE_SQL)
            .await
            .map_err(ProvisionError::Discovery)?
            .first_value()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(UNKNOWN_USAGE)
            .to_string();

        let granted = executor
            .query(SCHEMAS_SQL)
            .await
            .map_err(ProvisionError::Discovery)?;
        let schemas = collect_schemas(granted.rows.iter().filter_map(|r| r.first()?.as_deref()));

        Ok(Self {
            name: name.to_string(),
            user: user.to_string(),
            tags,
            usage,
            schemas,
            executor,
        })
    }

    pub async fn close(&self) {
        self.executor.close().await;
    }
}

/// Base schema first, then the granted schemas without repeating it.
fn collect_schemas<'a>(granted: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut schemas = vec![BASE_SCHEMA.to_string()];
    for schema in granted {
        if !contains_ignore_case(&schemas, schema) {
            schemas.push(schema.to_string());
        }
    }
    schemas
}

/// Provision every configured tenant concurrently; return the ready ones in
/// configuration order.
pub async fn prepare_tenants(
    configs: &[TenantConfig],
    connect_timeout: Duration,
    checkout_timeout: Duration,
) -> Vec<Arc<Tenant>> {
    let attempts = configs
        .iter()
        .map(|cfg| prepare_tenant(cfg, connect_timeout, checkout_timeout));

    join_all(attempts)
        .await
        .into_iter()
        .zip(configs)
        .filter_map(|(outcome, cfg)| match outcome {
            Ok(tenant) => {
                info!(
                    tenant = %tenant.name,
                    usage = %tenant.usage,
                    schemas = tenant.schemas.len(),
                    tags = %tenant.tags.join(", "),
                    "tenant ready"
                );
                Some(Arc::new(tenant))
            }
            Err(e) => {
                error!(tenant = %cfg.name, error = %e, "tenant removed");
                None
            }
        })
        .collect()
}

async fn prepare_tenant(
    cfg: &TenantConfig,
    connect_timeout: Duration,
    checkout_timeout: Duration,
) -> Result<Tenant, ProvisionError> {
    let password = cfg.password()?;

    let tls_config = if cfg.tls {
        let verification = tls::Verification::from_settings(cfg.tls_verify, cfg.tls_ca.as_deref());
        Some(tls::client_config(&verification).map_err(ProvisionError::Tls)?)
    } else {
        None
    };

    let pool: Arc<dyn QueryExecutor> = Arc::new(TenantPool::new(
        &cfg.name,
        cfg.target(password),
        tls_config,
        cfg.max_connections,
        connect_timeout,
        checkout_timeout,
    ));

    match Tenant::discover(&cfg.name, &cfg.user, cfg.tags.clone(), Arc::clone(&pool)).await {
        Ok(tenant) => Ok(tenant),
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::oid;
    use crate::testutil::{Canned, FakeAuth, FakeReply, FakeServer, MemoryExecutor, result};

    fn healthy_executor() -> MemoryExecutor {
        MemoryExecutor::new()
            .on(PING_SQL, Canned::Rows(result(&[("?column?", oid::INT4)], &[&[Some("1")]])))
            .on(USAGE_SQL, Canned::Rows(result(&[("usage", oid::TEXT)], &[&[Some("Production")]])))
            .on(
                SCHEMAS_SQL,
                Canned::Rows(result(
                    &[("nspname", oid::NAME)],
                    &[&[Some("app")], &[Some("pg_catalog")], &[Some("public")]],
                )),
            )
    }

    #[tokio::test]
    async fn discover_populates_usage_and_schemas() {
        let tenant = Tenant::discover("ERP", "monitor", vec!["prod".into()], Arc::new(healthy_executor()))
            .await
            .unwrap();
        assert_eq!(tenant.usage, "Production");
        assert_eq!(tenant.schemas, vec!["pg_catalog", "app", "public"]);
        assert_eq!(tenant.tags, vec!["prod"]);
    }

    #[tokio::test]
    async fn discover_defaults_empty_usage() {
        let exec = healthy_executor()
            .on(USAGE_SQL, Canned::Rows(result(&[("usage", oid::TEXT)], &[&[Some("  ")]])));
        let tenant = Tenant::discover("t", "u", vec![], Arc::new(exec)).await.unwrap();
        assert_eq!(tenant.usage, UNKNOWN_USAGE);
    }

    #[tokio::test]
    async fn failed_ping_removes_tenant() {
        let exec = healthy_executor().on(PING_SQL, Canned::Fail("connection refused".into()));
        let err = Tenant::discover("t", "u", vec![], Arc::new(exec)).await.err().unwrap();
        assert!(matches!(err, ProvisionError::Ping(_)));
    }

    #[tokio::test]
    async fn failed_schema_lookup_removes_tenant() {
        let exec = healthy_executor().on(SCHEMAS_SQL, Canned::Fail("permission denied".into()));
        let err = Tenant::discover("t", "u", vec![], Arc::new(exec)).await.err().unwrap();
        assert!(matches!(err, ProvisionError::Discovery(_)));
    }

    #[test]
    fn base_schema_always_first_and_unique() {
        let schemas = collect_schemas(["PG_CATALOG", "app"].into_iter());
        assert_eq!(schemas, vec!["pg_catalog", "app"]);
        let none = collect_schemas(std::iter::empty());
        assert_eq!(none, vec![BASE_SCHEMA]);
    }

    #[test]
    fn database_defaults_to_user() {
        let cfg: TenantConfig = toml::from_str(
            r#"
            name = "erp"
            user = "monitor"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 5432);
        assert!(cfg.tls_verify);
        assert_eq!(cfg.max_connections, 2);
        assert_eq!(cfg.target(String::new()).database, "monitor");
    }

    #[test]
    fn missing_password_env_is_error() {
        let cfg = TenantConfig {
            name: "erp".into(),
            host: default_host(),
            port: 5432,
            database: None,
            user: "monitor".into(),
            password: Some("ignored".into()),
            password_env: Some("TENANT_SQL_EXPORTER_TEST_SURELY_UNSET".into()),
            tags: vec![],
            tls: false,
            tls_verify: true,
            tls_ca: None,
            max_connections: 1,
        };
        assert!(matches!(cfg.password(), Err(ProvisionError::Password(_))));
    }

    #[tokio::test]
    async fn prepare_tenants_keeps_reachable_ones() {
        let server = FakeServer::start(FakeAuth::Trust, |sql| match sql {
            PING_SQL => FakeReply::rows(&[("?column?", oid::INT4)], &[&[Some("1")]]),
            USAGE_SQL => FakeReply::rows(&[("usage", oid::TEXT)], &[&[Some("QA")]]),
            SCHEMAS_SQL => FakeReply::rows(&[("nspname", oid::NAME)], &[&[Some("public")]]),
            _ => FakeReply::error("42601", "syntax error"),
        })
        .await;

        let reachable: TenantConfig = toml::from_str(&format!(
            "name = \"qa\"\nuser = \"monitor\"\nport = {}\ntags = [\"test\"]",
            server.addr.port()
        ))
        .unwrap();
        // Nothing listens on port 1.
        let unreachable: TenantConfig =
            toml::from_str("name = \"down\"\nuser = \"monitor\"\nport = 1").unwrap();

        let ready = prepare_tenants(
            &[unreachable, reachable],
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await;

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].name, "qa");
        assert_eq!(ready[0].usage, "QA");
        assert_eq!(ready[0].schemas, vec!["pg_catalog", "public"]);
        for t in &ready {
            t.close().await;
        }
    }
}
