//! Connection pool: one bounded pool of sessions per tenant.
//!
//! A permit from `slots` is required to hold a session, so at most
//! `max_connections` sessions exist at once. Idle sessions sit in a queue and
//! are reused first. The idle lock is never held across network I/O.

use futures::future::BoxFuture;
use rustls::ClientConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::connection::{ConnectTarget, PgConnection};
use crate::error::{ConnectError, QueryError};
use crate::query::{QueryExecutor, QueryResult};

pub struct TenantPool {
    tenant: String,
    target: ConnectTarget,
    tls: Option<Arc<ClientConfig>>,
    idle: Mutex<VecDeque<PgConnection>>,
    slots: Semaphore,
    connect_timeout: Duration,
    checkout_timeout: Duration,
}

impl TenantPool {
    pub fn new(
        tenant: &str,
        target: ConnectTarget,
        tls: Option<Arc<ClientConfig>>,
        max_connections: u32,
        connect_timeout: Duration,
        checkout_timeout: Duration,
    ) -> Self {
        Self {
            tenant: tenant.to_string(),
            target,
            tls,
            idle: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(max_connections.max(1) as usize),
            connect_timeout,
            checkout_timeout,
        }
    }

    #[cfg(test)]
    async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Run `sql` on a pooled session. Sessions broken by the failure are
    /// dropped; everything else goes back to the idle queue.
    async fn run(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let permit = match tokio::time::timeout(self.checkout_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueryError::PoolClosed),
            Err(_) => return Err(QueryError::PoolTimeout),
        };

        let reused = self.idle.lock().await.pop_front();
        let mut conn = match reused {
            Some(conn) => {
                debug!(tenant = %self.tenant, "pool: reusing idle session");
                conn
            }
            None => {
                debug!(tenant = %self.tenant, "pool: opening new session");
                self.open().await?
            }
        };

        let outcome = conn.simple_query(sql).await;
        match &outcome {
            Err(e) if e.breaks_session() => {
                warn!(tenant = %self.tenant, error = %e, "pool: discarding broken session");
                drop(conn);
            }
            _ => self.idle.lock().await.push_back(conn),
        }
        drop(permit);
        outcome
    }

    async fn open(&self) -> Result<PgConnection, ConnectError> {
        match tokio::time::timeout(
            self.connect_timeout,
            PgConnection::connect(&self.target, self.tls.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout)),
        }
    }

    /// Refuse further checkouts and say goodbye to every idle session.
    async fn shutdown(&self) {
        self.slots.close();
        let drained: Vec<PgConnection> = self.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for conn in drained {
            conn.terminate().await;
        }
        debug!(tenant = %self.tenant, sessions = count, "pool: closed");
    }
}

impl QueryExecutor for TenantPool {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<QueryResult, QueryError>> {
        Box::pin(self.run(sql))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}
