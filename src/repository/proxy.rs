use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use super::ProxyRegistry;
use crate::error::{Result, WardenError};
use crate::models::{HealthUpdate, NewProxy, Proxy, ProxyStatus, ProxyType};

/// PostgreSQL-backed proxy registry
#[derive(Clone)]
pub struct ProxyRepository {
    pool: PgPool,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, host: &str, port: i32) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM proxies WHERE host = $1 AND port = $2)",
        )
        .bind(host)
        .bind(port)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn assigned_identities(&self, id: i32) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts WHERE proxy_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[async_trait]
impl ProxyRegistry for ProxyRepository {
    async fn get(&self, id: i32) -> Result<Proxy> {
        sqlx::query_as::<_, Proxy>(
            r#"
            SELECT id, name, type, host, port, username, password, status,
                   health_check_url, last_health_check, health_check_success,
                   response_time_ms, created_at, updated_at
            FROM proxies
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(WardenError::ProxyNotFound { id })
    }

    async fn list_all(&self) -> Result<Vec<Proxy>> {
        let proxies = sqlx::query_as::<_, Proxy>(
            r#"
            SELECT id, name, type, host, port, username, password, status,
                   health_check_url, last_health_check, health_check_success,
                   response_time_ms, created_at, updated_at
            FROM proxies
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(proxies)
    }

    async fn list_active(&self) -> Result<Vec<Proxy>> {
        let proxies = sqlx::query_as::<_, Proxy>(
            r#"
            SELECT id, name, type, host, port, username, password, status,
                   health_check_url, last_health_check, health_check_success,
                   response_time_ms, created_at, updated_at
            FROM proxies
            WHERE status IN ('active', 'error')
            ORDER BY last_health_check ASC NULLS FIRST, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(proxies)
    }

    async fn list_available(&self, proxy_type: Option<ProxyType>) -> Result<Vec<Proxy>> {
        let proxies = sqlx::query_as::<_, Proxy>(
            r#"
            SELECT id, name, type, host, port, username, password, status,
                   health_check_url, last_health_check, health_check_success,
                   response_time_ms, created_at, updated_at
            FROM proxies
            WHERE status = 'active'
              AND health_check_success = TRUE
              AND ($1::VARCHAR IS NULL OR type = $1)
            ORDER BY response_time_ms ASC, id ASC
            "#,
        )
        .bind(proxy_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(proxies)
    }

    async fn update_health(&self, id: i32, update: &HealthUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET health_check_success = $2,
                response_time_ms = $3,
                last_health_check = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.success)
        .bind(update.latency_ms.max(0))
        .bind(update.checked_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WardenError::ProxyNotFound { id });
        }

        Ok(())
    }

    async fn update_status(&self, id: i32, status: ProxyStatus) -> Result<()> {
        let result = sqlx::query("UPDATE proxies SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(WardenError::ProxyNotFound { id });
        }

        info!(id = id, status = %status, "Updated proxy status");
        Ok(())
    }

    async fn transition_status(
        &self,
        id: i32,
        from: ProxyStatus,
        to: ProxyStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE proxies SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            info!(id = id, from = %from, to = %to, "Proxy status transitioned");
        }

        Ok(applied)
    }

    async fn create(&self, req: &NewProxy) -> Result<Proxy> {
        req.validate()?;
        let host = req.host.trim();

        if self.exists(host, req.port).await? {
            return Err(WardenError::AlreadyExists {
                host: host.to_string(),
                port: req.port,
            });
        }

        let proxy = sqlx::query_as::<_, Proxy>(
            r#"
            INSERT INTO proxies (name, type, host, port, username, password, health_check_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, name, type, host, port, username, password, status,
                      health_check_url, last_health_check, health_check_success,
                      response_time_ms, created_at, updated_at
            "#,
        )
        .bind(&req.name)
        .bind(req.proxy_type.as_str())
        .bind(host)
        .bind(req.port)
        .bind(&req.username)
        .bind(&req.password)
        .bind(&req.health_check_url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            // Lost a race with a concurrent insert of the same host:port.
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                WardenError::AlreadyExists {
                    host: host.to_string(),
                    port: req.port,
                }
            }
            other => WardenError::Database(other),
        })?;

        info!(id = proxy.id, address = %proxy.address(), "Created proxy");
        Ok(proxy)
    }

    async fn delete(&self, id: i32) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM proxies
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM accounts WHERE proxy_id = $1)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "unknown" from "still referenced".
            self.get(id).await?;
            let identities = self.assigned_identities(id).await?;
            warn!(id = id, identities, "Refusing to delete proxy still in use");
            return Err(WardenError::InUse { id, identities });
        }

        info!(id = id, "Deleted proxy");
        Ok(())
    }
}
