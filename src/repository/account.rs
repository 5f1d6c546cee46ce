use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use super::IdentityStore;
use crate::error::{Result, WardenError};

/// Reads and writes the `accounts.proxy_id` pointer
#[derive(Clone)]
pub struct AccountRepository {
    pool: PgPool,
}

impl AccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for AccountRepository {
    async fn assignment_counts(&self) -> Result<HashMap<i32, i64>> {
        let rows = sqlx::query_as::<_, (i32, i64)>(
            r#"
            SELECT proxy_id, COUNT(*)
            FROM accounts
            WHERE proxy_id IS NOT NULL
            GROUP BY proxy_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn set_proxy(&self, identity_id: i32, proxy_id: Option<i32>) -> Result<()> {
        let result =
            sqlx::query("UPDATE accounts SET proxy_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(proxy_id)
                .bind(identity_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(WardenError::IdentityNotFound { id: identity_id });
        }

        info!(identity_id, proxy_id = ?proxy_id, "Updated identity proxy pointer");
        Ok(())
    }

    async fn proxy_of(&self, identity_id: i32) -> Result<Option<i32>> {
        let row = sqlx::query_scalar::<_, Option<i32>>("SELECT proxy_id FROM accounts WHERE id = $1")
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(WardenError::IdentityNotFound { id: identity_id })
    }
}
