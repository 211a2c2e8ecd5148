// src/audit.rs - Audit trail of account and soil-test activity

use sqlx::SqlitePool;
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};
use actix_web::HttpRequest;

pub const RETENTION_DAYS: i64 = 90;
const PRUNE_CHUNK: i64 = 1000;

/// Request metadata kept with an audit entry.
#[derive(Debug, Default, Clone)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    pub fn from_request(req: &HttpRequest) -> Self {
        Self {
            ip_address: req
                .connection_info()
                .realip_remote_addr()
                .map(|s| s.to_string()),
            user_agent: req
                .headers()
                .get("User-Agent")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string()),
        }
    }
}

pub async fn log_activity(
    pool: &SqlitePool,
    user_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    description: Option<&str>,
    meta: &RequestMeta,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO audit_logs
           (id, user_id, action, entity_type, entity_id, description, ip_address, user_agent, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(description)
    .bind(&meta.ip_address)
    .bind(&meta.user_agent)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fire-and-forget form used by handlers; failures are only logged.
pub async fn audit(
    pool: &SqlitePool,
    user_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    description: &str,
    request: &HttpRequest,
) {
    let meta = RequestMeta::from_request(request);
    if let Err(e) = log_activity(
        pool,
        Some(user_id),
        action,
        entity_type,
        Some(entity_id),
        Some(description),
        &meta,
    ).await {
        log::error!("Failed to write audit log: {}", e);
    }
}

/// Deletes entries older than `cutoff` in chunks. Returns the number removed.
pub async fn prune_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let mut total_deleted = 0;
    loop {
        let result = sqlx::query(
            "DELETE FROM audit_logs
             WHERE id IN (
                 SELECT id FROM audit_logs WHERE created_at < ? LIMIT ?
             )"
        )
        .bind(cutoff)
        .bind(PRUNE_CHUNK)
        .execute(pool)
        .await?;

        let count = result.rows_affected();
        total_deleted += count;
        if count < PRUNE_CHUNK as u64 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Ok(total_deleted)
}

pub fn retention_cutoff() -> DateTime<Utc> {
    Utc::now() - Duration::days(RETENTION_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[actix_rt::test]
    async fn test_log_and_prune() {
        let pool = test_pool().await;
        let meta = RequestMeta {
            ip_address: Some("10.0.0.1".into()),
            user_agent: None,
        };

        log_activity(&pool, Some("u1"), "sign_in", "user", Some("u1"), None, &meta).await.unwrap();
        sqlx::query(
            "INSERT INTO audit_logs (id, action, entity_type, created_at) VALUES ('old', 'sign_up', 'user', ?)"
        )
        .bind(Utc::now() - Duration::days(RETENTION_DAYS + 1))
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(prune_before(&pool, retention_cutoff()).await.unwrap(), 1);

        let remaining: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT action, ip_address FROM audit_logs")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(remaining, vec![("sign_in".to_string(), Some("10.0.0.1".to_string()))]);
    }
}
