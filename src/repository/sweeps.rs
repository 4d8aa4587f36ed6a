//! 归集记录表
//!
//! 部分唯一索引保证同一地址同时只有一笔在途归集（signing/broadcast），
//! 这是跨进程实例也成立的 single-flight 约束。已广播未确认的记录在
//! 重启后原样恢复，绝不重新签名重播。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::infrastructure::db::PgPool;
use crate::repository::orders;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Sweep {
    pub id: Uuid,
    pub address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SWEEP_COLUMNS: &str =
    "id, address, to_address, amount, tx_hash, status, last_error, created_at, updated_at";

/// 创建归集记录；该地址已有在途归集时返回 None（抑制并发触发）
pub async fn create_if_idle(
    pool: &PgPool,
    address: &str,
    to_address: &str,
    amount: Decimal,
) -> Result<Option<Sweep>, sqlx::Error> {
    sqlx::query_as::<_, Sweep>(&format!(
        r#"
        INSERT INTO sweeps (address, to_address, amount, status)
        VALUES ($1, $2, $3, 'signing')
        ON CONFLICT (address) WHERE status IN ('signing', 'broadcast') DO NOTHING
        RETURNING {SWEEP_COLUMNS}
        "#
    ))
    .bind(address)
    .bind(to_address)
    .bind(amount)
    .fetch_optional(pool)
    .await
}

/// signing -> broadcast，记录链上交易哈希
pub async fn mark_broadcast(pool: &PgPool, id: Uuid, tx_hash: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sweeps
        SET status = 'broadcast', tx_hash = $2, updated_at = CURRENT_TIMESTAMP
        WHERE id = $1 AND status = 'signing'
        "#,
    )
    .bind(id)
    .bind(tx_hash)
    .execute(pool)
    .await?;
    Ok(())
}

/// 归集确认：sweep 转 confirmed，同一事务里把地址下的入账订单标记 swept
pub async fn finalize(pool: &PgPool, id: Uuid, address: &str) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE sweeps
        SET status = 'confirmed', updated_at = CURRENT_TIMESTAMP
        WHERE id = $1 AND status = 'broadcast'
        "#,
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;

    let swept = orders::mark_swept_by_address(&mut *tx, address).await?;

    tx.commit().await?;
    Ok(swept)
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sweeps
        SET status = 'failed', last_error = $2, updated_at = CURRENT_TIMESTAMP
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// 已广播待确认的归集（重启恢复的入口）
pub async fn list_broadcast(pool: &PgPool) -> Result<Vec<Sweep>, sqlx::Error> {
    sqlx::query_as::<_, Sweep>(&format!(
        "SELECT {SWEEP_COLUMNS} FROM sweeps WHERE status = 'broadcast' ORDER BY created_at"
    ))
    .fetch_all(pool)
    .await
}

/// 清理卡死的 signing 记录（签名阶段崩溃残留，从未广播成功）
///
/// 这类记录无法安全续作，只能转 failed 交人工核对
pub async fn fail_stale_signing(pool: &PgPool, older_than_secs: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sweeps
        SET status = 'failed',
            last_error = 'stale signing record (process restarted mid-sweep)',
            updated_at = CURRENT_TIMESTAMP
        WHERE status = 'signing'
          AND created_at < CURRENT_TIMESTAMP - ($1 * INTERVAL '1 second')
        "#,
    )
    .bind(older_than_secs)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// 该地址历史失败次数（达到上限后不再自动重试）
pub async fn failure_count(pool: &PgPool, address: &str) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM sweeps WHERE address = $1 AND status = 'failed'")
            .bind(address)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}
