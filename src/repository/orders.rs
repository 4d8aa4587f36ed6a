//! 充值订单表：tx_hash 主键即幂等键
//!
//! 轮询天然会重复看到同一笔转账（至少一次投递），所以精确一次入账
//! 由这里的唯一约束 + 条件状态更新保证，而不是由监控循环自己记忆。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

use crate::infrastructure::db::PgPool;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RechargeOrder {
    pub tx_hash: String,
    pub user_id: String,
    pub address: String,
    pub amount: Decimal,
    pub block_number: i64,
    pub confirmations: i64,
    pub status: String,
    pub detected_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

const ORDER_COLUMNS: &str =
    "tx_hash, user_id, address, amount, block_number, confirmations, status, detected_at, credited_at";

/// 首次看到的转账才会创建订单；重复轮询到同一笔返回 false
pub async fn record_if_new(
    pool: &PgPool,
    tx_hash: &str,
    user_id: &str,
    address: &str,
    amount: Decimal,
    block_number: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO recharge_orders (tx_hash, user_id, address, amount, block_number, status)
        VALUES ($1, $2, $3, $4, $5, 'pending')
        ON CONFLICT (tx_hash) DO NOTHING
        "#,
    )
    .bind(tx_hash)
    .bind(user_id)
    .bind(address)
    .bind(amount)
    .bind(block_number)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get(pool: &PgPool, tx_hash: &str) -> Result<Option<RechargeOrder>, sqlx::Error> {
    sqlx::query_as::<_, RechargeOrder>(&format!(
        "SELECT {ORDER_COLUMNS} FROM recharge_orders WHERE tx_hash = $1"
    ))
    .bind(tx_hash)
    .fetch_optional(pool)
    .await
}

/// 未完结订单（待确认或待入账）
pub async fn list_unsettled(pool: &PgPool) -> Result<Vec<RechargeOrder>, sqlx::Error> {
    sqlx::query_as::<_, RechargeOrder>(&format!(
        r#"
        SELECT {ORDER_COLUMNS} FROM recharge_orders
        WHERE status IN ('pending', 'confirmed')
        ORDER BY detected_at
        "#
    ))
    .fetch_all(pool)
    .await
}

pub async fn set_confirmations(
    pool: &PgPool,
    tx_hash: &str,
    confirmations: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE recharge_orders SET confirmations = $2 WHERE tx_hash = $1")
        .bind(tx_hash)
        .bind(confirmations)
        .execute(pool)
        .await?;
    Ok(())
}

/// pending -> confirmed（条件更新，重复调用无副作用）
pub async fn mark_confirmed(pool: &PgPool, tx_hash: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE recharge_orders SET status = 'confirmed' WHERE tx_hash = $1 AND status = 'pending'",
    )
    .bind(tx_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// confirmed -> credited 与余额累加在同一事务内完成
///
/// 返回本次实际入账的 (user_id, amount)；订单已入账过则返回 None，
/// 监控循环重复调用是安全的
pub async fn credit_once(
    pool: &PgPool,
    tx_hash: &str,
) -> Result<Option<(String, Decimal)>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let credited: Option<(String, Decimal)> = sqlx::query_as(
        r#"
        UPDATE recharge_orders
        SET status = 'credited', credited_at = CURRENT_TIMESTAMP
        WHERE tx_hash = $1 AND status = 'confirmed'
        RETURNING user_id, amount
        "#,
    )
    .bind(tx_hash)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((user_id, amount)) = credited else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        r#"
        INSERT INTO balances (user_id, balance, total_recharged)
        VALUES ($1, $2, $2)
        ON CONFLICT (user_id) DO UPDATE
        SET balance = balances.balance + EXCLUDED.balance,
            total_recharged = balances.total_recharged + EXCLUDED.balance,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&user_id)
    .bind(amount)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some((user_id, amount)))
}

/// 归集确认后把该地址所有已入账订单标记为 swept
pub async fn mark_swept_by_address<'e, E>(executor: E, address: &str) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        "UPDATE recharge_orders SET status = 'swept' WHERE address = $1 AND status = 'credited'",
    )
    .bind(address)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// 有已入账未归集订单的充值地址（只看真实链上地址）
pub async fn addresses_with_credited(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT o.address
        FROM recharge_orders o
        JOIN user_wallets w ON w.address = o.address
        WHERE o.status = 'credited'
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(a,)| a).collect())
}
