//! 余额表与消费流水
//!
//! 余额只通过 credit_once / debit 两条事务路径变动，任何组件都不缓存
//! 余额副本，查询一律落库，避免读到过期值后双花。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::infrastructure::db::PgPool;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BalanceInfo {
    pub balance: Decimal,
    pub total_recharged: Decimal,
    pub total_spent: Decimal,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SpendRecord {
    pub id: Uuid,
    pub user_id: String,
    pub amount: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

pub async fn get(pool: &PgPool, user_id: &str) -> Result<Decimal, sqlx::Error> {
    let row: Option<(Decimal,)> =
        sqlx::query_as("SELECT balance FROM balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(b,)| b).unwrap_or(Decimal::ZERO))
}

pub async fn get_info(pool: &PgPool, user_id: &str) -> Result<BalanceInfo, sqlx::Error> {
    let info: Option<BalanceInfo> = sqlx::query_as(
        "SELECT balance, total_recharged, total_spent FROM balances WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(info.unwrap_or(BalanceInfo {
        balance: Decimal::ZERO,
        total_recharged: Decimal::ZERO,
        total_spent: Decimal::ZERO,
    }))
}

/// 扣费：余额校验、扣减、流水三步在同一事务内
///
/// 余额不足返回 None，不产生任何账变；成功返回扣费后余额
pub async fn debit(
    pool: &PgPool,
    user_id: &str,
    amount: Decimal,
    reason: &str,
) -> Result<Option<Decimal>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated: Option<(Decimal,)> = sqlx::query_as(
        r#"
        UPDATE balances
        SET balance = balance - $2,
            total_spent = total_spent + $2,
            updated_at = CURRENT_TIMESTAMP
        WHERE user_id = $1 AND balance >= $2
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((new_balance,)) = updated else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query("INSERT INTO spend_records (user_id, amount, reason) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(new_balance))
}

/// 消费流水（审计用，倒序）
pub async fn list_spend_records(
    pool: &PgPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<SpendRecord>, sqlx::Error> {
    sqlx::query_as::<_, SpendRecord>(
        r#"
        SELECT id, user_id, amount, reason, created_at
        FROM spend_records
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}
