//! 用户钱包表：user_id 与派生索引一一对应，派生索引只增不复用

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::infrastructure::db::PgPool;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserWallet {
    pub user_id: String,
    pub derivation_index: i64,
    pub address: String,
    /// 该地址的扫描游标（已完整处理到的区块高度）
    pub last_scanned_block: i64,
    pub created_at: DateTime<Utc>,
}

pub async fn get(pool: &PgPool, user_id: &str) -> Result<Option<UserWallet>, sqlx::Error> {
    sqlx::query_as::<_, UserWallet>(
        r#"
        SELECT user_id, derivation_index, address, last_scanned_block, created_at
        FROM user_wallets
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_address(pool: &PgPool, address: &str) -> Result<Option<UserWallet>, sqlx::Error> {
    sqlx::query_as::<_, UserWallet>(
        r#"
        SELECT user_id, derivation_index, address, last_scanned_block, created_at
        FROM user_wallets
        WHERE address = $1
        "#,
    )
    .bind(address)
    .fetch_optional(pool)
    .await
}

/// 下一个未使用的派生索引
///
/// 并发分配依赖 derivation_index 的唯一约束兜底：两个事务读到同一个
/// 候选值时只有一个能插入成功，另一个收到 23505 后重试
pub async fn next_derivation_index(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(derivation_index) + 1, 0) FROM user_wallets",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// 插入新钱包；user_id 已存在时返回 None（由调用方改查现有记录）
pub async fn try_insert(
    pool: &PgPool,
    user_id: &str,
    derivation_index: i64,
    address: &str,
) -> Result<Option<UserWallet>, sqlx::Error> {
    sqlx::query_as::<_, UserWallet>(
        r#"
        INSERT INTO user_wallets (user_id, derivation_index, address)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id) DO NOTHING
        RETURNING user_id, derivation_index, address, last_scanned_block, created_at
        "#,
    )
    .bind(user_id)
    .bind(derivation_index)
    .bind(address)
    .fetch_optional(pool)
    .await
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<UserWallet>, sqlx::Error> {
    sqlx::query_as::<_, UserWallet>(
        r#"
        SELECT user_id, derivation_index, address, last_scanned_block, created_at
        FROM user_wallets
        ORDER BY derivation_index
        "#,
    )
    .fetch_all(pool)
    .await
}

/// 推进扫描游标（只前进）
pub async fn advance_checkpoint(
    pool: &PgPool,
    user_id: &str,
    block: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE user_wallets
        SET last_scanned_block = $2
        WHERE user_id = $1 AND last_scanned_block < $2
        "#,
    )
    .bind(user_id)
    .bind(block)
    .execute(pool)
    .await?;
    Ok(())
}
