//! 每日免费额度计数
//!
//! 按 (user_id, 日期, 功能) 维度计数，自然日切换靠日期键区分，
//! 历史记录不删除。

use chrono::NaiveDate;

use crate::infrastructure::db::PgPool;

/// 尝试消耗一次免费额度
///
/// 计数与上限判断在单条带条件的 upsert 里完成，并发调用不会超发。
/// allowance <= 0 时直接拒绝，不产生计数行。
pub async fn try_consume_free(
    pool: &PgPool,
    user_id: &str,
    date: NaiveDate,
    feature: &str,
    allowance: i64,
) -> Result<bool, sqlx::Error> {
    if allowance <= 0 {
        return Ok(false);
    }

    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO daily_usage (user_id, usage_date, feature, used_count)
        VALUES ($1, $2, $3, 1)
        ON CONFLICT (user_id, usage_date, feature) DO UPDATE
        SET used_count = daily_usage.used_count + 1
        WHERE daily_usage.used_count < $4
        RETURNING used_count
        "#,
    )
    .bind(user_id)
    .bind(date)
    .bind(feature)
    .bind(allowance)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// 今日已用次数
pub async fn used_count(
    pool: &PgPool,
    user_id: &str,
    date: NaiveDate,
    feature: &str,
) -> Result<i64, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT used_count FROM daily_usage
        WHERE user_id = $1 AND usage_date = $2 AND feature = $3
        "#,
    )
    .bind(user_id)
    .bind(date)
    .bind(feature)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(c,)| c).unwrap_or(0))
}
