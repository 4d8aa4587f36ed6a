//! 额度与计费裁决
//!
//! 裁决顺序固定：先耗免费额度，再扣余额，两者都没有才拒绝。
//! 这保证免费额度总是先于余额被用掉，也保证任何放行都有额度或
//! 余额背书。

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::QuotaConfig;
use crate::error::Result;
use crate::infrastructure::db::PgPool;
use crate::repository::{balances, usage};

/// 裁决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// 免费额度内放行
    AllowedFree,
    /// 扣费放行
    AllowedPaid,
    /// 额度用尽且余额不足
    Denied,
}

/// 今日额度概览（/balance 展示用）
#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub tarot_free_remaining: i64,
    pub chat_free_remaining: i64,
}

#[derive(Clone)]
pub struct QuotaService {
    pool: PgPool,
    quota: QuotaConfig,
}

impl QuotaService {
    pub fn new(pool: PgPool, quota: QuotaConfig) -> Self {
        Self { pool, quota }
    }

    /// 裁决一次功能使用
    ///
    /// 余额不足表现为 Denied，是预期业务结果而不是错误
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        feature: &str,
        cost: Decimal,
    ) -> Result<Outcome> {
        let today = Utc::now().date_naive();
        let allowance = self.quota.free_allowance(feature);

        if usage::try_consume_free(&self.pool, user_id, today, feature, allowance).await? {
            return Ok(Outcome::AllowedFree);
        }

        // 没有定价的功能不扣费
        if cost <= Decimal::ZERO {
            return Ok(Outcome::AllowedFree);
        }

        match balances::debit(&self.pool, user_id, cost, feature).await? {
            Some(new_balance) => {
                tracing::info!(
                    user_id = %user_id,
                    feature = feature,
                    cost = %cost,
                    balance = %new_balance,
                    "Paid usage debited"
                );
                Ok(Outcome::AllowedPaid)
            }
            None => Ok(Outcome::Denied),
        }
    }

    pub async fn daily_summary(&self, user_id: &str) -> Result<DailySummary> {
        let today = Utc::now().date_naive();

        let tarot_used = usage::used_count(&self.pool, user_id, today, "tarot").await?;
        let chat_used = usage::used_count(&self.pool, user_id, today, "chat").await?;

        Ok(DailySummary {
            date: today,
            tarot_free_remaining: (self.quota.free_tarot_daily - tarot_used).max(0),
            chat_free_remaining: (self.quota.free_chat_daily - chat_used).max(0),
        })
    }
}
