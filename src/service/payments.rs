//! 余额查询与人工补账
//!
//! 余额查询一律读库。人工补账走与链上充值完全相同的订单状态机，
//! 用合成幂等键防止重复补账。

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, SettlementError};
use crate::infrastructure::db::PgPool;
use crate::repository::{balances, orders, BalanceInfo};

/// 人工补账订单的占位地址（不参与扫描与归集）
const MANUAL_ADDRESS: &str = "manual";

#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
}

impl PaymentService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Decimal> {
        Ok(balances::get(&self.pool, user_id).await?)
    }

    pub async fn get_balance_info(&self, user_id: &str) -> Result<BalanceInfo> {
        Ok(balances::get_info(&self.pool, user_id).await?)
    }

    /// 管理员人工补账
    ///
    /// reference 作为幂等键：同一 reference 重复提交时，若上次已入账
    /// 则报 DuplicateDeposit；若上次中途失败则续作完成，不会重复加钱。
    /// 前置条件：amount 为正（由调用侧校验，表上另有 CHECK 兜底）
    pub async fn add_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<Decimal> {
        let tx_hash = match reference {
            Some(r) => format!("manual:{r}"),
            None => format!("manual:{}", Uuid::new_v4()),
        };

        let created =
            orders::record_if_new(&self.pool, &tx_hash, user_id, MANUAL_ADDRESS, amount, 0)
                .await?;

        if !created {
            let existing = orders::get(&self.pool, &tx_hash).await?;
            let resumable = matches!(
                existing.as_ref().map(|o| o.status.as_str()),
                Some("pending") | Some("confirmed")
            );
            if !resumable {
                return Err(SettlementError::DuplicateDeposit(tx_hash));
            }
        }

        orders::mark_confirmed(&self.pool, &tx_hash).await?;
        if orders::credit_once(&self.pool, &tx_hash).await?.is_some() {
            tracing::info!(
                user_id = %user_id,
                reference = %tx_hash,
                amount = %amount,
                "Manual top-up credited"
            );
        }

        self.get_balance(user_id).await
    }
}
