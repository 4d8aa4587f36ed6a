//! 用户钱包分配服务
//!
//! 首次请求充值时为用户分配派生索引并落库。索引分配的临界区由
//! derivation_index 唯一约束收口：并发抢到同一候选值时只有一个
//! 事务能提交，落败方重试拿下一个值。

use std::sync::Arc;

use crate::domain::KeyDeriver;
use crate::error::{Result, SettlementError};
use crate::infrastructure::db::PgPool;
use crate::repository::{is_unique_violation, wallets, UserWallet};

/// 索引分配冲突重试上限
const MAX_ALLOC_RETRIES: u32 = 8;

#[derive(Clone)]
pub struct WalletService {
    pool: PgPool,
    deriver: Arc<KeyDeriver>,
}

impl WalletService {
    pub fn new(pool: PgPool, deriver: Arc<KeyDeriver>) -> Self {
        Self { pool, deriver }
    }

    /// 查询或创建用户钱包
    ///
    /// 同一 user_id 并发调用 N 次也只会创建一条记录、占用一个派生
    /// 索引；不同用户之间的索引竞争通过唯一约束 + 重试解决
    pub async fn get_or_create_wallet(&self, user_id: &str) -> Result<UserWallet> {
        if let Some(wallet) = wallets::get(&self.pool, user_id).await? {
            return Ok(wallet);
        }

        for _ in 0..MAX_ALLOC_RETRIES {
            let index = wallets::next_derivation_index(&self.pool).await?;
            let address = self.deriver.derive_address(index as u32)?;

            match wallets::try_insert(&self.pool, user_id, index, &address).await {
                Ok(Some(wallet)) => {
                    tracing::info!(
                        user_id = %user_id,
                        derivation_index = index,
                        address = %address,
                        "Deposit wallet created"
                    );
                    return Ok(wallet);
                }
                // user_id 撞了：另一个并发请求已经建好，直接用它的
                Ok(None) => {
                    if let Some(wallet) = wallets::get(&self.pool, user_id).await? {
                        return Ok(wallet);
                    }
                }
                // 派生索引撞了：换下一个候选值重试
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(SettlementError::Storage(sqlx::Error::Protocol(
            "derivation index allocation kept conflicting".into(),
        )))
    }

    /// 用户充值地址（没有则创建）
    pub async fn deposit_address(&self, user_id: &str) -> Result<String> {
        Ok(self.get_or_create_wallet(user_id).await?.address)
    }
}
