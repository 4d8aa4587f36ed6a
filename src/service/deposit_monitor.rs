//! 入账监控服务
//!
//! 周期性扫描所有用户充值地址：发现新转账建单（幂等），确认数达标后
//! 入账。扫描游标持久化在 user_wallets 上，重启后从游标继续。投递是
//! 至少一次，精确一次入账由账本层的唯一约束保证，这里不做内存去重。

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

use crate::config::SettlementConfig;
use crate::error::Result;
use crate::infrastructure::db::PgPool;
use crate::repository::{orders, wallets};
use crate::service::chain_client::ChainRpc;

/// 入账完成事件，供上层（机器人）通知用户
#[derive(Debug, Clone)]
pub struct DepositCredited {
    pub user_id: String,
    pub tx_hash: String,
    pub amount: Decimal,
}

pub struct DepositMonitor {
    pool: PgPool,
    chain: Arc<dyn ChainRpc>,
    config: Arc<SettlementConfig>,
    /// 入账事件通道；接收端关闭时事件直接丢弃
    credited_tx: Option<mpsc::Sender<DepositCredited>>,
}

impl DepositMonitor {
    pub fn new(pool: PgPool, chain: Arc<dyn ChainRpc>, config: Arc<SettlementConfig>) -> Self {
        Self {
            pool,
            chain,
            config,
            credited_tx: None,
        }
    }

    pub fn with_notifications(mut self, tx: mpsc::Sender<DepositCredited>) -> Self {
        self.credited_tx = Some(tx);
        self
    }

    /// 后台轮询主循环
    ///
    /// 单个周期失败只记日志，下个周期重来；收到停机信号后跑完当前
    /// 周期再退出，游标已落库，重启后继续
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));

        tracing::info!(
            interval_secs = self.config.poll_interval_secs,
            confirmation_threshold = self.config.confirmation_threshold,
            "Deposit monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::warn!(error = %e, "Deposit poll cycle failed, will retry next tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Deposit monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// 一个完整轮询周期：扫描新转账 + 推进未完结订单
    pub async fn run_cycle(&self) -> Result<()> {
        let latest = self.chain.latest_block().await?;

        let wallet_list = wallets::list_all(&self.pool).await?;
        for wallet in &wallet_list {
            // 单个地址失败不拖垮整个周期
            if let Err(e) = self.scan_address(wallet, latest).await {
                tracing::warn!(
                    address = %wallet.address,
                    error = %e,
                    "Address scan failed, checkpoint not advanced"
                );
            }
        }

        self.settle_open_orders().await?;
        Ok(())
    }

    /// 扫描单个地址的新转账并建单
    ///
    /// 游标只在整段区块处理完后才推进；建单失败时游标停在原处，
    /// 下个周期重扫（重复建单被 tx_hash 幂等键挡住）
    async fn scan_address(&self, wallet: &wallets::UserWallet, latest: u64) -> Result<()> {
        let from = (wallet.last_scanned_block as u64).saturating_add(1);
        if from > latest {
            return Ok(());
        }
        let to = latest.min(from + self.config.scan_batch_blocks - 1);

        let transfers = self
            .chain
            .token_transfers_to(&wallet.address, from, to)
            .await?;

        for transfer in transfers {
            if transfer.amount <= Decimal::ZERO {
                continue;
            }
            let created = orders::record_if_new(
                &self.pool,
                &transfer.tx_hash,
                &wallet.user_id,
                &wallet.address,
                transfer.amount,
                transfer.block_number as i64,
            )
            .await?;

            if created {
                tracing::info!(
                    user_id = %wallet.user_id,
                    tx_hash = %transfer.tx_hash,
                    amount = %transfer.amount,
                    block = transfer.block_number,
                    "New deposit detected"
                );
            }
        }

        wallets::advance_checkpoint(&self.pool, &wallet.user_id, to as i64).await?;
        Ok(())
    }

    /// 刷新未完结订单的确认数，达标的依次 confirm、credit
    async fn settle_open_orders(&self) -> Result<()> {
        let open_orders = orders::list_unsettled(&self.pool).await?;

        for order in open_orders {
            let confirmations = match self.chain.confirmations(&order.tx_hash).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        tx_hash = %order.tx_hash,
                        error = %e,
                        "Confirmation check failed, order left as-is"
                    );
                    continue;
                }
            };

            orders::set_confirmations(&self.pool, &order.tx_hash, confirmations as i64).await?;

            // 阈值以下绝不入账，防链重组
            if confirmations < self.config.confirmation_threshold {
                continue;
            }

            orders::mark_confirmed(&self.pool, &order.tx_hash).await?;

            if let Some((user_id, amount)) =
                orders::credit_once(&self.pool, &order.tx_hash).await?
            {
                tracing::info!(
                    user_id = %user_id,
                    tx_hash = %order.tx_hash,
                    amount = %amount,
                    "Deposit credited"
                );
                if let Some(tx) = &self.credited_tx {
                    let _ = tx
                        .send(DepositCredited {
                            user_id,
                            tx_hash: order.tx_hash.clone(),
                            amount,
                        })
                        .await;
                }
            }
        }

        Ok(())
    }
}
