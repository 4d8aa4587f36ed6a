//! 归集服务
//!
//! 慢周期运行（归集要花真实 gas）：把确认入账后的用户地址余额转移到
//! 冷钱包。同一地址的并发归集被 sweeps 表的部分唯一索引抑制；已广播
//! 未确认的归集重启后原样恢复、只查确认数，绝不重新签名或重播。
//! 归集失败不影响用户余额，入账在监控侧早已完成。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::config::SettlementConfig;
use crate::domain::tx_build::{self, TransferTx};
use crate::domain::KeyDeriver;
use crate::error::{Result, SettlementError};
use crate::infrastructure::db::PgPool;
use crate::repository::{orders, sweeps, wallets};
use crate::service::chain_client::{base_units_to_decimal, ChainRpc};

/// signing 状态残留超过该时长视为进程中断遗留
const STALE_SIGNING_SECS: i64 = 600;

pub struct SweepEngine {
    pool: PgPool,
    chain: Arc<dyn ChainRpc>,
    deriver: Arc<KeyDeriver>,
    config: Arc<SettlementConfig>,
}

impl SweepEngine {
    pub fn new(
        pool: PgPool,
        chain: Arc<dyn ChainRpc>,
        deriver: Arc<KeyDeriver>,
        config: Arc<SettlementConfig>,
    ) -> Self {
        Self {
            pool,
            chain,
            deriver,
            config,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs));

        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            threshold = %self.config.sweep_threshold,
            cold_wallet = %self.config.cold_wallet_address,
            "Sweep engine started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::warn!(error = %e, "Sweep cycle failed, will retry next tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Sweep engine stopping");
                        break;
                    }
                }
            }
        }
    }

    /// 一个归集周期：先收尾在途交易，再发起新归集
    pub async fn run_cycle(&self) -> Result<()> {
        let stale = sweeps::fail_stale_signing(&self.pool, STALE_SIGNING_SECS).await?;
        if stale > 0 {
            tracing::error!(
                count = stale,
                "Stale signing sweeps marked failed, operator review required"
            );
        }

        self.confirm_broadcast_sweeps().await?;
        self.initiate_sweeps().await?;
        Ok(())
    }

    /// 在途归集确认收尾（含重启恢复）
    async fn confirm_broadcast_sweeps(&self) -> Result<()> {
        for sweep in sweeps::list_broadcast(&self.pool).await? {
            let Some(tx_hash) = sweep.tx_hash.as_deref() else {
                continue;
            };

            let confirmations = match self.chain.confirmations(tx_hash).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(tx_hash = %tx_hash, error = %e, "Sweep confirmation check failed");
                    continue;
                }
            };

            if confirmations >= self.config.confirmation_threshold {
                let swept = sweeps::finalize(&self.pool, sweep.id, &sweep.address).await?;
                tracing::info!(
                    address = %sweep.address,
                    tx_hash = %tx_hash,
                    amount = %sweep.amount,
                    orders_swept = swept,
                    "Sweep confirmed"
                );
            }
        }
        Ok(())
    }

    /// 为所有待归集地址发起归集
    async fn initiate_sweeps(&self) -> Result<()> {
        for address in orders::addresses_with_credited(&self.pool).await? {
            match self.sweep_address(&address).await {
                Ok(Some(tx_hash)) => {
                    tracing::info!(address = %address, tx_hash = %tx_hash, "Sweep broadcast");
                }
                Ok(None) => {}
                Err(SettlementError::SweepInFlight(_)) => {}
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "Sweep attempt failed");
                }
            }
        }
        Ok(())
    }

    /// 归集单个地址；余额低于阈值或无需动作时返回 None
    ///
    /// 地址已有在途归集时返回 SweepInFlight（并发触发被抑制，
    /// 不是故障）
    pub async fn sweep_address(&self, address: &str) -> Result<Option<String>> {
        let failures = sweeps::failure_count(&self.pool, address).await?;
        if failures >= self.config.sweep_max_attempts {
            tracing::error!(
                address = %address,
                failures = failures,
                "Sweep retry limit reached, manual intervention required"
            );
            return Ok(None);
        }

        let wallet = wallets::get_by_address(&self.pool, address)
            .await?
            .ok_or_else(|| SettlementError::Configuration(format!("unknown sweep address {address}")))?;

        let balance_raw = self.chain.token_balance(address).await?;
        let balance = base_units_to_decimal(balance_raw, self.config.token_decimals)?;
        if balance < self.config.sweep_threshold {
            return Ok(None);
        }

        // single-flight：插不进去说明已有在途归集
        let Some(sweep) = sweeps::create_if_idle(
            &self.pool,
            address,
            &self.config.cold_wallet_address,
            balance,
        )
        .await?
        else {
            return Err(SettlementError::SweepInFlight(address.to_string()));
        };

        match self.sign_and_broadcast(&wallet, balance_raw).await {
            Ok(tx_hash) => {
                sweeps::mark_broadcast(&self.pool, sweep.id, &tx_hash).await?;
                Ok(Some(tx_hash))
            }
            Err(e) => {
                // 失败留痕，不影响用户余额；下个周期会重新尝试，
                // 连续失败达到上限后转人工
                sweeps::mark_failed(&self.pool, sweep.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// 构造、签名并广播整额转出交易
    ///
    /// 签名密钥只在闭包内存在，签完即随派生结果销毁
    async fn sign_and_broadcast(
        &self,
        wallet: &wallets::UserWallet,
        amount_raw: ethers::types::U256,
    ) -> Result<String> {
        let nonce = self.chain.transaction_count(&wallet.address).await?;
        let gas_price = self.chain.gas_price().await?;

        let data = tx_build::erc20_transfer_data(&self.config.cold_wallet_address, amount_raw)
            .map_err(|e| SettlementError::Derivation(e.to_string()))?;

        let tx = TransferTx {
            nonce,
            gas_price,
            gas_limit: self.config.sweep_gas_limit,
            to: self.config.token_contract.clone(),
            data,
            chain_id: self.config.chain_id,
        };

        let raw_tx = self
            .deriver
            .with_signing_key(wallet.derivation_index as u32, |key| {
                tx_build::sign_transfer(key, &tx)
                    .map_err(|e| SettlementError::Derivation(e.to_string()))
            })?;

        self.chain.broadcast(&raw_tx).await
    }
}
