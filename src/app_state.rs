//! 应用状态
//! 持有所有组件共享的资源；余额等可变状态一律在库里，不在这里

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::domain::KeyDeriver;
use crate::infrastructure::db::{self, PgPool};
use crate::service::{
    ChainRpc, DepositMonitor, JsonRpcChainClient, PaymentService, QuotaService, SweepEngine,
    WalletService,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub deriver: Arc<KeyDeriver>,
    pub chain: Arc<dyn ChainRpc>,
}

impl AppState {
    /// 初始化共享资源
    ///
    /// 配置校验、种子解析、数据库连接任何一步失败都终止启动
    pub async fn init(config: Config) -> Result<Self> {
        config.settlement.validate()?;

        let deriver = Arc::new(KeyDeriver::from_mnemonic(&config.settlement.hd_mnemonic)?);

        let pool = db::init_pool(&config.database).await?;
        db::run_migrations(&pool).await?;

        let chain: Arc<dyn ChainRpc> = Arc::new(JsonRpcChainClient::new(
            &config.settlement.rpc_url,
            &config.settlement.token_contract,
            config.settlement.token_decimals,
        ));

        Ok(Self {
            pool,
            config: Arc::new(config),
            deriver,
            chain,
        })
    }

    pub fn wallet_service(&self) -> WalletService {
        WalletService::new(self.pool.clone(), self.deriver.clone())
    }

    pub fn payment_service(&self) -> PaymentService {
        PaymentService::new(self.pool.clone())
    }

    pub fn quota_service(&self) -> QuotaService {
        QuotaService::new(self.pool.clone(), self.config.quota.clone())
    }

    pub fn deposit_monitor(&self) -> DepositMonitor {
        DepositMonitor::new(
            self.pool.clone(),
            self.chain.clone(),
            Arc::new(self.config.settlement.clone()),
        )
    }

    pub fn sweep_engine(&self) -> SweepEngine {
        SweepEngine::new(
            self.pool.clone(),
            self.chain.clone(),
            self.deriver.clone(),
            Arc::new(self.config.settlement.clone()),
        )
    }
}
