//! 监控与归集流水线的集成测试（链上访问全部走内存 mock）
//!
//! 覆盖：确认阈值门禁、重复轮询下的精确一次入账、RPC 故障不中断、
//! 归集 single-flight、已广播归集的重启恢复
//!
//! 监控循环会扫描库里的全部钱包，测试间共享数据库时必须串行：
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test monitor_pipeline -- --ignored --test-threads=1
//! ```

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::types::U256;
use lunacore::config::SettlementConfig;
use lunacore::domain::KeyDeriver;
use lunacore::error::{Result, SettlementError};
use lunacore::repository::{balances, orders, sweeps};
use lunacore::service::{
    ChainRpc, DepositMonitor, IncomingTransfer, SweepEngine, WalletService,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use common::{test_pool, unique_user, TEST_MNEMONIC};

/// 可编程的内存链：测试按需摆放转账、确认数和余额
#[derive(Default)]
struct MockChain {
    latest: AtomicU64,
    transfers: Mutex<HashMap<String, Vec<IncomingTransfer>>>,
    confirmations: Mutex<HashMap<String, u64>>,
    balances: Mutex<HashMap<String, U256>>,
    broadcast_count: AtomicU64,
    fail_all: AtomicBool,
}

impl MockChain {
    fn set_latest(&self, block: u64) {
        self.latest.store(block, Ordering::SeqCst);
    }

    fn add_transfer(&self, address: &str, transfer: IncomingTransfer) {
        self.transfers
            .lock()
            .unwrap()
            .entry(address.to_lowercase())
            .or_default()
            .push(transfer);
    }

    fn set_confirmations(&self, tx_hash: &str, confirmations: u64) {
        self.confirmations
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), confirmations);
    }

    fn set_balance(&self, address: &str, amount: U256) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_lowercase(), amount);
    }

    fn check_up(&self) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(SettlementError::ChainUnavailable("mock rpc down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn latest_block(&self) -> Result<u64> {
        self.check_up()?;
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn token_transfers_to(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<IncomingTransfer>> {
        self.check_up()?;
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers
            .get(&address.to_lowercase())
            .map(|list| {
                list.iter()
                    .filter(|t| t.block_number >= from_block && t.block_number <= to_block)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn token_balance(&self, address: &str) -> Result<U256> {
        self.check_up()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or_default())
    }

    async fn transaction_count(&self, _address: &str) -> Result<u64> {
        self.check_up()?;
        Ok(0)
    }

    async fn gas_price(&self) -> Result<u64> {
        self.check_up()?;
        Ok(3_000_000_000)
    }

    async fn broadcast(&self, _raw_tx: &str) -> Result<String> {
        self.check_up()?;
        self.broadcast_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("0xsweep{}", uuid::Uuid::new_v4().simple()))
    }

    async fn confirmations(&self, tx_hash: &str) -> Result<u64> {
        self.check_up()?;
        Ok(self
            .confirmations
            .lock()
            .unwrap()
            .get(tx_hash)
            .copied()
            .unwrap_or(0))
    }
}

fn test_config() -> Arc<SettlementConfig> {
    Arc::new(SettlementConfig {
        hd_mnemonic: TEST_MNEMONIC.into(),
        cold_wallet_address: "0x000000000000000000000000000000000000dEaD".into(),
        rpc_url: "http://mock".into(),
        chain_id: 97,
        token_contract: "0x55d398326f99059ff775485246999027b3197955".into(),
        token_decimals: 18,
        confirmation_threshold: 12,
        sweep_threshold: Decimal::TEN,
        poll_interval_secs: 1,
        sweep_interval_secs: 1,
        scan_batch_blocks: 2000,
        sweep_max_attempts: 5,
        sweep_gas_limit: 100_000,
    })
}

fn deriver() -> Arc<KeyDeriver> {
    Arc::new(KeyDeriver::from_mnemonic(TEST_MNEMONIC).unwrap())
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn deposit_credits_exactly_once_at_threshold() {
    let pool = test_pool().await;
    let chain = Arc::new(MockChain::default());
    let config = test_config();

    let user_id = unique_user("monitor");
    let wallet = WalletService::new(pool.clone(), deriver())
        .get_or_create_wallet(&user_id)
        .await
        .unwrap();

    let tx_hash = format!("0xdep{}", uuid::Uuid::new_v4().simple());
    chain.set_latest(1000);
    chain.add_transfer(
        &wallet.address,
        IncomingTransfer {
            tx_hash: tx_hash.clone(),
            amount: Decimal::TEN,
            block_number: 999,
        },
    );
    // 确认数低于阈值（12 确认要求，只有 2）
    chain.set_confirmations(&tx_hash, 2);

    let (credited_tx, mut credited_rx) = mpsc::channel(16);
    let monitor = DepositMonitor::new(pool.clone(), chain.clone(), config.clone())
        .with_notifications(credited_tx);

    monitor.run_cycle().await.unwrap();

    let order = orders::get(&pool, &tx_hash).await.unwrap().unwrap();
    assert_eq!(order.status, "pending");
    assert_eq!(order.confirmations, 2);
    assert_eq!(balances::get(&pool, &user_id).await.unwrap(), Decimal::ZERO);

    // 确认数达标后入账
    chain.set_confirmations(&tx_hash, 12);
    monitor.run_cycle().await.unwrap();

    let order = orders::get(&pool, &tx_hash).await.unwrap().unwrap();
    assert_eq!(order.status, "credited");
    assert_eq!(balances::get(&pool, &user_id).await.unwrap(), Decimal::TEN);

    let event = credited_rx.try_recv().unwrap();
    assert_eq!(event.user_id, user_id);
    assert_eq!(event.amount, Decimal::TEN);

    // 再跑 5 个周期，余额不再变化
    for _ in 0..5 {
        monitor.run_cycle().await.unwrap();
    }
    assert_eq!(balances::get(&pool, &user_id).await.unwrap(), Decimal::TEN);
    assert!(credited_rx.try_recv().is_err(), "no duplicate credit events");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn rpc_outage_does_not_corrupt_state() {
    let pool = test_pool().await;
    let chain = Arc::new(MockChain::default());
    let config = test_config();

    let user_id = unique_user("outage");
    let wallet = WalletService::new(pool.clone(), deriver())
        .get_or_create_wallet(&user_id)
        .await
        .unwrap();

    let tx_hash = format!("0xout{}", uuid::Uuid::new_v4().simple());
    chain.set_latest(100);
    chain.add_transfer(
        &wallet.address,
        IncomingTransfer {
            tx_hash: tx_hash.clone(),
            amount: Decimal::TEN,
            block_number: 50,
        },
    );
    chain.set_confirmations(&tx_hash, 100);

    let monitor = DepositMonitor::new(pool.clone(), chain.clone(), config.clone());

    // 连续三个周期 RPC 全挂：周期报错但不 panic，余额不变
    chain.fail_all.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(monitor.run_cycle().await.is_err());
    }
    assert_eq!(balances::get(&pool, &user_id).await.unwrap(), Decimal::ZERO);

    // 恢复后下一个周期正常入账
    chain.fail_all.store(false, Ordering::SeqCst);
    monitor.run_cycle().await.unwrap();
    assert_eq!(balances::get(&pool, &user_id).await.unwrap(), Decimal::TEN);
}

/// 准备一个已入账待归集的地址
async fn credited_wallet(
    pool: &lunacore::infrastructure::db::PgPool,
    chain: &MockChain,
    prefix: &str,
) -> lunacore::repository::UserWallet {
    let user_id = unique_user(prefix);
    let wallet = WalletService::new(pool.clone(), deriver())
        .get_or_create_wallet(&user_id)
        .await
        .unwrap();

    let tx_hash = format!("0x{prefix}{}", uuid::Uuid::new_v4().simple());
    orders::record_if_new(pool, &tx_hash, &user_id, &wallet.address, Decimal::TEN, 50)
        .await
        .unwrap();
    orders::mark_confirmed(pool, &tx_hash).await.unwrap();
    orders::credit_once(pool, &tx_hash).await.unwrap();

    // 链上余额 50 个代币，高于归集阈值
    chain.set_balance(
        &wallet.address,
        U256::from(50u64) * U256::exp10(18),
    );
    wallet
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn concurrent_sweep_triggers_broadcast_once() {
    let pool = test_pool().await;
    let chain = Arc::new(MockChain::default());
    let config = test_config();

    let wallet = credited_wallet(&pool, &chain, "sweeprace").await;

    let engine = Arc::new(SweepEngine::new(
        pool.clone(),
        chain.clone(),
        deriver(),
        config.clone(),
    ));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let address = wallet.address.clone();
        handles.push(tokio::spawn(async move {
            engine.sweep_address(&address).await
        }));
    }

    let mut broadcasts = 0;
    let mut suppressed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Some(_)) => broadcasts += 1,
            Err(SettlementError::SweepInFlight(_)) => suppressed += 1,
            other => panic!("unexpected sweep outcome: {other:?}"),
        }
    }

    assert_eq!(broadcasts, 1, "exactly one sweep may broadcast");
    assert_eq!(suppressed, 1, "the loser must be suppressed");
    assert_eq!(chain.broadcast_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn broadcast_sweep_resumes_without_rebroadcast() {
    let pool = test_pool().await;
    let chain = Arc::new(MockChain::default());
    let config = test_config();

    let wallet = credited_wallet(&pool, &chain, "sweepresume").await;

    let engine = SweepEngine::new(pool.clone(), chain.clone(), deriver(), config.clone());
    let tx_hash = engine.sweep_address(&wallet.address).await.unwrap().unwrap();
    assert_eq!(chain.broadcast_count.load(Ordering::SeqCst), 1);

    // “重启”后的新引擎实例：确认数不足时只等待，不重新广播
    let engine2 = SweepEngine::new(pool.clone(), chain.clone(), deriver(), config.clone());
    chain.set_confirmations(&tx_hash, 3);
    engine2.run_cycle().await.unwrap();
    assert_eq!(chain.broadcast_count.load(Ordering::SeqCst), 1);

    let active = sweeps::list_broadcast(&pool).await.unwrap();
    assert!(active.iter().any(|s| s.address == wallet.address));

    // 确认数达标后收尾：sweep 确认、订单转 swept
    chain.set_confirmations(&tx_hash, 12);
    engine2.run_cycle().await.unwrap();
    assert_eq!(chain.broadcast_count.load(Ordering::SeqCst), 1);

    let active = sweeps::list_broadcast(&pool).await.unwrap();
    assert!(!active.iter().any(|s| s.address == wallet.address));

    let remaining = orders::addresses_with_credited(&pool).await.unwrap();
    assert!(!remaining.contains(&wallet.address));
}
