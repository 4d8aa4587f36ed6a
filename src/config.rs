//! 配置管理模块
//! 启动时从环境变量读取一次；助记词或冷钱包地址缺失/非法视为致命错误

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

/// 应用配置结构体
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub settlement: SettlementConfig,
    pub quota: QuotaConfig,
    pub pricing: PricingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// 结算核心配置
///
/// 确认阈值与归集阈值属于运营策略，全部可配置，不写死在代码里
#[derive(Clone)]
pub struct SettlementConfig {
    /// BIP39 助记词（仅驻留内存，永不入库、永不打日志）
    pub hd_mnemonic: String,
    /// 归集目标冷钱包地址
    pub cold_wallet_address: String,
    pub rpc_url: String,
    pub chain_id: u64,
    /// 代币合约地址（默认 BSC 上的 Binance-Peg USDT）
    pub token_contract: String,
    pub token_decimals: u32,
    /// 入账所需确认数（防重组）
    pub confirmation_threshold: u64,
    /// 低于该余额的地址不值得花 gas 归集
    pub sweep_threshold: Decimal,
    pub poll_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// 单次扫描的最大区块跨度，防止 eth_getLogs 超限
    pub scan_batch_blocks: u64,
    /// 同一地址归集连续失败达到上限后转人工处理
    pub sweep_max_attempts: i64,
    pub sweep_gas_limit: u64,
}

/// 每日免费额度配置
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub free_tarot_daily: i64,
    pub free_chat_daily: i64,
}

/// 计费价格配置（USDT）
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub tarot_reading: Decimal,
    pub tarot_detail: Decimal,
    pub ai_chat: Decimal,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_decimal_or(key: &str, default: &str) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| default.parse().expect("default decimal literal"))
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/lunacore".into()),
            max_connections: env_or("DB_MAX_CONNS", 16),
            min_connections: env_or("DB_MIN_CONNS", 2),
            acquire_timeout_secs: env_or("DB_ACQ_TIMEOUT_SECS", 5),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
        }
    }
}

impl std::fmt::Debug for SettlementConfig {
    /// 助记词不进任何输出，Debug 也不例外
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementConfig")
            .field("hd_mnemonic", &"<redacted>")
            .field("cold_wallet_address", &self.cold_wallet_address)
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("token_contract", &self.token_contract)
            .field("token_decimals", &self.token_decimals)
            .field("confirmation_threshold", &self.confirmation_threshold)
            .field("sweep_threshold", &self.sweep_threshold)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("scan_batch_blocks", &self.scan_batch_blocks)
            .field("sweep_max_attempts", &self.sweep_max_attempts)
            .field("sweep_gas_limit", &self.sweep_gas_limit)
            .finish()
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            hd_mnemonic: std::env::var("HD_MNEMONIC").unwrap_or_default(),
            cold_wallet_address: std::env::var("COLD_WALLET_ADDRESS").unwrap_or_default(),
            rpc_url: std::env::var("BSC_RPC_URL")
                .unwrap_or_else(|_| "https://bsc-dataseed.binance.org".into()),
            chain_id: env_or("CHAIN_ID", 56),
            token_contract: std::env::var("USDT_CONTRACT")
                .unwrap_or_else(|_| "0x55d398326f99059ff775485246999027b3197955".into()),
            token_decimals: env_or("TOKEN_DECIMALS", 18),
            confirmation_threshold: env_or("CONFIRMATION_THRESHOLD", 12),
            sweep_threshold: env_decimal_or("SWEEP_THRESHOLD", "10"),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 30),
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", 300),
            scan_batch_blocks: env_or("SCAN_BATCH_BLOCKS", 2000),
            sweep_max_attempts: env_or("SWEEP_MAX_ATTEMPTS", 5),
            sweep_gas_limit: env_or("SWEEP_GAS_LIMIT", 100_000),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_tarot_daily: env_or("FREE_TAROT_DAILY", 3),
            free_chat_daily: env_or("FREE_CHAT_DAILY", 10),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tarot_reading: env_decimal_or("PRICE_TAROT_READING", "0.5"),
            tarot_detail: env_decimal_or("PRICE_TAROT_DETAIL", "1"),
            ai_chat: env_decimal_or("PRICE_AI_CHAT", "0.1"),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, SettlementError> {
        let config = Self {
            database: DatabaseConfig::default(),
            settlement: SettlementConfig::default(),
            quota: QuotaConfig::default(),
            pricing: PricingConfig::default(),
        };
        config.settlement.validate()?;
        Ok(config)
    }
}

fn is_hex_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

impl SettlementConfig {
    /// 启动期校验：不合法直接拒绝启动，绝不带病运行
    pub fn validate(&self) -> Result<(), SettlementError> {
        if self.hd_mnemonic.trim().is_empty() {
            return Err(SettlementError::Configuration(
                "HD_MNEMONIC is not set".into(),
            ));
        }
        if !is_hex_address(&self.cold_wallet_address) {
            return Err(SettlementError::Configuration(format!(
                "COLD_WALLET_ADDRESS is not a valid 0x address: {:?}",
                self.cold_wallet_address
            )));
        }
        if !is_hex_address(&self.token_contract) {
            return Err(SettlementError::Configuration(format!(
                "USDT_CONTRACT is not a valid 0x address: {:?}",
                self.token_contract
            )));
        }
        if self.confirmation_threshold == 0 {
            return Err(SettlementError::Configuration(
                "CONFIRMATION_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.sweep_threshold <= Decimal::ZERO {
            return Err(SettlementError::Configuration(
                "SWEEP_THRESHOLD must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl QuotaConfig {
    /// 按功能名查免费额度；未知功能没有免费额度
    pub fn free_allowance(&self, feature: &str) -> i64 {
        match feature {
            "tarot" => self.free_tarot_daily,
            "chat" => self.free_chat_daily,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settlement() -> SettlementConfig {
        SettlementConfig {
            hd_mnemonic: "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about".into(),
            cold_wallet_address: "0x000000000000000000000000000000000000dEaD".into(),
            rpc_url: "http://localhost:8545".into(),
            chain_id: 97,
            token_contract: "0x55d398326f99059ff775485246999027b3197955".into(),
            token_decimals: 18,
            confirmation_threshold: 12,
            sweep_threshold: Decimal::new(10, 0),
            poll_interval_secs: 30,
            sweep_interval_secs: 300,
            scan_batch_blocks: 2000,
            sweep_max_attempts: 5,
            sweep_gas_limit: 100_000,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_settlement().validate().is_ok());
    }

    #[test]
    fn test_missing_mnemonic_is_fatal() {
        let mut cfg = valid_settlement();
        cfg.hd_mnemonic = "  ".into();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, SettlementError::Configuration(_)));
    }

    #[test]
    fn test_bad_cold_wallet_is_fatal() {
        let mut cfg = valid_settlement();
        cfg.cold_wallet_address = "0x1234".into();
        assert!(cfg.validate().is_err());

        cfg.cold_wallet_address = "55d398326f99059ff775485246999027b3197955".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_confirmation_threshold_rejected() {
        let mut cfg = valid_settlement();
        cfg.confirmation_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_free_allowance_lookup() {
        let quota = QuotaConfig {
            free_tarot_daily: 3,
            free_chat_daily: 10,
        };
        assert_eq!(quota.free_allowance("tarot"), 3);
        assert_eq!(quota.free_allowance("chat"), 10);
        assert_eq!(quota.free_allowance("tarot_detail"), 0);
    }
}
