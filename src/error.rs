//! 结算核心错误分类
//!
//! 约定：
//! - Configuration 仅在启动阶段出现，出现即终止进程
//! - ChainUnavailable 是瞬态错误，由发起调用的组件就地重试，绝不转化为账变
//! - InsufficientBalance / DuplicateDeposit / SweepInFlight 是预期业务结果，
//!   对调用方表现为拒绝/去重/抑制，而不是系统故障

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    /// 配置缺失或非法（致命，仅启动期）
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 链上 RPC 不可用或响应非法（瞬态，重试后仍失败才会抛出）
    #[error("chain rpc unavailable: {0}")]
    ChainUnavailable(String),

    /// 余额不足（预期业务结果）
    #[error("insufficient balance for user {user_id}")]
    InsufficientBalance { user_id: String },

    /// 重复入账（幂等键已存在）
    #[error("duplicate deposit: {0}")]
    DuplicateDeposit(String),

    /// 该地址已有在途归集交易
    #[error("sweep already in flight for address {0}")]
    SweepInFlight(String),

    /// 密钥派生失败
    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl SettlementError {
    /// 是否为瞬态错误（可在下个周期自然恢复）
    pub fn is_transient(&self) -> bool {
        matches!(self, SettlementError::ChainUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
