//! LunaCore - 托管充值结算核心
//!
//! 按用户派生 HD 充值地址，轮询链上入账并精确一次记账，
//! 自动把已入账资金归集到冷钱包；附带每日免费额度与余额扣费裁决。
//! 上层（机器人/命令层）只消费 balance / quota / wallet 三组接口。

pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod repository;
pub mod service;

pub use app_state::AppState;
pub use error::{Result, SettlementError};

pub mod prelude {
    pub use crate::{
        app_state::AppState,
        config::Config,
        error::{Result, SettlementError},
        service::{Outcome, PaymentService, QuotaService, WalletService},
    };
}
