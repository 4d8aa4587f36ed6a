pub mod chain_client;
pub mod deposit_monitor;
pub mod payments;
pub mod quota;
pub mod sweep_engine;
pub mod wallet_service;

pub use chain_client::{ChainRpc, IncomingTransfer, JsonRpcChainClient};
pub use deposit_monitor::{DepositCredited, DepositMonitor};
pub use payments::PaymentService;
pub use quota::{DailySummary, Outcome, QuotaService};
pub use sweep_engine::SweepEngine;
pub use wallet_service::WalletService;
