pub mod balances;
pub mod orders;
pub mod sweeps;
pub mod usage;
pub mod wallets;

pub use balances::BalanceInfo;
pub use orders::RechargeOrder;
pub use sweeps::Sweep;
pub use wallets::UserWallet;

/// PostgreSQL unique_violation (23505)
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
