pub mod derivation;
pub mod order_status;
pub mod tx_build;

pub use derivation::KeyDeriver;
pub use order_status::OrderStatus;
