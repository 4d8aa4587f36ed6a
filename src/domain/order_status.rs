//! 充值订单状态机
//!
//! pending -> confirmed -> credited -> swept，只能前进不能回退。
//! 数据库层的条件更新是最终防线，这里的转换表用于入口校验与测试。

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// 充值订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// 已检测到转账，确认数不足
    Pending,
    /// 确认数达标，待入账
    Confirmed,
    /// 已计入用户余额
    Credited,
    /// 资金已归集到冷钱包
    Swept,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "credited" => Ok(OrderStatus::Credited),
            "swept" => Ok(OrderStatus::Swept),
            _ => Err(anyhow::anyhow!("Invalid order status: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Credited => "credited",
            OrderStatus::Swept => "swept",
        }
    }

    /// 状态转换是否合法（只进不退）
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Confirmed)
                | (OrderStatus::Confirmed, OrderStatus::Credited)
                | (OrderStatus::Credited, OrderStatus::Swept)
        )
    }

    /// 是否已入账（余额已变动，后续只剩归集）
    pub fn is_settled(&self) -> bool {
        matches!(self, OrderStatus::Credited | OrderStatus::Swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Credited));
        assert!(OrderStatus::Credited.can_transition_to(OrderStatus::Swept));
    }

    #[test]
    fn test_backward_and_skip_transitions_rejected() {
        assert!(!OrderStatus::Confirmed.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Credited.can_transition_to(OrderStatus::Confirmed));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Credited));
        assert!(!OrderStatus::Swept.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Swept));
    }

    #[test]
    fn test_round_trip_parse() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Credited,
            OrderStatus::Swept,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OrderStatus::parse("cancelled").is_err());
    }
}
